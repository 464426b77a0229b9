//! In-memory transport (single process)
//!
//! Same delivery semantics as the durable backend (visibility timeout,
//! receipts, dedup by id, fan-out through bindings) without persistence.
//! Uses the tokio clock so visibility can be tested with paused time.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{
    DeadLetter, Delivery, Destination, Envelope, NackReason, PublishOptions, Transport,
};
use super::error::TransportResult;

#[derive(Debug)]
struct StoredMessage {
    envelope: Envelope,
    visible_at: Instant,
    deliveries: u32,
    failures: u32,
    contended: u32,
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, Vec<StoredMessage>>,
    bindings: HashMap<String, BTreeSet<String>>,
    dead_letters: Vec<DeadLetter>,
}

impl State {
    fn enqueue(&mut self, queue: &str, envelope: &Envelope, visible_at: Instant) -> bool {
        let messages = self.queues.entry(queue.to_string()).or_default();
        if messages.iter().any(|m| m.envelope.id == envelope.id) {
            return false;
        }

        messages.push(StoredMessage {
            envelope: envelope.clone(),
            visible_at,
            deliveries: 0,
            failures: 0,
            contended: 0,
            receipt: None,
        });
        true
    }

    fn find(&mut self, delivery: &Delivery) -> Option<(usize, &mut Vec<StoredMessage>)> {
        let messages = self.queues.get_mut(&delivery.queue)?;
        let index = messages.iter().position(|m| {
            m.envelope.id == delivery.envelope.id
                && m.receipt.as_deref() == Some(delivery.receipt.as_str())
        })?;
        Some((index, messages))
    }
}

pub struct MemoryTransport {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl MemoryTransport {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Try to take a visible message; otherwise report when the next one
    /// becomes visible.
    async fn try_take(&self, queue: &str) -> Result<Delivery, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(messages) = state.queues.get_mut(queue) else {
            return Err(None);
        };

        let Some(message) = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| m.visible_at)
        else {
            return Err(messages.iter().map(|m| m.visible_at).min());
        };

        let receipt = Uuid::new_v4().to_string();
        message.deliveries += 1;
        message.visible_at = now + self.visibility_timeout;
        message.receipt = Some(receipt.clone());

        Ok(Delivery {
            queue: queue.to_string(),
            envelope: message.envelope.clone(),
            deliveries: message.deliveries,
            failures: message.failures,
            contended: message.contended,
            receipt,
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        destination: &Destination,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> TransportResult<()> {
        let visible_at = Instant::now() + options.delay;
        let mut state = self.state.lock().await;

        let queues: Vec<String> = match destination {
            Destination::Queue(queue) => vec![queue.clone()],
            Destination::Topic(topic) => state
                .bindings
                .get(topic)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default(),
        };

        if queues.is_empty() {
            debug!("no queue bound to {destination}, message {} dropped", envelope.id);
        }

        for queue in queues {
            if !state.enqueue(&queue, envelope, visible_at) {
                trace!("duplicate publish of {} to {queue} ignored", envelope.id);
            }
        }

        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn bind(&self, topic: &str, queue: &str) -> TransportResult<()> {
        self.state
            .lock()
            .await
            .bindings
            .entry(topic.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> TransportResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = match self.try_take(queue).await {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_visible) => next_visible,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        match state.find(delivery) {
            Some((index, messages)) => {
                messages.remove(index);
            }
            None => debug!("ack of {} with stale receipt ignored", delivery.id()),
        }
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: NackReason,
    ) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        if let Some((index, messages)) = state.find(delivery) {
            let message = &mut messages[index];
            message.receipt = None;
            message.visible_at = Instant::now() + delay;
            match reason {
                NackReason::Contended => message.contended += 1,
                NackReason::Failed(_) => message.failures += 1,
                NackReason::Released => {}
            }
        } else {
            debug!("nack of {} with stale receipt ignored", delivery.id());
        }

        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> TransportResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.find(delivery) {
            Some((index, messages)) => {
                messages[index].visible_at = Instant::now() + visibility;
                true
            }
            None => false,
        })
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        failures: u32,
        reason: &str,
    ) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        let Some((index, messages)) = state.find(delivery) else {
            debug!("dead-letter of {} with stale receipt ignored", delivery.id());
            return Ok(());
        };

        let message = messages.remove(index);
        state.dead_letters.retain(|d| {
            !(d.id == message.envelope.id && d.queue == delivery.queue)
        });
        state.dead_letters.push(DeadLetter {
            id: message.envelope.id,
            queue: delivery.queue.clone(),
            body: message.envelope.body,
            published_at: message.envelope.published_at,
            dead_lettered_at: Utc::now(),
            deliveries: message.deliveries,
            failures,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn dead_letters(&self, queue: Option<&str>) -> TransportResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|d| queue.is_none_or(|q| d.queue == q))
            .cloned()
            .collect())
    }

    async fn pending(&self, queue: &str) -> TransportResult<usize> {
        Ok(self
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |messages| messages.len()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const VISIBILITY: Duration = Duration::from_secs(60);

    fn envelope(n: u32) -> Envelope {
        Envelope::new(Uuid::new_v4(), json!({ "n": n }))
    }

    async fn publish(transport: &MemoryTransport, queue: &str, envelope: &Envelope) {
        transport
            .publish(&Destination::queue(queue), envelope, PublishOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_ack() {
        let transport = MemoryTransport::new(VISIBILITY);
        let sent = envelope(1);
        publish(&transport, "q", &sent).await;

        let delivery = transport.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.envelope, sent);
        assert_eq!(delivery.deliveries, 1);

        // In flight: invisible to others.
        assert!(transport.receive("q", Duration::ZERO).await.unwrap().is_none());

        transport.ack(&delivery).await.unwrap();
        assert_eq!(transport.pending("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_visibility_timeout() {
        let transport = MemoryTransport::new(VISIBILITY);
        publish(&transport, "q", &envelope(1)).await;

        let first = transport.receive("q", Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(transport.receive("q", Duration::ZERO).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = transport.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.envelope.id, first.envelope.id);
        assert_eq!(second.deliveries, 2);

        // The first consumer's late ack does not remove the redelivered message.
        transport.ack(&first).await.unwrap();
        assert_eq!(transport.pending("q").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_counts_and_delay() {
        let transport = MemoryTransport::new(VISIBILITY);
        publish(&transport, "q", &envelope(1)).await;

        let delivery = transport.receive("q", Duration::ZERO).await.unwrap().unwrap();
        transport
            .nack(&delivery, Duration::from_secs(5), NackReason::Contended)
            .await
            .unwrap();

        assert!(transport.receive("q", Duration::ZERO).await.unwrap().is_none());
        let delivery = transport
            .receive("q", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((delivery.contended, delivery.failures), (1, 0));

        transport
            .nack(&delivery, Duration::ZERO, NackReason::Failed("boom".into()))
            .await
            .unwrap();
        let delivery = transport.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!((delivery.contended, delivery.failures), (1, 1));
        assert_eq!(delivery.deliveries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_wakes_on_publish() {
        let transport = std::sync::Arc::new(MemoryTransport::new(VISIBILITY));

        let consumer = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive("q", Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        publish(&transport, "q", &envelope(7)).await;

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.envelope.body, json!({ "n": 7 }));
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_deduplicated() {
        let transport = MemoryTransport::new(VISIBILITY);
        let sent = envelope(1);
        publish(&transport, "q", &sent).await;
        publish(&transport, "q", &sent).await;

        assert_eq!(transport.pending("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_bound_queues() {
        let transport = MemoryTransport::new(VISIBILITY);
        transport.bind("events", "a").await.unwrap();
        transport.bind("events", "b").await.unwrap();
        transport.bind("events", "b").await.unwrap();

        transport
            .publish(&Destination::topic("events"), &envelope(1), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(transport.pending("a").await.unwrap(), 1);
        assert_eq!(transport.pending("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_message() {
        let transport = MemoryTransport::new(VISIBILITY);
        let sent = envelope(1);
        publish(&transport, "q", &sent).await;

        let delivery = transport.receive("q", Duration::ZERO).await.unwrap().unwrap();
        transport.dead_letter(&delivery, 5, "driver exploded").await.unwrap();

        assert_eq!(transport.pending("q").await.unwrap(), 0);
        let dead = transport.dead_letters(Some("q")).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, sent.id);
        assert_eq!(dead[0].failures, 5);
        assert_eq!(dead[0].reason, "driver exploded");
        assert!(transport.dead_letters(Some("other")).await.unwrap().is_empty());
    }
}
