//! ExporterActor - ships alert events to external sinks
//!
//! Consumes `delfin.exporter`, which the actor binds to the `delfin.events`
//! topic on startup. No lock is taken: exporting is idempotent (every event
//! carries its stable id), so a duplicate delivery just exports twice.
//!
//! A sink failure nacks the delivery with the failure backoff; after
//! `max_retries` failed attempts the event is dead-lettered like any other
//! work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::DispatchPolicy;
use super::messages::{ExporterCommand, ExporterStats};
use crate::retry::{BackendHealth, RetryPolicy, retry_transient};
use crate::transport::{
    Delivery, DeliveryHandler, NackReason, SubscribeOptions, Subscription, Transport, subscribe,
};
use crate::{AlertEvent, EVENTS_TOPIC, EXPORTER_QUEUE};

/// Destination of exported alert events
#[async_trait]
pub trait ExportSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn export(&self, event: &AlertEvent) -> Result<()>;
}

/// Writes every event as one structured log line
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ExportSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn export(&self, event: &AlertEvent) -> Result<()> {
        info!(
            target: "delfin::export",
            id = %event.id,
            severity = %event.severity,
            source = %event.source,
            storage = event.storage_name.as_deref().unwrap_or("-"),
            timestamp = %event.timestamp.to_rfc3339(),
            "{}",
            event.message
        );
        Ok(())
    }
}

/// POSTs every event as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ExportSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip_all, fields(id = %event.id))]
    async fn export(&self, event: &AlertEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("sending event to {}", self.url))?
            .error_for_status()
            .context("webhook rejected event")?;

        debug!("event posted to webhook");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    exported: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Per-delivery export logic
pub struct ExportCore {
    transport: Arc<dyn Transport>,
    sinks: Vec<Arc<dyn ExportSink>>,
    policy: watch::Receiver<DispatchPolicy>,
    retry: RetryPolicy,
    health: BackendHealth,
    counters: Counters,
}

impl ExportCore {
    pub fn new(
        transport: Arc<dyn Transport>,
        sinks: Vec<Arc<dyn ExportSink>>,
        policy: watch::Receiver<DispatchPolicy>,
        retry: RetryPolicy,
        health: BackendHealth,
    ) -> Self {
        Self {
            transport,
            sinks,
            policy,
            retry,
            health,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ExporterStats {
        ExporterStats {
            exported: self.counters.exported.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    #[instrument(skip_all, fields(id = %delivery.id()))]
    pub async fn process(&self, delivery: Delivery) {
        let policy = *self.policy.borrow();

        let event: AlertEvent = match delivery.envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                self.dead_letter(&delivery, delivery.failures, &format!("undecodable alert event: {e}"))
                    .await;
                return;
            }
        };

        let mut failure = None;
        for sink in &self.sinks {
            if let Err(e) = sink.export(&event).await {
                warn!("{} sink failed for {}: {e:#}", sink.name(), event.id);
                failure = Some(format!("{}: {e:#}", sink.name()));
                break;
            }
        }

        let Some(error) = failure else {
            self.counters.exported.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = retry_transient(&self.retry, &self.health, "ack", || {
                self.transport.ack(&delivery)
            })
            .await
            {
                error!("ack of {} failed, expect a redelivery: {e}", event.id);
            }
            return;
        };

        let failures = delivery.failures + 1;
        if failures >= policy.max_retries {
            self.dead_letter(&delivery, failures, &error).await;
            return;
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let retry_in = policy.failure_backoff.delay(delivery.failures);
        if let Err(e) = retry_transient(&self.retry, &self.health, "nack", || {
            self.transport
                .nack(&delivery, retry_in, NackReason::Failed(error.clone()))
        })
        .await
        {
            error!("nack of {} failed: {e}", event.id);
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, failures: u32, reason: &str) {
        error!("dead-lettering {} after {failures} failures: {reason}", delivery.id());
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = retry_transient(&self.retry, &self.health, "dead_letter", || {
            self.transport.dead_letter(delivery, failures, reason)
        })
        .await
        {
            error!("dead-letter of {} failed: {e}", delivery.id());
        }
    }
}

#[async_trait]
impl DeliveryHandler for ExportCore {
    async fn handle(&self, delivery: Delivery) {
        self.process(delivery).await;
    }
}

/// Actor owning the export subscription
pub struct ExporterActor {
    core: Arc<ExportCore>,
    subscription: Subscription,
    command_rx: mpsc::Receiver<ExporterCommand>,
}

impl ExporterActor {
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting exporter actor");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                ExporterCommand::GetStats { respond_to } => {
                    let _ = respond_to.send(self.core.stats());
                }
                ExporterCommand::Shutdown { respond_to } => {
                    debug!("received shutdown command");
                    self.subscription.shutdown().await;
                    let _ = respond_to.send(());
                    debug!("exporter actor stopped");
                    return;
                }
            }
        }

        warn!("command channel closed, shutting down");
        self.subscription.shutdown().await;
    }
}

/// Handle for controlling an ExporterActor
#[derive(Clone)]
pub struct ExporterHandle {
    sender: mpsc::Sender<ExporterCommand>,
}

impl ExporterHandle {
    /// Bind the events topic to the exporter queue and start consuming
    pub async fn spawn(core: ExportCore, options: SubscribeOptions) -> Result<Self> {
        let transport = core.transport.clone();
        retry_transient(&core.retry, &core.health, "bind", || {
            transport.bind(EVENTS_TOPIC, EXPORTER_QUEUE)
        })
        .await
        .context("binding events topic")?;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let core = Arc::new(core);
        let subscription = subscribe(
            transport,
            EXPORTER_QUEUE,
            core.clone(),
            options,
            core.health.clone(),
        );

        let actor = ExporterActor {
            core,
            subscription,
            command_rx: cmd_rx,
        };
        tokio::spawn(actor.run());

        Ok(Self { sender: cmd_tx })
    }

    pub async fn get_stats(&self) -> Option<ExporterStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ExporterCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ExporterCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
