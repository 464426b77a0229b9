//! Dispatch core - lock-guarded processing of work messages
//!
//! Shared by the Task and Alert roles. Every delivery runs one session:
//!
//! ```text
//! RECEIVED ──► LOCK_PENDING ──Busy──► nack(busy backoff)            (not a failure)
//!                   │
//!                acquired
//!                   ▼
//!                LOCKED ──► EXECUTING ──ok──► COMMITTED   (commit, publish, release, ack)
//!                              │
//!                              ├─error──► FAILED        (release, nack(failure backoff))
//!                              │            └─ failures ≥ max_retries ──► DEADLETTERED
//!                              └─lease lost──► FAILED   (nothing written, nack)
//! ```
//!
//! While a session holds its lock a watchdog renews the lease every third of
//! the lease duration. When a renewal reports `Lost` (or renewals keep failing
//! past the last confirmed expiry) the session is cancelled before anything
//! is written.
//!
//! The lock owner of a session is `"{instance_id}/{session_uuid}"`, so two
//! deliveries for the same target inside one process exclude each other just
//! like deliveries in different processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::messages::{DispatchCommand, DispatchStats};
use crate::coordination::{Acquire, Coordinator, LockHandle, Renewal};
use crate::handlers::WorkHandler;
use crate::retry::{BackendHealth, BackoffPolicy, RetryPolicy, retry_transient};
use crate::transport::{
    Delivery, DeliveryHandler, Destination, Envelope, NackReason, PublishOptions,
    SubscribeOptions, Subscription, Transport, TransportResult, subscribe,
};
use crate::error::OperationError;
use crate::{AlertEvent, EVENTS_TOPIC, WorkMessage};

/// Retry and lease settings of the dispatch core (hot reloadable)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Failed attempts after which a message is dead-lettered
    pub max_retries: u32,
    pub lease: Duration,
    pub busy_backoff: BackoffPolicy,
    pub failure_backoff: BackoffPolicy,
}

impl DispatchPolicy {
    /// Watchdog period, well below half the lease
    pub fn renew_interval(&self) -> Duration {
        self.lease / 3
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        crate::config::DispatchConfig::default().policy()
    }
}

/// States of one processing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Received,
    LockPending,
    Locked,
    Executing,
    Committed,
    Failed,
    DeadLettered,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Received => "RECEIVED",
            SessionState::LockPending => "LOCK_PENDING",
            SessionState::Locked => "LOCKED",
            SessionState::Executing => "EXECUTING",
            SessionState::Committed => "COMMITTED",
            SessionState::Failed => "FAILED",
            SessionState::DeadLettered => "DEADLETTERED",
        }
    }

    /// The message is settled for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::DeadLettered)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Received, LockPending) => true,
            (LockPending, Locked) => true,
            (Locked, Executing) => true,
            (Executing, Committed) => true,
            (Failed, DeadLettered) => true,
            // Poison messages never reach the lock.
            (Received, DeadLettered) => true,
            (state, Failed) => !state.is_terminal() && *state != Failed,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Committed { events: usize },

    /// Target locked elsewhere; redelivered after `retry_in`
    Contended { retry_in: Duration },

    /// Handler failed; redelivered after `retry_in`
    Failed { retry_in: Duration, error: String },

    /// Lease lost before commit; redelivered without counting a failure
    LeaseLost,

    DeadLettered { reason: String },

    /// A backend was unreachable; the message is left to redelivery
    Abandoned { reason: String },
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Committed { .. } => SessionState::Committed,
            SessionOutcome::DeadLettered { .. } => SessionState::DeadLettered,
            SessionOutcome::Contended { .. } => SessionState::LockPending,
            SessionOutcome::Failed { .. }
            | SessionOutcome::LeaseLost
            | SessionOutcome::Abandoned { .. } => SessionState::Failed,
        }
    }
}

/// Transition log of one session
struct Session {
    message_id: Uuid,
    state: SessionState,
}

impl Session {
    fn new(message_id: Uuid) -> Self {
        trace!("{message_id}: {}", SessionState::Received);
        Self {
            message_id,
            state: SessionState::Received,
        }
    }

    fn enter(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "{}: unexpected transition {} -> {}",
                self.message_id, self.state, next
            );
        }
        debug!("{}: {} -> {}", self.message_id, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    committed: AtomicU64,
    contended: AtomicU64,
    failed: AtomicU64,
    lease_lost: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &SessionOutcome) {
        let counter = match outcome {
            SessionOutcome::Committed { .. } => &self.committed,
            SessionOutcome::Contended { .. } => &self.contended,
            SessionOutcome::Failed { .. } => &self.failed,
            SessionOutcome::LeaseLost => &self.lease_lost,
            SessionOutcome::DeadLettered { .. } => &self.dead_lettered,
            SessionOutcome::Abandoned { .. } => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Keeps a lease alive in the background while a session runs
struct LeaseWatchdog {
    lost: CancellationToken,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseWatchdog {
    fn start(
        coordinator: Arc<dyn Coordinator>,
        transport: Arc<dyn Transport>,
        handle: LockHandle,
        delivery: Delivery,
        lease: Duration,
        visibility: Duration,
    ) -> Self {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let interval = (lease / 3).max(Duration::from_millis(10));

        let task = {
            let lost = lost.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut held_until = Instant::now() + lease;

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    match coordinator.renew(&handle, lease).await {
                        Ok(Renewal::Renewed { .. }) => {
                            trace!("renewed {}", handle.key);
                            held_until = Instant::now() + lease;
                            if let Err(e) = transport.extend(&delivery, visibility).await {
                                debug!("could not extend visibility of {}: {e}", delivery.id());
                            }
                        }
                        Ok(Renewal::Lost) => {
                            warn!("lease on {} lost", handle.key);
                            lost.cancel();
                            return;
                        }
                        Err(e) if Instant::now() + interval >= held_until => {
                            warn!("cannot renew {} before it expires: {e}", handle.key);
                            lost.cancel();
                            return;
                        }
                        Err(e) => warn!("renewal of {} failed, will retry: {e}", handle.key),
                    }
                }
            })
        };

        Self { lost, stop, task }
    }

    fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    async fn stop(mut self) {
        self.stop.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for LeaseWatchdog {
    // A dropped session must not keep its lease alive.
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Lock-guarded executor of one role's work handler
pub struct DispatchCore<H: WorkHandler> {
    handler: Arc<H>,
    coordinator: Arc<dyn Coordinator>,
    transport: Arc<dyn Transport>,
    policy: watch::Receiver<DispatchPolicy>,
    instance_id: String,
    retry: RetryPolicy,
    visibility_timeout: Duration,
    health: BackendHealth,
    counters: Counters,
}

impl<H: WorkHandler> DispatchCore<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: Arc<H>,
        coordinator: Arc<dyn Coordinator>,
        transport: Arc<dyn Transport>,
        policy: watch::Receiver<DispatchPolicy>,
        instance_id: impl Into<String>,
        retry: RetryPolicy,
        visibility_timeout: Duration,
        health: BackendHealth,
    ) -> Self {
        Self {
            handler,
            coordinator,
            transport,
            policy,
            instance_id: instance_id.into(),
            retry,
            visibility_timeout,
            health,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Run one session for `delivery` and settle it
    #[instrument(
        skip_all,
        fields(handler = self.handler.name(), id = %delivery.id(), delivery = delivery.deliveries)
    )]
    pub async fn process(&self, delivery: Delivery) -> SessionOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let policy = *self.policy.borrow();
        let mut session = Session::new(delivery.id());

        let outcome = self.run_session(&mut session, &policy, &delivery).await;
        self.counters.record(&outcome);
        outcome
    }

    async fn run_session(
        &self,
        session: &mut Session,
        policy: &DispatchPolicy,
        delivery: &Delivery,
    ) -> SessionOutcome {
        let message: WorkMessage = match delivery.envelope.decode() {
            Ok(message) => message,
            Err(e) => {
                let reason = format!("undecodable work message: {e}");
                session.enter(SessionState::DeadLettered);
                return self.dead_letter(delivery, delivery.failures, reason).await;
            }
        };

        session.enter(SessionState::LockPending);
        let key = message.lock_key();
        let owner = format!("{}/{}", self.instance_id, Uuid::new_v4());

        let acquired = retry_transient(&self.retry, &self.health, "acquire", || {
            self.coordinator.acquire(&key, &owner, policy.lease)
        })
        .await;

        let handle = match acquired {
            Ok(Acquire::Acquired(handle)) => handle,
            Ok(Acquire::Busy { holder }) => {
                let retry_in = policy.busy_backoff.delay(delivery.contended);
                debug!("{key} busy (held by {holder:?}), retry in {retry_in:?}");
                self.nack(delivery, retry_in, NackReason::Contended).await;
                return SessionOutcome::Contended { retry_in };
            }
            Err(e) => {
                session.enter(SessionState::Failed);
                error!("cannot reach coordination backend: {e}");
                self.nack(delivery, Duration::ZERO, NackReason::Released).await;
                return SessionOutcome::Abandoned {
                    reason: e.to_string(),
                };
            }
        };

        session.enter(SessionState::Locked);
        let watchdog = LeaseWatchdog::start(
            self.coordinator.clone(),
            self.transport.clone(),
            handle.clone(),
            delivery.clone(),
            policy.lease,
            self.visibility_timeout,
        );

        session.enter(SessionState::Executing);
        let executed = tokio::select! {
            _ = watchdog.lost.cancelled() => None,
            result = self.handler.execute(&message) => Some(result),
        };

        let result = match executed {
            None => Err(None),
            Some(Err(e)) => Err(Some(e)),
            Some(Ok(output)) => {
                if watchdog.is_lost() || !self.confirm_lease(&handle, policy.lease).await {
                    Err(None)
                } else {
                    self.handler.commit(&message, output).await.map_err(Some)
                }
            }
        };

        // Committed but not fully announced: hand the message back so a
        // redelivery republishes under the same event ids.
        let result = match result {
            Ok(events) => match self.publish_events(&events).await {
                Ok(()) => Ok(events),
                Err(e) => Err(Some(OperationError::recoverable(format!(
                    "events not published: {e}"
                )))),
            },
            Err(e) => Err(e),
        };

        watchdog.stop().await;
        self.release(&handle).await;

        match result {
            Ok(events) => {
                self.ack(delivery).await;
                session.enter(SessionState::Committed);
                info!(
                    "committed {} on {} ({} events)",
                    message.operation,
                    message.target,
                    events.len()
                );
                SessionOutcome::Committed {
                    events: events.len(),
                }
            }
            Err(None) => {
                session.enter(SessionState::Failed);
                warn!("lease on {key} lost, aborting without commit");
                self.nack(delivery, Duration::ZERO, NackReason::Released).await;
                SessionOutcome::LeaseLost
            }
            Err(Some(e)) => {
                session.enter(SessionState::Failed);
                let failures = delivery.failures + 1;

                if e.is_permanent() || failures >= policy.max_retries {
                    session.enter(SessionState::DeadLettered);
                    self.dead_letter(delivery, failures, e.to_string()).await
                } else {
                    let retry_in = policy.failure_backoff.delay(delivery.failures);
                    warn!(
                        "{} on {} failed ({failures}/{}), retry in {retry_in:?}: {e}",
                        message.operation, message.target, policy.max_retries
                    );
                    self.nack(delivery, retry_in, NackReason::Failed(e.to_string()))
                        .await;
                    SessionOutcome::Failed {
                        retry_in,
                        error: e.to_string(),
                    }
                }
            }
        }
    }

    /// One last renewal right before commit
    async fn confirm_lease(&self, handle: &LockHandle, lease: Duration) -> bool {
        match self.coordinator.renew(handle, lease).await {
            Ok(Renewal::Renewed { .. }) => true,
            Ok(Renewal::Lost) => false,
            Err(e) => {
                warn!("cannot confirm lease on {}: {e}", handle.key);
                false
            }
        }
    }

    async fn publish_events(&self, events: &[AlertEvent]) -> TransportResult<()> {
        let destination = Destination::topic(EVENTS_TOPIC);

        for event in events {
            let envelope = Envelope::encode(event.id, event)?;
            retry_transient(&self.retry, &self.health, "publish", || {
                self.transport
                    .publish(&destination, &envelope, PublishOptions::default())
            })
            .await
            .inspect_err(|e| error!("event {} not published: {e}", event.id))?;
        }

        Ok(())
    }

    async fn release(&self, handle: &LockHandle) {
        if let Err(e) = self.coordinator.release(handle).await {
            // The lease runs out on its own.
            warn!("release of {} failed: {e}", handle.key);
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = retry_transient(&self.retry, &self.health, "ack", || {
            self.transport.ack(delivery)
        })
        .await
        {
            error!("ack of {} failed, expect a redelivery: {e}", delivery.id());
        }
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration, reason: NackReason) {
        if let Err(e) = retry_transient(&self.retry, &self.health, "nack", || {
            self.transport.nack(delivery, delay, reason.clone())
        })
        .await
        {
            error!("nack of {} failed: {e}", delivery.id());
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, failures: u32, reason: String) -> SessionOutcome {
        error!("dead-lettering {} after {failures} failures: {reason}", delivery.id());

        if let Err(e) = retry_transient(&self.retry, &self.health, "dead_letter", || {
            self.transport.dead_letter(delivery, failures, &reason)
        })
        .await
        {
            error!("dead-letter of {} failed: {e}", delivery.id());
            return SessionOutcome::Abandoned {
                reason: e.to_string(),
            };
        }

        SessionOutcome::DeadLettered { reason }
    }
}

#[async_trait]
impl<H: WorkHandler> DeliveryHandler for DispatchCore<H> {
    async fn handle(&self, delivery: Delivery) {
        let outcome = self.process(delivery).await;
        trace!("session ended: {outcome:?}");
    }
}

/// Actor owning a dispatch core and its queue subscription
pub struct DispatchActor<H: WorkHandler> {
    core: Arc<DispatchCore<H>>,
    subscription: Subscription,
    command_rx: mpsc::Receiver<DispatchCommand>,
}

impl<H: WorkHandler> DispatchActor<H> {
    #[instrument(skip(self), fields(queue = %self.subscription.queue()))]
    pub async fn run(mut self) {
        debug!("starting dispatch actor");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                DispatchCommand::GetStats { respond_to } => {
                    let _ = respond_to.send(self.core.stats());
                }
                DispatchCommand::Shutdown { respond_to } => {
                    debug!("received shutdown command");
                    self.subscription.shutdown().await;
                    let _ = respond_to.send(());
                    debug!("dispatch actor stopped");
                    return;
                }
            }
        }

        warn!("command channel closed, shutting down");
        self.subscription.shutdown().await;
    }
}

/// Handle for controlling a DispatchActor
#[derive(Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<DispatchCommand>,
}

impl DispatchHandle {
    /// Subscribe `core` to `queue` and spawn the actor
    pub fn spawn<H: WorkHandler>(
        core: DispatchCore<H>,
        queue: &str,
        options: SubscribeOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let core = Arc::new(core);
        let subscription = subscribe(
            core.transport.clone(),
            queue,
            core.clone(),
            options,
            core.health.clone(),
        );

        let actor = DispatchActor {
            core,
            subscription,
            command_rx: cmd_rx,
        };
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn get_stats(&self) -> Option<DispatchStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatchCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Stop consuming and wait for in-flight sessions
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(DispatchCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
