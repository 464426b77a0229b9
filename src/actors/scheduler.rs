//! SchedulerActor - periodic producer of `sync_resources` work
//!
//! Every Task role instance runs one, but only the holder of the
//! `delfin/scheduler` lock produces. The lock is taken with a stable owner per
//! instance and re-acquired on every tick, which doubles as the renewal; if the
//! holder dies the lease runs out and another instance takes over on its next
//! tick.
//!
//! ```text
//! Timer tick → acquire delfin/scheduler → list storages → publish sync_resources → delfin.task
//!     ↑
//!     └─── Commands (TickNow, Shutdown), interval updates from the config watcher
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::SchedulerCommand;
use crate::coordination::{Acquire, Coordinator};
use crate::retry::{BackendHealth, RetryPolicy, retry_transient};
use crate::storage::MetadataStore;
use crate::transport::{Destination, Envelope, PublishOptions, Transport};
use crate::{Operation, TASK_QUEUE, WorkMessage};

/// Coordination key of the periodic producer
pub const SCHEDULER_LOCK: &str = "delfin/scheduler";

/// Actor that enqueues a resource sync for every registered storage
pub struct SchedulerActor {
    store: Arc<dyn MetadataStore>,
    coordinator: Arc<dyn Coordinator>,
    transport: Arc<dyn Transport>,

    /// Lock owner, stable for the lifetime of the process
    owner: String,

    interval_rx: watch::Receiver<Duration>,
    retry: RetryPolicy,
    health: BackendHealth,
    command_rx: mpsc::Receiver<SchedulerCommand>,
}

impl SchedulerActor {
    /// Lease of the scheduler lock for a given tick interval
    ///
    /// Two intervals, so one late tick does not hand production over.
    pub fn lease_for(interval: Duration) -> Duration {
        (interval * 2).max(Duration::from_secs(2))
    }

    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn run(mut self) {
        debug!("starting scheduler actor");

        let mut period = *self.interval_rx.borrow();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watch_closed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(period).await {
                        Ok(Some(count)) => debug!("enqueued {count} syncs"),
                        Ok(None) => trace!("not the scheduler holder"),
                        Err(e) => error!("scheduler tick failed: {e:#}"),
                    }
                }

                changed = self.interval_rx.changed(), if !watch_closed => {
                    if changed.is_err() {
                        // No config watcher; the interval stays fixed.
                        debug!("interval channel closed, keeping {period:?}");
                        watch_closed = true;
                        continue;
                    }
                    let updated = *self.interval_rx.borrow_and_update();
                    if updated != period {
                        info!("scheduler interval changed to {updated:?}");
                        period = updated;
                        ticker = interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::TickNow { respond_to } => {
                            debug!("received TickNow command");
                            let _ = respond_to.send(self.tick(period).await);
                        }

                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("scheduler actor stopped");
    }

    /// One production round; `None` when another instance holds the lock
    async fn tick(&self, period: Duration) -> Result<Option<usize>> {
        let lease = Self::lease_for(period);
        let acquired = retry_transient(&self.retry, &self.health, "acquire scheduler lock", || {
            self.coordinator.acquire(SCHEDULER_LOCK, &self.owner, lease)
        })
        .await
        .context("scheduler lock")?;

        if let Acquire::Busy { holder } = acquired {
            trace!("scheduler lock held by {holder:?}");
            return Ok(None);
        }

        let storages = self
            .store
            .list_storages()
            .await
            .context("listing storages")?;

        let destination = Destination::queue(TASK_QUEUE);
        for storage in &storages {
            let message = WorkMessage::new(&storage.id, Operation::SyncResources, json!({}));
            let envelope = Envelope::encode(message.id, &message)?;

            retry_transient(&self.retry, &self.health, "publish sync", || {
                self.transport
                    .publish(&destination, &envelope, PublishOptions::default())
            })
            .await
            .with_context(|| format!("enqueueing sync of {}", storage.id))?;
        }

        Ok(Some(storages.len()))
    }
}

/// Handle for controlling a SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        store: Arc<dyn MetadataStore>,
        coordinator: Arc<dyn Coordinator>,
        transport: Arc<dyn Transport>,
        instance_id: &str,
        interval_rx: watch::Receiver<Duration>,
        retry: RetryPolicy,
        health: BackendHealth,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = SchedulerActor {
            store,
            coordinator,
            transport,
            owner: format!("{instance_id}/scheduler"),
            interval_rx,
            retry,
            health,
            command_rx: cmd_rx,
        };
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run a production round now
    pub async fn tick_now(&self) -> Result<Option<usize>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await
            .context("scheduler actor is gone")?;

        rx.await.context("scheduler actor dropped the request")?
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}
