//! Transport client
//!
//! Durable at-least-once delivery between roles: point-to-point queues for
//! work messages, fan-out topics (bound to queues) for alert events.
//!
//! ## Backends
//!
//! - **SQLite** (`sqlite:///path`): durable queue table on the shared volume
//! - **Memory** (`memory://`): single process only, used by tests
//!
//! Consumers use [`subscribe`], which runs a receive loop and hands every
//! delivery to a [`DeliveryHandler`]. The handler settles the delivery itself
//! (`ack`, `nack` or `dead_letter`); anything it leaves unsettled is
//! redelivered after the visibility timeout.

pub mod backend;
pub mod error;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

pub use backend::{
    DeadLetter, Delivery, Destination, Envelope, NackReason, PublishOptions, Transport,
};
pub use error::{TransportError, TransportResult};

use crate::config::TransportEndpoint;
use crate::retry::{BackendHealth, RetryPolicy, retry_transient};

/// Build the transport named by `endpoint`
pub async fn connect(
    endpoint: &TransportEndpoint,
    visibility_timeout: Duration,
) -> TransportResult<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match endpoint {
        TransportEndpoint::Sqlite { path } => {
            Arc::new(sqlite::SqliteTransport::new(path, visibility_timeout).await?)
        }
        TransportEndpoint::Memory => Arc::new(memory::MemoryTransport::new(visibility_timeout)),
    };

    Ok(transport)
}

/// Per-delivery callback of a [`Subscription`]
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Deliveries processed at the same time
    pub concurrency: usize,

    /// Long-poll duration of a single receive call
    pub poll_wait: Duration,

    /// Retry budget for receive calls while the backend is down
    pub retry: RetryPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_wait: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// A running consumer of one queue
pub struct Subscription {
    queue: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop receiving and wait until in-flight deliveries are handled
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("subscription to {} ended abnormally: {e}", self.queue);
        }
    }

    /// Whether the receive loop stopped on its own (backend gave up)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Consume `queue`, invoking `handler` for every delivery
///
/// At most `options.concurrency` handlers run at once. A receive that keeps
/// failing past the retry budget marks `health` unhealthy and ends the loop.
pub fn subscribe(
    transport: Arc<dyn Transport>,
    queue: impl Into<String>,
    handler: Arc<dyn DeliveryHandler>,
    options: SubscribeOptions,
    health: BackendHealth,
) -> Subscription {
    let queue = queue.into();
    let cancel = CancellationToken::new();
    let concurrency = options.concurrency.max(1);

    let task = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        let span = info_span!("subscription", queue = %queue);
        tokio::spawn(
            async move {
                let permits = Arc::new(Semaphore::new(concurrency));
                info!("consuming with concurrency {concurrency}");

                loop {
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    let received = tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = retry_transient(&options.retry, &health, "receive", || {
                            transport.receive(&queue, options.poll_wait)
                        }) => received,
                    };

                    let delivery = match received {
                        Ok(Some(delivery)) => delivery,
                        Ok(None) => continue,
                        Err(e) if health.is_healthy() => {
                            error!("receive failed: {e}");
                            continue;
                        }
                        Err(e) => {
                            error!("giving up on queue: {e}");
                            break;
                        }
                    };

                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle(delivery).await;
                        drop(permit);
                    });
                }

                // Wait for in-flight handlers.
                let _ = permits.acquire_many(concurrency as u32).await;
                debug!("subscription stopped");
            }
            .instrument(span),
        )
    };

    Subscription {
        queue,
        cancel,
        task,
    }
}
