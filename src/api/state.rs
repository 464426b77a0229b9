//! API shared state

use std::sync::Arc;

use tracing::debug;

use crate::WorkMessage;
use crate::drivers::DriverManager;
use crate::retry::{BackendHealth, RetryPolicy, retry_transient};
use crate::storage::MetadataStore;
use crate::transport::{Destination, Envelope, PublishOptions, Transport, TransportResult};

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Storage registry read by the listing endpoints
    pub store: Arc<dyn MetadataStore>,

    /// Publisher for work messages; also serves the dead-letter view
    pub transport: Arc<dyn Transport>,

    /// Used to reject registrations no driver exists for
    pub drivers: Arc<DriverManager>,

    pub health: BackendHealth,
    pub retry: RetryPolicy,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn Transport>,
        drivers: Arc<DriverManager>,
        health: BackendHealth,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            drivers,
            health,
            retry,
        }
    }

    /// Publish `message` to the queue of the role that executes it
    pub async fn enqueue(&self, message: &WorkMessage) -> TransportResult<()> {
        let destination = Destination::queue(message.operation.queue());
        let envelope = Envelope::encode(message.id, message)?;

        retry_transient(&self.retry, &self.health, "enqueue", || {
            self.transport
                .publish(&destination, &envelope, PublishOptions::default())
        })
        .await?;

        debug!("enqueued {} for {} as {}", message.operation, message.target, message.id);
        Ok(())
    }
}
