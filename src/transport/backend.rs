//! Transport trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::error::{TransportError, TransportResult};

/// Where a message is published to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point: exactly one consumer of the queue gets each message
    Queue(String),

    /// Fan-out: one copy per queue bound to the topic
    Topic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{name}"),
            Destination::Topic(name) => write!(f, "topic:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Keep the message invisible for this long after publishing
    pub delay: Duration,
}

/// A published message
///
/// The id identifies the message across redeliveries and is the
/// deduplication key: publishing the same id to the same queue twice keeps a
/// single copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub body: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(id: Uuid, body: serde_json::Value) -> Self {
        Self {
            id,
            body,
            published_at: Utc::now(),
        }
    }

    pub fn encode<T: Serialize>(id: Uuid, message: &T) -> TransportResult<Self> {
        let body = serde_json::to_value(message)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        Ok(Self::new(id, body))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| TransportError::Serialization(e.to_string()))
    }
}

/// One delivery of an envelope to a consumer
///
/// Holds the receipt that has to be presented to settle the delivery. Once
/// the visibility timeout elapsed the message may be handed to another
/// consumer with a new receipt, and settling with the old one is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    pub envelope: Envelope,

    /// Times the message was handed out, this delivery included
    pub deliveries: u32,

    /// Nacks caused by processing failures
    pub failures: u32,

    /// Nacks caused by lock contention
    pub contended: u32,

    pub receipt: String,
}

impl Delivery {
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }
}

/// Why a delivery is handed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackReason {
    /// The target was locked by someone else; not a failure
    Contended,

    /// Processing failed with this error
    Failed(String),

    /// Handed back unprocessed (shutdown, lease lost before commit)
    Released,
}

/// A message moved to the holding area
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub queue: String,
    pub body: serde_json::Value,
    pub published_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub deliveries: u32,
    pub failures: u32,
    pub reason: String,
}

/// Durable at-least-once message transport
///
/// A message stays stored until it is acked or dead-lettered. Received but
/// unsettled messages become visible again after the visibility timeout, so a
/// consumer that dies mid-processing never loses work; every delivery may
/// therefore be a duplicate.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        destination: &Destination,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> TransportResult<()>;

    /// Route future publishes on `topic` to `queue` as well (idempotent)
    async fn bind(&self, topic: &str, queue: &str) -> TransportResult<()>;

    /// Take the next visible message of `queue`, waiting up to `wait`
    async fn receive(&self, queue: &str, wait: Duration) -> TransportResult<Option<Delivery>>;

    /// Remove a processed message
    async fn ack(&self, delivery: &Delivery) -> TransportResult<()>;

    /// Hand a message back for redelivery after `delay`
    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: NackReason,
    ) -> TransportResult<()>;

    /// Push back the visibility deadline of a delivery still being processed
    ///
    /// Returns `false` when the receipt is no longer current.
    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> TransportResult<bool>;

    /// Move a message to the dead-letter holding area
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        failures: u32,
        reason: &str,
    ) -> TransportResult<()>;

    /// Dead letters, newest first, optionally restricted to one queue
    async fn dead_letters(&self, queue: Option<&str>) -> TransportResult<Vec<DeadLetter>>;

    /// Stored (visible or in-flight) messages of a queue
    async fn pending(&self, queue: &str) -> TransportResult<usize>;

    /// Short backend name for logging
    fn name(&self) -> &'static str;
}
