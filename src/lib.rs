pub mod actors;
pub mod api;
pub mod config;
pub mod coordination;
pub mod drivers;
pub mod error;
pub mod handlers;
pub mod retry;
pub mod runtime;
pub mod storage;
pub mod transport;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue consumed by the Task role
pub const TASK_QUEUE: &str = "delfin.task";

/// Queue consumed by the Alert role
pub const ALERT_QUEUE: &str = "delfin.alert";

/// Queue consumed by the Exporter role (bound to [`EVENTS_TOPIC`])
pub const EXPORTER_QUEUE: &str = "delfin.exporter";

/// Fan-out topic carrying [`AlertEvent`]s
pub const EVENTS_TOPIC: &str = "delfin.events";

/// One independently deployed process type of the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Api,
    Task,
    Alert,
    Exporter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Api => "api",
            Role::Task => "task",
            Role::Alert => "alert",
            Role::Exporter => "exporter",
        }
    }

    /// Whether the role mounts the shared metadata volume.
    ///
    /// The exporter is stateless with respect to durable state.
    pub fn uses_metadata_store(&self) -> bool {
        !matches!(self, Role::Exporter)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work carried by a [`WorkMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Register a storage (or refresh its registration) through its driver
    Discover,

    /// Refresh pools and volumes of a registered storage
    SyncResources,

    /// Delete all metadata of a storage
    RemoveResources,

    /// Drop the cached driver instance of a storage
    RemoveFromCache,

    /// Turn a raw alert into an [`AlertEvent`]
    ProcessAlert,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Discover => "discover",
            Operation::SyncResources => "sync_resources",
            Operation::RemoveResources => "remove_resources",
            Operation::RemoveFromCache => "remove_from_cache",
            Operation::ProcessAlert => "process_alert",
        }
    }

    /// Queue of the role that executes this operation
    pub fn queue(&self) -> &'static str {
        match self {
            Operation::ProcessAlert => ALERT_QUEUE,
            _ => TASK_QUEUE,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of dispatched work
///
/// The delivery count is tracked by the transport, not by the message body,
/// so that redeliveries never rewrite the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessage {
    /// Unique message id (stable across redeliveries)
    pub id: Uuid,

    /// Resource the work applies to (storage id)
    pub target: String,

    /// What to do with the target
    pub operation: Operation,

    /// Operation specific input
    #[serde(default)]
    pub payload: serde_json::Value,

    /// When the work was requested; used for idempotent re-checks
    pub requested_at: DateTime<Utc>,
}

impl WorkMessage {
    pub fn new(
        target: impl Into<String>,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            operation,
            payload,
            requested_at: Utc::now(),
        }
    }

    /// Coordination key guarding every session on this message's target
    pub fn lock_key(&self) -> String {
        format!("storage/{}", self.target)
    }
}

/// Severity of an [`AlertEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Minor => "minor",
            Severity::Major => "major",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "minor" => Ok(Severity::Minor),
            "major" => Ok(Severity::Major),
            "critical" | "fatal" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Alert produced by the Alert role (or by a storage status change)
///
/// Immutable once published. The id is derived from the producing work
/// message so that a redelivered message yields the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub severity: Severity,

    /// Resource (storage id) the alert originates from
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,

    pub storage_name: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
}
