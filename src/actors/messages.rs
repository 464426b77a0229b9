//! Message types for actor communication
//!
//! Every actor is driven through an mpsc command channel; queries carry a
//! oneshot sender for the reply.

use tokio::sync::oneshot;

/// Commands that can be sent to a DispatchActor
#[derive(Debug)]
pub enum DispatchCommand {
    GetStats {
        respond_to: oneshot::Sender<DispatchStats>,
    },

    /// Stop consuming; replies once in-flight sessions are settled
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Session counters of one dispatch core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub committed: u64,
    pub contended: u64,
    pub failed: u64,
    pub lease_lost: u64,
    pub dead_lettered: u64,

    /// Sessions abandoned because a backend was unreachable
    pub abandoned: u64,
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run one producer tick now
    ///
    /// Replies with the number of messages enqueued, `None` when another
    /// instance holds the scheduler lock.
    TickNow {
        respond_to: oneshot::Sender<anyhow::Result<Option<usize>>>,
    },

    Shutdown,
}

/// Commands that can be sent to the ExporterActor
#[derive(Debug)]
pub enum ExporterCommand {
    GetStats {
        respond_to: oneshot::Sender<ExporterStats>,
    },

    Shutdown { respond_to: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterStats {
    pub exported: u64,

    /// Export attempts that failed and were handed back for redelivery
    pub failed: u64,

    /// Undecodable events moved to the dead-letter area
    pub dead_lettered: u64,
}

/// Commands that can be sent to the ConfigWatcherActor
#[derive(Debug)]
pub enum ConfigWatcherCommand {
    /// Re-read the file now, regardless of its modification time
    ///
    /// Replies whether a new configuration was applied.
    ReloadNow {
        respond_to: oneshot::Sender<anyhow::Result<bool>>,
    },

    Shutdown,
}
