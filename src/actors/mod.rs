//! Actor-based role internals
//!
//! Every long-running piece of a role process is an actor: an async task
//! owning its state, driven by an mpsc command channel and controlled through
//! a cloneable handle.
//!
//! ## Architecture Overview
//!
//! ```text
//!              ┌──────────────────┐   watch (policy, interval)
//!              │  ConfigWatcher   │───────────────┬──────────────────┐
//!              └──────────────────┘               │                  │
//!                                                 ▼                  ▼
//!  delfin.task / delfin.alert ──► ┌──────────────────┐     ┌──────────────────┐
//!                                 │  DispatchActor   │     │  SchedulerActor  │──► delfin.task
//!                                 │ (DispatchCore +  │     │ (delfin/scheduler│
//!                                 │  worker pool)    │     │  lock holder)    │
//!                                 └────────┬─────────┘     └──────────────────┘
//!                                          │ AlertEvents
//!                                          ▼
//!                                   delfin.events ──► delfin.exporter ──► ┌───────────────┐
//!                                                                         │ ExporterActor │──► sinks
//!                                                                         └───────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **DispatchActor**: consumes a work queue, one lock-guarded session per delivery
//! - **SchedulerActor**: periodically enqueues resource syncs (Task role)
//! - **ExporterActor**: exports alert events to log and webhook sinks
//! - **ConfigWatcherActor**: hot reload of retry and scheduling settings
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Settings**: watch channels carry reloaded configuration
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod config_watcher;
pub mod dispatch;
pub mod exporter;
pub mod messages;
pub mod scheduler;
