//! ConfigWatcherActor - hot reload of the persisted configuration
//!
//! Polls the config file's modification time. A changed file that parses and
//! validates replaces the live dispatch policy and scheduler interval; an
//! invalid one is logged and the previous values stay in effect. Endpoints,
//! ports and the storage backend are only read at startup.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::DispatchPolicy;
use super::messages::ConfigWatcherCommand;
use crate::config::{EnvOverrides, PersistedConfig, read_config_file};

/// Receivers for the settings that can change at runtime
#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub policy: watch::Receiver<DispatchPolicy>,
    pub scheduler_interval: watch::Receiver<Duration>,
}

impl LiveSettings {
    /// Settings fixed at `config`, for processes without a config file
    pub fn fixed(config: &PersistedConfig) -> Self {
        let (_, policy) = watch::channel(config.dispatch.policy());
        let (_, scheduler_interval) = watch::channel(config.scheduler.interval());
        Self {
            policy,
            scheduler_interval,
        }
    }
}

pub struct ConfigWatcherActor {
    path: PathBuf,
    overrides: EnvOverrides,
    modified: Option<SystemTime>,
    period: Duration,
    policy_tx: watch::Sender<DispatchPolicy>,
    interval_tx: watch::Sender<Duration>,
    command_rx: mpsc::Receiver<ConfigWatcherCommand>,
}

impl ConfigWatcherActor {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn run(mut self) {
        debug!("starting config watcher actor");

        let mut ticker = interval(self.period);
        // The first tick completes immediately; the startup config is already live.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.file_changed() {
                        continue;
                    }
                    if let Err(e) = self.reload() {
                        error!("ignoring invalid config: {e:#}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ConfigWatcherCommand::ReloadNow { respond_to } => {
                            debug!("received ReloadNow command");
                            self.file_changed();
                            let _ = respond_to.send(self.reload());
                        }

                        ConfigWatcherCommand::Shutdown => {
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

        debug!("config watcher actor stopped");
    }

    fn modification_time(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    /// Record the current modification time; true when it moved
    fn file_changed(&mut self) -> bool {
        let modified = self.modification_time();
        if modified == self.modified {
            return false;
        }
        self.modified = modified;
        modified.is_some()
    }

    /// Apply the file if it validates; returns whether anything changed
    fn reload(&mut self) -> Result<bool> {
        let mut config = read_config_file(&self.path)?;
        config.apply_overrides(&self.overrides);
        config.validate().context("validating reloaded config")?;

        let policy = config.dispatch.policy();
        let scheduler_interval = config.scheduler.interval();

        let policy_changed = self.policy_tx.send_if_modified(|current| {
            let changed = *current != policy;
            *current = policy;
            changed
        });
        let interval_changed = self.interval_tx.send_if_modified(|current| {
            let changed = *current != scheduler_interval;
            *current = scheduler_interval;
            changed
        });

        if policy_changed {
            info!("dispatch policy reloaded: {policy:?}");
        }
        if interval_changed {
            info!("scheduler interval reloaded: {scheduler_interval:?}");
        }

        Ok(policy_changed || interval_changed)
    }
}

/// Handle for controlling a ConfigWatcherActor
#[derive(Clone)]
pub struct ConfigWatcherHandle {
    sender: mpsc::Sender<ConfigWatcherCommand>,
}

impl ConfigWatcherHandle {
    /// Watch `path`, starting from the already loaded `config`
    pub fn spawn(
        path: PathBuf,
        config: &PersistedConfig,
        overrides: EnvOverrides,
    ) -> (Self, LiveSettings) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (policy_tx, policy) = watch::channel(config.dispatch.policy());
        let (interval_tx, scheduler_interval) = watch::channel(config.scheduler.interval());

        let mut actor = ConfigWatcherActor {
            path,
            overrides,
            modified: None,
            period: config.reload_interval(),
            policy_tx,
            interval_tx,
            command_rx: cmd_rx,
        };
        actor.modified = actor.modification_time();
        tokio::spawn(actor.run());

        (
            Self { sender: cmd_tx },
            LiveSettings {
                policy,
                scheduler_interval,
            },
        )
    }

    pub async fn reload_now(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConfigWatcherCommand::ReloadNow { respond_to: tx })
            .await
            .context("config watcher is gone")?;

        rx.await.context("config watcher dropped the request")?
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ConfigWatcherCommand::Shutdown).await;
    }
}
