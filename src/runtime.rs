//! Role runtime bootstrap
//!
//! Each binary calls [`init_tracing`] and then [`run`] with its role. `run`
//! loads the persisted configuration, connects the backends the role needs,
//! spawns the role's actors and blocks until ctrl-c, SIGTERM or the process
//! turning unhealthy. An unhealthy exit is an error, so the binary exits
//! non-zero and the orchestrator restarts it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::actors::config_watcher::{ConfigWatcherHandle, LiveSettings};
use crate::actors::dispatch::{DispatchCore, DispatchHandle};
use crate::actors::exporter::{ExportCore, ExportSink, ExporterHandle, LogSink, WebhookSink};
use crate::actors::scheduler::SchedulerHandle;
use crate::api::{self, ApiConfig, ApiState};
use crate::config::{self, EnvOverrides, PersistedConfig};
use crate::coordination::{self, Coordinator};
use crate::drivers::DriverManager;
use crate::handlers::{AlertHandler, StorageSyncHandler, WorkHandler};
use crate::retry::{BackendHealth, RetryPolicy};
use crate::storage::{self, MetadataStore};
use crate::transport::{self, SubscribeOptions, Transport};
use crate::util::{get_api_addr, get_log_level, instance_id};
use crate::{ALERT_QUEUE, Role, TASK_QUEUE};

/// Log level from `DELFIN_LOG`, `info` when unset or unknown
fn log_level() -> LevelFilter {
    get_log_level()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::INFO)
}

/// Install the stderr subscriber for `role`
///
/// Covers the library and the role's binary target (`delfin_api`, ...).
pub fn init_tracing(role: Role) {
    let level = log_level();
    let filter = filter::Targets::new().with_targets(vec![
        ("delfin".to_string(), level),
        (format!("delfin_{}", role.as_str()), level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

/// Everything a role needs before it connects its backends
pub struct Bootstrap {
    pub role: Role,
    pub config: PersistedConfig,
    pub config_path: Option<PathBuf>,
    pub overrides: EnvOverrides,
    pub instance_id: String,
    pub retry: RetryPolicy,
    pub health: BackendHealth,
    pub shutdown: CancellationToken,
}

impl Bootstrap {
    /// Load `.env`, the config file and the environment overrides
    ///
    /// Any configuration error is fatal here.
    pub fn load(role: Role, explicit_config: Option<&str>) -> Result<Self> {
        dotenv::dotenv().ok();

        let overrides = EnvOverrides::from_env();
        let config_path = config::resolve_path(explicit_config);
        let config = config::load_from(config_path.as_deref(), &overrides)
            .context("invalid configuration")?;

        let instance_id = instance_id();
        info!("{role} role starting as {instance_id}");
        debug!("configuration: {config:?}");

        Ok(Self {
            role,
            retry: config.backend_retry.policy(),
            config,
            config_path,
            overrides,
            instance_id,
            health: BackendHealth::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the config watcher, or fix the settings when there is no file
    fn live_settings(&self) -> (Option<ConfigWatcherHandle>, LiveSettings) {
        match &self.config_path {
            Some(path) => {
                let (watcher, live) =
                    ConfigWatcherHandle::spawn(path.clone(), &self.config, self.overrides.clone());
                (Some(watcher), live)
            }
            None => (None, LiveSettings::fixed(&self.config)),
        }
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            concurrency: self.config.dispatch.concurrency,
            retry: self.retry,
            ..SubscribeOptions::default()
        }
    }

    async fn coordinator(&self) -> Result<Arc<dyn Coordinator>> {
        let endpoint = self.config.coordination_endpoint()?;
        info!("coordination endpoint: {}", self.config.coordination.endpoint);
        coordination::connect(&endpoint)
            .await
            .context("connecting to coordination backend")
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>> {
        let endpoint = self.config.transport_endpoint()?;
        let transport = transport::connect(&endpoint, self.config.dispatch.visibility_timeout())
            .await
            .context("connecting to transport")?;
        info!("transport: {}", transport.name());
        Ok(transport)
    }

    async fn store(&self) -> Result<Arc<dyn MetadataStore>> {
        storage::open(&self.config.storage)
            .await
            .context("opening metadata store")
    }
}

/// Why a role stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Signal,
    Unhealthy(String),
}

/// Block until ctrl-c, SIGTERM or the process becoming unhealthy
pub async fn wait_for_exit(health: &BackendHealth) -> Exit {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("cannot listen for ctrl-c: {e}");
            }
            Exit::Signal
        }
        _ = terminate => Exit::Signal,
        reason = health.unhealthy() => Exit::Unhealthy(reason),
    }
}

fn finish(role: Role, exit: Exit) -> Result<()> {
    match exit {
        Exit::Signal => {
            info!("{role} role stopped");
            Ok(())
        }
        Exit::Unhealthy(reason) => bail!("{role} role unhealthy: {reason}"),
    }
}

/// Run `role` until it is asked to stop
pub async fn run(role: Role, explicit_config: Option<&str>) -> Result<()> {
    let boot = Bootstrap::load(role, explicit_config)?;

    match role {
        Role::Api => run_api(boot).await,
        Role::Task => run_task(boot).await,
        Role::Alert => run_alert(boot).await,
        Role::Exporter => run_exporter(boot).await,
    }
}

/// Inbound listener and publisher
pub async fn run_api(boot: Bootstrap) -> Result<()> {
    let store = boot.store().await?;
    let transport = boot.transport().await?;

    let state = ApiState::new(
        store.clone(),
        transport,
        Arc::new(DriverManager::new()),
        boot.health.clone(),
        boot.retry,
    );
    let config = ApiConfig {
        bind_addr: SocketAddr::from((get_api_addr(), boot.config.api.port)),
        auth_token: boot.config.api.token.clone(),
        enable_cors: true,
    };

    let (_, server) = api::spawn_api_server(config, state, boot.shutdown.clone()).await?;

    let exit = wait_for_exit(&boot.health).await;
    boot.shutdown.cancel();
    if let Err(e) = server.await {
        error!("API server task failed: {e}");
    }
    if let Err(e) = store.close().await {
        warn!("closing metadata store: {e}");
    }

    finish(boot.role, exit)
}

fn spawn_dispatch<H: WorkHandler>(
    boot: &Bootstrap,
    handler: H,
    queue: &str,
    coordinator: Arc<dyn Coordinator>,
    transport: Arc<dyn Transport>,
    live: &LiveSettings,
) -> DispatchHandle {
    let core = DispatchCore::new(
        Arc::new(handler),
        coordinator,
        transport,
        live.policy.clone(),
        boot.instance_id.clone(),
        boot.retry,
        boot.config.dispatch.visibility_timeout(),
        boot.health.clone(),
    );

    DispatchHandle::spawn(core, queue, boot.subscribe_options())
}

/// Dispatch core on `delfin.task` plus the periodic producer
pub async fn run_task(boot: Bootstrap) -> Result<()> {
    let store = boot.store().await?;
    let coordinator = boot.coordinator().await?;
    let transport = boot.transport().await?;
    let (watcher, live) = boot.live_settings();

    let handler = StorageSyncHandler::new(store.clone(), Arc::new(DriverManager::new()));
    let dispatch = spawn_dispatch(
        &boot,
        handler,
        TASK_QUEUE,
        coordinator.clone(),
        transport.clone(),
        &live,
    );

    let scheduler = boot.config.scheduler.enabled.then(|| {
        SchedulerHandle::spawn(
            store.clone(),
            coordinator,
            transport,
            &boot.instance_id,
            live.scheduler_interval.clone(),
            boot.retry,
            boot.health.clone(),
        )
    });

    let exit = wait_for_exit(&boot.health).await;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    dispatch.shutdown().await;
    if let Some(watcher) = watcher {
        watcher.shutdown().await;
    }
    if let Err(e) = store.close().await {
        warn!("closing metadata store: {e}");
    }

    finish(boot.role, exit)
}

/// Dispatch core on `delfin.alert`
pub async fn run_alert(boot: Bootstrap) -> Result<()> {
    let store = boot.store().await?;
    let coordinator = boot.coordinator().await?;
    let transport = boot.transport().await?;
    let (watcher, live) = boot.live_settings();

    let handler = AlertHandler::new(store.clone(), Arc::new(DriverManager::new()));
    let dispatch = spawn_dispatch(&boot, handler, ALERT_QUEUE, coordinator, transport, &live);

    let exit = wait_for_exit(&boot.health).await;

    dispatch.shutdown().await;
    if let Some(watcher) = watcher {
        watcher.shutdown().await;
    }
    if let Err(e) = store.close().await {
        warn!("closing metadata store: {e}");
    }

    finish(boot.role, exit)
}

/// Subscriber of the events topic; no lock, no metadata store
pub async fn run_exporter(boot: Bootstrap) -> Result<()> {
    let transport = boot.transport().await?;
    let (watcher, live) = boot.live_settings();

    let mut sinks: Vec<Arc<dyn ExportSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = &boot.config.exporter.webhook {
        info!("exporting alert events to {url}");
        sinks.push(Arc::new(WebhookSink::new(url.clone())?));
    }

    let core = ExportCore::new(
        transport,
        sinks,
        live.policy.clone(),
        boot.retry,
        boot.health.clone(),
    );
    let exporter = ExporterHandle::spawn(core, boot.subscribe_options()).await?;

    let exit = wait_for_exit(&boot.health).await;

    exporter.shutdown().await;
    if let Some(watcher) = watcher {
        watcher.shutdown().await;
    }

    finish(boot.role, exit)
}
