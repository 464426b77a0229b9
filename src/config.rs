use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::actors::dispatch::DispatchPolicy;
use crate::error::ErrorKind;
use crate::retry::{BackoffPolicy, Classify, RetryPolicy};

/// Configuration errors (all fatal at startup)
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },

    /// Config file is not valid JSON for [`PersistedConfig`]
    Parse(String),

    /// A value is out of range or an endpoint does not parse
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse(msg) => write!(f, "invalid configuration file: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigInvalid
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Where the coordination backend lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEndpoint {
    /// etcd v3 JSON gateway
    Etcd { host: String, port: u16 },

    /// Lock table in a SQLite file on the shared volume
    Sqlite { path: PathBuf },

    /// In-process only
    Memory,
}

const DEFAULT_ETCD_PORT: u16 = 2379;

impl FromStr for CoordinationEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Bare `host:port` is the deployment's native form.
        let normalized = if s.contains("://") {
            s.to_string()
        } else {
            format!("etcd://{s}")
        };

        let url = url::Url::parse(&normalized)
            .map_err(|e| invalid(format!("coordination endpoint '{s}': {e}")))?;

        match url.scheme() {
            "etcd" | "http" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid(format!("coordination endpoint '{s}' has no host")))?;
                Ok(CoordinationEndpoint::Etcd {
                    host: host.to_string(),
                    port: url.port().unwrap_or(DEFAULT_ETCD_PORT),
                })
            }
            "sqlite" => Ok(CoordinationEndpoint::Sqlite {
                path: sqlite_path(&url, s)?,
            }),
            "memory" => Ok(CoordinationEndpoint::Memory),
            other => Err(invalid(format!(
                "unsupported coordination backend '{other}' in '{s}'"
            ))),
        }
    }
}

impl std::fmt::Display for CoordinationEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationEndpoint::Etcd { host, port } => write!(f, "etcd://{host}:{port}"),
            CoordinationEndpoint::Sqlite { path } => write!(f, "sqlite://{}", path.display()),
            CoordinationEndpoint::Memory => f.write_str("memory://"),
        }
    }
}

/// Where the message transport lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEndpoint {
    /// Durable queue in a SQLite file on the shared volume
    Sqlite { path: PathBuf },

    /// In-process only
    Memory,
}

impl FromStr for TransportEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let url = url::Url::parse(s).map_err(|e| invalid(format!("transport url '{s}': {e}")))?;

        match url.scheme() {
            "sqlite" => Ok(TransportEndpoint::Sqlite {
                path: sqlite_path(&url, s)?,
            }),
            "memory" => Ok(TransportEndpoint::Memory),
            "amqp" | "amqps" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid(format!("transport url '{s}' has no host")))?;
                Err(invalid(format!(
                    "no AMQP client available for {}://{}:{}",
                    url.scheme(),
                    host,
                    url.port().unwrap_or(5672)
                )))
            }
            other => Err(invalid(format!("unsupported transport '{other}' in '{s}'"))),
        }
    }
}

impl std::fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEndpoint::Sqlite { path } => write!(f, "sqlite://{}", path.display()),
            TransportEndpoint::Memory => f.write_str("memory://"),
        }
    }
}

fn sqlite_path(url: &url::Url, raw: &str) -> Result<PathBuf, ConfigError> {
    if url.host_str().is_some_and(|h| !h.is_empty()) {
        return Err(invalid(format!(
            "'{raw}': sqlite urls take an absolute path (sqlite:///path)"
        )));
    }

    let path = url.path();
    if path.is_empty() || path == "/" {
        return Err(invalid(format!("'{raw}' has no database path")));
    }
    Ok(PathBuf::from(path))
}

/// Metadata store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database on the shared volume
    Sqlite {
        #[serde(default = "default_storage_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/delfin/delfin.db")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// `host:port`, `etcd://host:port`, `sqlite:///path` or `memory://`
    pub endpoint: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("127.0.0.1:{DEFAULT_ETCD_PORT}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/delfin/transport.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
}

impl BackoffConfig {
    const fn new(initial_ms: u64, max_ms: u64, multiplier: u32) -> Self {
        Self {
            initial_ms,
            max_ms,
            multiplier,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_ms),
            Duration::from_millis(self.max_ms),
            self.multiplier,
        )
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.initial_ms > self.max_ms {
            return Err(invalid(format!(
                "{name}: initial_ms ({}) exceeds max_ms ({})",
                self.initial_ms, self.max_ms
            )));
        }
        if self.multiplier < 1 {
            return Err(invalid(format!("{name}: multiplier must be at least 1")));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(500, 30_000, 2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Work sessions running at the same time per role process
    pub concurrency: usize,

    /// Failed attempts after which a message is dead-lettered
    pub max_retries: u32,
    pub lease_secs: u64,
    pub visibility_timeout_secs: u64,

    /// Redelivery delay after lock contention
    pub busy_backoff: BackoffConfig,

    /// Redelivery delay after a failed attempt
    pub failure_backoff: BackoffConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_retries: 5,
            lease_secs: 30,
            visibility_timeout_secs: 120,
            busy_backoff: BackoffConfig::new(500, 30_000, 2),
            failure_backoff: BackoffConfig::new(1_000, 60_000, 2),
        }
    }
}

impl DispatchConfig {
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_retries: self.max_retries,
            lease: Duration::from_secs(self.lease_secs),
            busy_backoff: self.busy_backoff.policy(),
            failure_backoff: self.failure_backoff.policy(),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 5_000,
            multiplier: 2,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffConfig::new(self.initial_ms, self.max_ms, self.multiplier).policy(),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    #[serde(default = "crate::util::get_default_api_port")]
    pub port: u16,

    /// Bearer token required on every route except health
    pub token: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: crate::util::get_default_api_port(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Alert events are POSTed here as JSON when set
    pub webhook: Option<String>,
}

/// Configuration tree shared by all roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedConfig {
    pub coordination: CoordinationConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub backend_retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub api: ApiSettings,
    pub exporter: ExporterConfig,
    pub reload_interval_secs: u64,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig::default(),
            transport: TransportConfig::default(),
            storage: StorageConfig::default(),
            dispatch: DispatchConfig::default(),
            backend_retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            api: ApiSettings::default(),
            exporter: ExporterConfig::default(),
            reload_interval_secs: 10,
        }
    }
}

/// Values the deployment hands over through the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub coordination_endpoint: Option<String>,
    pub transport_url: Option<String>,
    pub api_port: Option<u16>,
    pub api_token: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            coordination_endpoint: crate::util::get_coordination_endpoint(),
            transport_url: crate::util::get_transport_url(),
            api_port: crate::util::get_api_port(),
            api_token: crate::util::get_api_token(),
        }
    }
}

impl PersistedConfig {
    pub fn coordination_endpoint(&self) -> Result<CoordinationEndpoint, ConfigError> {
        self.coordination.endpoint.parse()
    }

    pub fn transport_endpoint(&self) -> Result<TransportEndpoint, ConfigError> {
        self.transport.url.parse()
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }

    pub fn apply_overrides(&mut self, overrides: &EnvOverrides) {
        if let Some(endpoint) = &overrides.coordination_endpoint {
            self.coordination.endpoint = endpoint.clone();
        }
        if let Some(url) = &overrides.transport_url {
            self.transport.url = url.clone();
        }
        if let Some(port) = overrides.api_port {
            self.api.port = port;
        }
        if let Some(token) = &overrides.api_token {
            self.api.token = Some(token.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordination_endpoint()?;
        self.transport_endpoint()?;

        let dispatch = &self.dispatch;
        if dispatch.concurrency < 1 {
            return Err(invalid("dispatch.concurrency must be at least 1"));
        }
        if dispatch.max_retries < 1 {
            return Err(invalid("dispatch.max_retries must be at least 1"));
        }
        if dispatch.lease_secs < 2 {
            return Err(invalid("dispatch.lease_secs must be at least 2"));
        }
        if dispatch.visibility_timeout_secs < 1 {
            return Err(invalid("dispatch.visibility_timeout_secs must be at least 1"));
        }
        dispatch.busy_backoff.validate("dispatch.busy_backoff")?;
        dispatch.failure_backoff.validate("dispatch.failure_backoff")?;

        let retry = &self.backend_retry;
        BackoffConfig::new(retry.initial_ms, retry.max_ms, retry.multiplier)
            .validate("backend_retry")?;
        if retry.max_attempts < 1 {
            return Err(invalid("backend_retry.max_attempts must be at least 1"));
        }

        if self.scheduler.interval_secs < 1 {
            return Err(invalid("scheduler.interval_secs must be at least 1"));
        }

        if let Some(webhook) = &self.exporter.webhook {
            let url = url::Url::parse(webhook)
                .map_err(|e| invalid(format!("exporter.webhook '{webhook}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(invalid(format!("exporter.webhook '{webhook}' is not http(s)")));
            }
        }

        Ok(())
    }
}

pub fn read_config_file(path: &Path) -> Result<PersistedConfig, ConfigError> {
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&file_content)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

/// Config file to use: the explicit one, `DELFIN_CONFIG`, or the default path
/// when it exists
///
/// `None` means "run on defaults".
pub fn resolve_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit.map(str::to_string).or_else(crate::util::get_config_path) {
        return Some(PathBuf::from(path));
    }

    let default = PathBuf::from(crate::util::DEFAULT_CONFIG_PATH);
    default.exists().then_some(default)
}

/// Read, override and validate the configuration
pub fn load_from(
    path: Option<&Path>,
    overrides: &EnvOverrides,
) -> Result<PersistedConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => {
            debug!("no config file, using defaults");
            PersistedConfig::default()
        }
    };

    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}
