//! Layered configuration
//!
//! Precedence, lowest to highest: built-in defaults, the YAML or JSON file
//! (picked by extension), `WEFT__` environment variables (`__` separates
//! nested keys, e.g. `WEFT__SERVER__PORT`), then CLI overrides.
//!
//! The result is validated into a [`DescriptorStore`] before anything starts.

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use weft_runtime::channel::{ChannelOptions, HealthOptions};
use weft_runtime::watch::WatchSettings;
use weft_runtime::{
    BackoffStrategy, CommandSpec, DescriptorError, DescriptorStore, ExternalSource, MeshSettings,
    PackageManager, ReloadSettings, RestartPolicy, RuntimeSettings, ServiceDescriptor, ServiceId,
    SupervisorSettings,
};

use crate::paths::{PathError, absolutize, resolve_relative};

pub const ENV_PREFIX: &str = "WEFT__";

/// File names looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILES: [&str; 3] = ["weft.yaml", "weft.yml", "weft.json"];

/// Where services with a repository URL and no path are cloned to.
pub const EXTERNAL_DIR: &str = "external";

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Service exposed at `/` when it declares no prefix of its own.
    pub entrypoint: Option<String>,
    pub services: Vec<ServiceConfig>,
    pub autoload: Option<AutoloadConfig>,
    pub restart_on_error: RestartOnError,
    /// Default for services that do not set `watch` themselves.
    pub watch: bool,
    pub runtime: RuntimeConfig,
    pub management: ManagementConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            entrypoint: None,
            services: Vec::new(),
            autoload: None,
            restart_on_error: RestartOnError::default(),
            watch: false,
            runtime: RuntimeConfig::default(),
            management: ManagementConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3042,
        }
    }
}

/// A command given either as one line or as an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Line(String),
    Argv(Vec<String>),
}

impl CommandConfig {
    /// `None` when the command is blank.
    #[must_use]
    pub fn to_spec(&self) -> Option<CommandSpec> {
        match self {
            Self::Line(line) => {
                let argv: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
                CommandSpec::from_argv(&argv)
            }
            Self::Argv(argv) => CommandSpec::from_argv(argv).filter(|c| !c.program.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub id: String,
    /// Relative to the configuration file's directory.
    pub path: Option<String>,
    /// Defaults to `<package_manager> start`.
    pub command: Option<CommandConfig>,
    pub prefix: Option<String>,
    pub depends_on: Vec<String>,
    pub package_manager: Option<PackageManager>,
    pub watch: Option<bool>,
    pub env: BTreeMap<String, String>,
    pub restart: Option<RestartConfig>,
    pub startup_timeout_ms: Option<u64>,
    pub build: Option<CommandConfig>,
    /// Git repository of a service living outside the project.
    pub url: Option<String>,
    pub branch: Option<String>,
}

/// Per-service restart policy override; unset fields keep the global policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartConfig {
    pub max_restarts: Option<u32>,
    pub window_ms: Option<u64>,
    pub backoff_ms: Option<u64>,
    pub strategy: Option<BackoffStrategy>,
    pub max_backoff_ms: Option<u64>,
    pub fatal: Option<bool>,
}

impl RestartConfig {
    fn apply(&self, mut policy: RestartPolicy) -> RestartPolicy {
        if let Some(max) = self.max_restarts {
            policy.max_restarts = max;
        }
        if let Some(ms) = self.window_ms {
            policy.window = Duration::from_millis(ms);
        }
        if let Some(ms) = self.backoff_ms {
            policy.backoff = Duration::from_millis(ms);
        }
        if let Some(strategy) = self.strategy {
            policy.strategy = strategy;
        }
        if let Some(ms) = self.max_backoff_ms {
            policy.max_backoff = Duration::from_millis(ms);
        }
        if let Some(fatal) = self.fatal {
            policy.fatal_after_exceeded = fatal;
        }
        policy
    }
}

/// `false` disables automatic restarts, `true` keeps the default policy,
/// a number sets the restart delay in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RestartOnError {
    Enabled(bool),
    BackoffMs(u64),
}

impl Default for RestartOnError {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

impl RestartOnError {
    #[must_use]
    pub fn policy(self) -> RestartPolicy {
        match self {
            Self::Enabled(false) => RestartPolicy::disabled(),
            Self::Enabled(true) => RestartPolicy::default(),
            Self::BackoffMs(ms) => RestartPolicy {
                backoff: Duration::from_millis(ms),
                ..RestartPolicy::default()
            },
        }
    }
}

/// Every sub-directory of `path` becomes a service unless excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoloadConfig {
    pub path: String,
    /// Directory names to skip.
    pub exclude: Vec<String>,
    /// Directory name to service id.
    pub mappings: BTreeMap<String, AutoloadMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoloadMapping {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub startup_timeout_ms: u64,
    pub stop_grace_ms: u64,
    /// Deadline for a worker's response to a proxied request.
    pub proxy_timeout_ms: u64,
    pub exit_on_fatal: bool,
    pub watch_interval_ms: u64,
    pub health: HealthConfig,
    pub reload: ReloadConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
            proxy_timeout_ms: 30_000,
            exit_on_fatal: true,
            watch_interval_ms: 1_000,
            health: HealthConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub missed_threshold: u32,
    pub degraded_grace_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            ack_timeout_ms: 2_000,
            missed_threshold: 3,
            degraded_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub debounce_ms: u64,
    pub drain_grace_ms: u64,
    pub reconcile_timeout_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            drain_grace_ms: 10_000,
            reconcile_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_owned(),
            port: 3043,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported configuration format {} (expected .yaml, .yml or .json)", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] Box<figment::Error>),
    #[error("service #{index} has no id")]
    MissingId { index: usize },
    #[error("service '{service}': {reason}")]
    InvalidService { service: String, reason: String },
    #[error("service '{service}': {source}")]
    Path {
        service: String,
        #[source]
        source: PathError,
    },
    #[error("directory {} of service '{service}' does not exist", .path.display())]
    MissingDirectory { service: ServiceId, path: PathBuf },
    #[error("cannot read autoload directory {}: {source}", .path.display())]
    Autoload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot determine project root: {0}")]
    Root(#[source] PathError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("invalid listen address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Settings given on the command line; they beat every other layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
}

/// First default configuration file present in `dir`.
#[must_use]
pub fn discover_config(dir: &Path) -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Load and validate the configuration file at `path`.
///
/// # Errors
/// `ConfigError` when the file is missing or malformed, or the services it
/// declares do not form a valid set.
pub fn load_config(path: &Path) -> Result<ValidatedConfig, ConfigError> {
    load_layered(Some(path), ConfigOverrides::default())
}

/// Load every layer and validate the result.
///
/// Without a file, services come from the environment alone and relative
/// paths resolve against the working directory.
///
/// # Errors
/// See [`load_config`].
pub fn load_layered(
    path: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<ValidatedConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    let source = match path {
        Some(path) => {
            let path = absolutize(path).map_err(ConfigError::Root)?;
            if !path.is_file() {
                return Err(ConfigError::NotFound(path));
            }
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("yaml" | "yml") => figment.merge(Yaml::file(&path)),
                Some("json") => figment.merge(Json::file(&path)),
                _ => return Err(ConfigError::UnsupportedFormat(path)),
            };
            Some(path)
        }
        None => None,
    };

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    let mut config: AppConfig = figment.extract().map_err(Box::new)?;
    if let Some(port) = overrides.port {
        config.server.port = port;
    }

    let root = match source.as_deref().and_then(Path::parent) {
        Some(dir) => dir.to_path_buf(),
        None => absolutize(Path::new(".")).map_err(ConfigError::Root)?,
    };
    ValidatedConfig::new(config, root, source)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Effective configuration plus the validated service set derived from it.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    /// The file the configuration was read from, if any.
    pub source: Option<PathBuf>,
    /// Project root; relative service paths resolve against it.
    pub root: PathBuf,
    pub config: AppConfig,
    pub store: DescriptorStore,
}

impl ValidatedConfig {
    /// Validate `config` against the project at `root`.
    ///
    /// Directories of external services (those with a `url`) may be missing;
    /// every other service directory must exist.
    ///
    /// # Errors
    /// `ConfigError` for the first invalid service entry or set-level violation.
    pub fn new(config: AppConfig, root: PathBuf, source: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut entries = config.services.clone();
        if let Some(autoload) = &config.autoload {
            entries.extend(autoload_services(&root, autoload, &entries)?);
        }

        let defaults = config.restart_on_error.policy();
        let descriptors = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| descriptor_for(&root, &config, defaults.clone(), index, entry))
            .collect::<Result<Vec<_>, _>>()?;

        let store = DescriptorStore::new(descriptors, config.entrypoint.clone().map(ServiceId::from))?;
        for descriptor in store.iter() {
            if descriptor.source.is_none() && !descriptor.path.is_dir() {
                return Err(ConfigError::MissingDirectory {
                    service: descriptor.id.clone(),
                    path: descriptor.path.clone(),
                });
            }
        }

        Ok(Self {
            source,
            root,
            config,
            store,
        })
    }

    /// Fail if any service directory, external ones included, is missing.
    ///
    /// # Errors
    /// `MissingDirectory` naming the first unresolved service.
    pub fn ensure_resolved(&self) -> Result<(), ConfigError> {
        match self.store.iter().find(|d| !d.path.is_dir()) {
            Some(descriptor) => Err(ConfigError::MissingDirectory {
                service: descriptor.id.clone(),
                path: descriptor.path.clone(),
            }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn runtime_settings(&self) -> RuntimeSettings {
        let runtime = &self.config.runtime;
        let health = &runtime.health;
        let watching = self.store.iter().any(|d| d.watch_enabled);

        RuntimeSettings {
            supervisor: SupervisorSettings {
                startup_timeout: Duration::from_millis(runtime.startup_timeout_ms),
                stop_grace: Duration::from_millis(runtime.stop_grace_ms),
                proxy_timeout: Duration::from_millis(runtime.proxy_timeout_ms),
                channel: ChannelOptions {
                    ack_timeout: Duration::from_millis(health.ack_timeout_ms),
                },
                health: HealthOptions {
                    interval: Duration::from_millis(health.interval_ms),
                    missed_threshold: health.missed_threshold,
                    degraded_grace: Duration::from_millis(health.degraded_grace_ms),
                },
            },
            mesh: MeshSettings {
                reconcile_timeout: Duration::from_millis(runtime.reload.reconcile_timeout_ms),
                ..MeshSettings::default()
            },
            reload: ReloadSettings {
                debounce: Duration::from_millis(runtime.reload.debounce_ms),
                drain_grace: Duration::from_millis(runtime.reload.drain_grace_ms),
            },
            watch: watching.then(|| WatchSettings {
                interval: Duration::from_millis(runtime.watch_interval_ms),
                ..WatchSettings::default()
            }),
            exit_on_fatal: runtime.exit_on_fatal,
        }
    }

    /// # Errors
    /// `InvalidAddress` when the host does not resolve.
    pub fn ingress_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.config.server.host, self.config.server.port)
    }

    /// `Ok(None)` when the management API is disabled.
    ///
    /// # Errors
    /// `InvalidAddress` when the host does not resolve.
    pub fn management_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        let management = &self.config.management;
        if !management.enabled {
            return Ok(None);
        }
        socket_addr(&management.host, management.port).map(Some)
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        host: host.to_owned(),
        port,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

fn autoload_services(
    root: &Path,
    autoload: &AutoloadConfig,
    declared: &[ServiceConfig],
) -> Result<Vec<ServiceConfig>, ConfigError> {
    let dir = resolve_relative(root, &autoload.path).map_err(|source| ConfigError::Path {
        service: "autoload".to_owned(),
        source,
    })?;
    let io_error = |source| ConfigError::Autoload {
        path: dir.clone(),
        source,
    };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        if !entry.file_type().map_err(io_error)?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || autoload.exclude.contains(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    let services = names
        .into_iter()
        .map(|name| {
            let id = autoload
                .mappings
                .get(&name)
                .map_or_else(|| name.clone(), |m| m.id.clone());
            (id, dir.join(&name))
        })
        // an explicit entry for the same id wins
        .filter(|(id, _)| !declared.iter().any(|s| &s.id == id))
        .map(|(id, path)| ServiceConfig {
            id,
            path: Some(path.display().to_string()),
            ..ServiceConfig::default()
        })
        .collect();
    Ok(services)
}

fn descriptor_for(
    root: &Path,
    config: &AppConfig,
    defaults: RestartPolicy,
    index: usize,
    entry: &ServiceConfig,
) -> Result<ServiceDescriptor, ConfigError> {
    let id = entry.id.trim();
    if id.is_empty() {
        return Err(ConfigError::MissingId { index });
    }
    let invalid = |reason: &str| ConfigError::InvalidService {
        service: id.to_owned(),
        reason: reason.to_owned(),
    };

    let path = match (&entry.path, &entry.url) {
        (Some(raw), _) => resolve_relative(root, raw).map_err(|source| ConfigError::Path {
            service: id.to_owned(),
            source,
        })?,
        (None, Some(_)) => root.join(EXTERNAL_DIR).join(id),
        (None, None) => return Err(invalid("either `path` or `url` is required")),
    };

    let package_manager = entry.package_manager.unwrap_or_default();
    let entrypoint = match &entry.command {
        Some(command) => command.to_spec().ok_or_else(|| invalid("`command` is empty"))?,
        None => CommandSpec::new(package_manager.program()).with_args(["start"]),
    };
    let build = match &entry.build {
        Some(command) => Some(command.to_spec().ok_or_else(|| invalid("`build` is empty"))?),
        None => None,
    };
    if entry.branch.is_some() && entry.url.is_none() {
        return Err(invalid("`branch` requires `url`"));
    }

    let mut descriptor = ServiceDescriptor::new(id, path).with_entrypoint(entrypoint);
    descriptor.package_manager = package_manager;
    descriptor.prefix.clone_from(&entry.prefix);
    descriptor.depends_on = entry.depends_on.iter().map(|d| ServiceId::from(d.trim())).collect();
    descriptor.watch_enabled = entry.watch.unwrap_or(config.watch);
    descriptor.env.clone_from(&entry.env);
    descriptor.restart_policy = match &entry.restart {
        Some(overrides) => overrides.apply(defaults),
        None => defaults,
    };
    descriptor.startup_timeout = entry.startup_timeout_ms.map(Duration::from_millis);
    descriptor.build = build;
    descriptor.source = entry.url.as_ref().map(|url| ExternalSource {
        url: url.clone(),
        branch: entry.branch.clone(),
    });
    Ok(descriptor)
}
