//! Runtime configuration.
//!
//! `BusConfig` is what every node (worker, supervisor, console) is built from;
//! it is constructed once at process start, from the environment or through
//! the `with_*` setters, and passed down explicitly. `SupervisorConfig` is the
//! JSON file the supervisor is launched with.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{
    DEFAULT_BASE_BACKOFF, DEFAULT_CRASH_THRESHOLD, DEFAULT_CRASH_WINDOW, DEFAULT_MAX_BACKOFF,
    RestartPolicy,
};
use crate::registry::{Registry, RegistryError};

pub const ENV_REGISTRY: &str = "VJBUS_REGISTRY";
pub const ENV_WORKER_NAME: &str = "VJBUS_WORKER_NAME";
pub const ENV_GENERATION: &str = "VJBUS_GENERATION";
pub const ENV_COMMAND_PORT: &str = "VJBUS_COMMAND_PORT";
pub const ENV_TELEMETRY_PORT: &str = "VJBUS_TELEMETRY_PORT";
pub const ENV_OSC_TARGET: &str = "VJBUS_OSC_TARGET";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "VJBUS_HEARTBEAT_INTERVAL_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "VJBUS_HEARTBEAT_TIMEOUT_MS";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Optional features, probed once at startup and threaded through
/// constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// cpu/mem sampling for heartbeats is available on this platform.
    pub process_stats: bool,
    /// Telemetry is mirrored over OSC.
    pub osc_mirror: bool,
}

impl Capabilities {
    pub fn detect(osc_target: Option<SocketAddr>) -> Self {
        Self {
            process_stats: sysinfo::IS_SUPPORTED_SYSTEM,
            osc_mirror: osc_target.is_some(),
        }
    }
}

/// Settings shared by every node on the bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub registry_path: PathBuf,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub command_timeout: Duration,
    /// Bound on how long `stop()` waits for each loop.
    pub shutdown_timeout: Duration,
    /// 0 picks an ephemeral port.
    pub command_port: u16,
    pub telemetry_port: u16,
    pub osc_target: Option<SocketAddr>,
    /// Set by the supervisor; otherwise derived from the registry.
    pub generation: Option<u64>,
    pub capabilities: Capabilities,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            registry_path: Registry::default_path(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            command_port: 0,
            telemetry_port: 0,
            osc_target: None,
            generation: None,
            capabilities: Capabilities::detect(None),
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the `VJBUS_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`BusConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get(ENV_REGISTRY) {
            config.registry_path = PathBuf::from(path);
        }
        if let Some(port) = get(ENV_COMMAND_PORT) {
            config.command_port = parse_env(ENV_COMMAND_PORT, &port)?;
        }
        if let Some(port) = get(ENV_TELEMETRY_PORT) {
            config.telemetry_port = parse_env(ENV_TELEMETRY_PORT, &port)?;
        }
        if let Some(generation) = get(ENV_GENERATION) {
            config.generation = Some(parse_env(ENV_GENERATION, &generation)?);
        }
        if let Some(ms) = get(ENV_HEARTBEAT_INTERVAL_MS) {
            config.heartbeat_interval = Duration::from_millis(parse_env(ENV_HEARTBEAT_INTERVAL_MS, &ms)?);
        }
        if let Some(ms) = get(ENV_HEARTBEAT_TIMEOUT_MS) {
            config.heartbeat_timeout = Duration::from_millis(parse_env(ENV_HEARTBEAT_TIMEOUT_MS, &ms)?);
        }
        if let Some(target) = get(ENV_OSC_TARGET) {
            config = config.with_osc_target(Some(parse_env(ENV_OSC_TARGET, &target)?));
        }
        Ok(config)
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_command_port(mut self, port: u16) -> Self {
        self.command_port = port;
        self
    }

    pub fn with_telemetry_port(mut self, port: u16) -> Self {
        self.telemetry_port = port;
        self
    }

    pub fn with_osc_target(mut self, target: Option<SocketAddr>) -> Self {
        self.osc_target = target;
        self.capabilities.osc_mirror = target.is_some();
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Open the registry this config points at.
    pub fn registry(&self) -> Result<Registry, RegistryError> {
        Ok(Registry::open(&self.registry_path)?.with_heartbeat_timeout(self.heartbeat_timeout))
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Worker name from `VJBUS_WORKER_NAME`, if the supervisor set one.
pub fn worker_name_from_env() -> Option<String> {
    std::env::var(ENV_WORKER_NAME).ok().filter(|n| !n.is_empty())
}

fn default_true() -> bool {
    true
}

/// Launch spec for one managed worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub command_port: Option<u16>,
    #[serde(default)]
    pub telemetry_port: Option<u16>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            enabled: true,
            command_port: None,
            telemetry_port: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_ports(mut self, command: Option<u16>, telemetry: Option<u16>) -> Self {
        self.command_port = command;
        self.telemetry_port = telemetry;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub crash_window_ms: u64,
    pub crash_threshold: usize,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: DEFAULT_BASE_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            crash_window_ms: DEFAULT_CRASH_WINDOW.as_millis() as u64,
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
        }
    }
}

impl From<RestartConfig> for RestartPolicy {
    fn from(config: RestartConfig) -> Self {
        RestartPolicy::new()
            .with_base_backoff(Duration::from_millis(config.base_backoff_ms))
            .with_max_backoff(Duration::from_millis(config.max_backoff_ms))
            .with_crash_window(Duration::from_millis(config.crash_window_ms))
            .with_crash_threshold(config.crash_threshold)
    }
}

/// Supervisor config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "SupervisorConfig::default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "SupervisorConfig::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default = "SupervisorConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: Self::default_check_interval_ms(),
            heartbeat_timeout_ms: Self::default_heartbeat_timeout_ms(),
            restart: RestartConfig::default(),
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            workers: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    fn default_check_interval_ms() -> u64 {
        DEFAULT_CHECK_INTERVAL.as_millis() as u64
    }

    fn default_heartbeat_timeout_ms() -> u64 {
        DEFAULT_HEARTBEAT_TIMEOUT.as_millis() as u64
    }

    fn default_stop_timeout_ms() -> u64 {
        DEFAULT_STOP_TIMEOUT.as_millis() as u64
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 {
            return Err(ConfigError::Invalid("check_interval_ms must be positive".into()));
        }
        if self.restart.crash_threshold == 0 {
            return Err(ConfigError::Invalid("restart.crash_threshold must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.name.is_empty() {
                return Err(ConfigError::Invalid("worker name must not be empty".into()));
            }
            if worker.name == crate::supervisor::SUPERVISOR_NAME {
                return Err(ConfigError::Invalid(format!(
                    "worker name {:?} is reserved",
                    worker.name
                )));
            }
            if !seen.insert(worker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker name {:?}",
                    worker.name
                )));
            }
        }
        Ok(())
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_restart(mut self, restart: RestartConfig) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_worker(mut self, worker: WorkerSpec) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| vars.get(k).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = BusConfig::from_lookup(lookup(&[
            (ENV_REGISTRY, "/tmp/test-registry.json"),
            (ENV_COMMAND_PORT, "5550"),
            (ENV_TELEMETRY_PORT, "5551"),
            (ENV_GENERATION, "7"),
            (ENV_OSC_TARGET, "127.0.0.1:9000"),
            (ENV_HEARTBEAT_INTERVAL_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(config.registry_path, PathBuf::from("/tmp/test-registry.json"));
        assert_eq!(config.command_port, 5550);
        assert_eq!(config.telemetry_port, 5551);
        assert_eq!(config.generation, Some(7));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_timeout, DEFAULT_HEARTBEAT_TIMEOUT);
        assert!(config.capabilities.osc_mirror);
    }

    #[test]
    fn empty_env_is_ignored() {
        let config = BusConfig::from_lookup(lookup(&[(ENV_COMMAND_PORT, "  ")])).unwrap();
        assert_eq!(config.command_port, 0);
        assert!(config.generation.is_none());
        assert!(!config.capabilities.osc_mirror);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = BusConfig::from_lookup(lookup(&[(ENV_COMMAND_PORT, "seventy")])).unwrap_err();
        match err {
            ConfigError::InvalidEnv { var, value, .. } => {
                assert_eq!(var, ENV_COMMAND_PORT);
                assert_eq!(value, "seventy");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn supervisor_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(
            &path,
            br#"{
                "restart": {"base_backoff_ms": 200},
                "workers": [
                    {"name": "audio", "program": "/usr/bin/audio-worker", "args": ["--device", "hw:1"]},
                    {"name": "lyrics", "program": "lyrics-worker", "enabled": false}
                ]
            }"#,
        )
        .unwrap();

        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.check_interval(), DEFAULT_CHECK_INTERVAL);
        assert_eq!(config.heartbeat_timeout(), DEFAULT_HEARTBEAT_TIMEOUT);
        let policy = config.restart_policy();
        assert_eq!(policy.base_backoff, Duration::from_millis(200));
        assert_eq!(policy.max_backoff, DEFAULT_MAX_BACKOFF);
        assert_eq!(policy.crash_threshold, DEFAULT_CRASH_THRESHOLD);
        assert_eq!(config.workers.len(), 2);
        assert!(config.workers[0].enabled);
        assert_eq!(config.workers[0].args, vec!["--device", "hw:1"]);
        assert!(!config.workers[1].enabled);
    }

    #[test]
    fn duplicate_and_reserved_names_rejected() {
        let dup = SupervisorConfig::new()
            .with_worker(WorkerSpec::new("audio", "a"))
            .with_worker(WorkerSpec::new("audio", "b"));
        assert!(matches!(dup.validate(), Err(ConfigError::Invalid(_))));

        let reserved = SupervisorConfig::new().with_worker(WorkerSpec::new("supervisor", "a"));
        assert!(matches!(reserved.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unreadable_config_is_read_error() {
        let err = SupervisorConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
