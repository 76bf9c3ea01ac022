use crate::command::{ShellCommand, DEFAULT_SHELL};
use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration file contents
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The backend being gated
    #[serde(default)]
    pub backend: BackendConfig,

    /// Health polling after a restart
    #[serde(default)]
    pub health: HealthConfig,

    /// How the backend is stopped
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 8009)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// How long the coordination lock is held per request
    #[serde(default)]
    pub lock_scope: LockScope,

    /// Maximum idle connections kept to the backend (default: 0, the
    /// backend is restarted often enough that pooled connections go stale)
    #[serde(default)]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            lock_scope: LockScope::default(),
            pool_max_idle_per_host: 0,
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Portion of a request during which the coordination lock is held
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// Staleness check, reload and the whole proxied response (default)
    #[default]
    Request,
    /// Staleness check and reload only; relaying happens unlocked
    Reload,
}

/// Commands and target of the gated backend
///
/// # Security Warning
///
/// `check`, `build` and `run` are executed through a shell with the
/// permissions of the proxy. Only load configuration from trusted sources.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    /// URL the backend listens on, e.g. `http://127.0.0.1:3000`
    pub url: Option<String>,

    /// Staleness check; exit status 0 means up to date
    pub check: Option<String>,

    /// Build command
    pub build: Option<String>,

    /// Command that runs the backend
    pub run: Option<String>,

    /// Shell used for all commands (default: sh)
    pub shell: Option<String>,

    /// Working directory for all commands
    pub working_dir: Option<String>,

    /// Extra environment variables for all commands
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Delay between probes in milliseconds (default: 50)
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Number of probes before giving up (default: 70)
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,

    /// Timeout of a single probe in milliseconds (default: interval_ms)
    pub probe_timeout_ms: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            attempts: default_health_attempts(),
            probe_timeout_ms: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(self.interval_ms))
    }
}

/// Signal used to stop the backend
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    /// SIGTERM, then SIGKILL once the grace period runs out (default)
    #[default]
    Term,
    /// SIGKILL right away
    Kill,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub signal: StopSignal,

    /// Time to wait for the backend to exit after signalling it (default: 1000)
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            signal: StopSignal::default(),
            grace_period_ms: default_grace_period(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8009
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_health_interval() -> u64 {
    50 // 50ms
}

fn default_health_attempts() -> u32 {
    70 // 70 * 50ms = 3.5s
}

fn default_grace_period() -> u64 {
    1000 // 1 second between SIGTERM and SIGKILL
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match self.backend.url.as_deref() {
            None => errors.push("backend: 'url' is required".to_string()),
            Some(url) => {
                if let Err(e) = parse_target(url) {
                    errors.push(format!("backend: {}", e));
                }
            }
        }

        if self.backend.run.as_deref().map_or(true, |r| r.trim().is_empty()) {
            errors.push("backend: 'run' command is required".to_string());
        }

        if self.health.attempts == 0 {
            errors.push("health: 'attempts' must be greater than 0".to_string());
        }

        if self.health.interval_ms == 0 {
            errors.push("health: 'interval_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Validate and freeze into the value handed to the gate
    pub fn proxy_config(&self) -> anyhow::Result<ProxyConfig> {
        self.validate()?;

        let url = self.backend.url.as_deref().unwrap_or_default();
        let target = parse_target(url).map_err(|e| anyhow::anyhow!(e))?;

        let mut env = HashMap::new();
        if let Some(port) = target.port_u16() {
            env.insert("PORT".to_string(), port.to_string());
        }
        env.extend(self.backend.env.clone());

        let shell = self.backend.shell.as_deref().unwrap_or(DEFAULT_SHELL);
        let make = |script: &str| {
            let cmd = ShellCommand::new(script)
                .with_shell(shell)
                .with_env(env.clone());
            match self.backend.working_dir {
                Some(ref dir) => cmd.with_working_dir(dir),
                None => cmd,
            }
        };

        Ok(ProxyConfig {
            check: self.backend.check.as_deref().map(&make),
            build: self.backend.build.as_deref().map(&make),
            run: make(self.backend.run.as_deref().unwrap_or_default()),
            target,
            health: HealthSettings {
                interval: self.health.interval(),
                attempts: self.health.attempts,
                probe_timeout: self.health.probe_timeout(),
            },
            stop: StopSettings {
                signal: self.shutdown.signal,
                grace_period: Duration::from_millis(self.shutdown.grace_period_ms),
            },
            lock_scope: self.server.lock_scope,
            pool_max_idle_per_host: self.server.pool_max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(self.server.pool_idle_timeout_secs),
        })
    }
}

/// Parse and check the backend URL (http only, host required)
pub fn parse_target(url: &str) -> Result<Uri, String> {
    let uri: Uri = url
        .parse()
        .map_err(|e| format!("invalid url '{}': {}", url, e))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(format!("unsupported scheme '{}' in url '{}'", other, url)),
        None => return Err(format!("url '{}' must start with http://", url)),
    }

    if uri.host().is_none() {
        return Err(format!("url '{}' has no host", url));
    }

    Ok(uri)
}

/// Health polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub interval: Duration,
    pub attempts: u32,
    pub probe_timeout: Duration,
}

impl HealthSettings {
    /// Longest a caller can be blocked by one poll
    pub fn upper_bound(&self) -> Duration {
        (self.interval + self.probe_timeout) * self.attempts
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        let health = HealthConfig::default();
        Self {
            interval: health.interval(),
            attempts: health.attempts,
            probe_timeout: health.probe_timeout(),
        }
    }
}

/// Stop parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSettings {
    pub signal: StopSignal,
    pub grace_period: Duration,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            signal: StopSignal::default(),
            grace_period: Duration::from_millis(default_grace_period()),
        }
    }
}

/// Immutable configuration of the gate, built once at startup
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Staleness check (absent: never stale)
    pub check: Option<ShellCommand>,
    /// Build step (absent: nothing to build)
    pub build: Option<ShellCommand>,
    pub run: ShellCommand,
    /// URL to probe and proxy to
    pub target: Uri,
    pub health: HealthSettings,
    pub stop: StopSettings,
    pub lock_scope: LockScope,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl ProxyConfig {
    /// Create a config with default tuning for the given commands and target
    pub fn new(
        check: Option<ShellCommand>,
        build: Option<ShellCommand>,
        run: ShellCommand,
        target: Uri,
    ) -> Self {
        Self {
            check,
            build,
            run,
            target,
            health: HealthSettings::default(),
            stop: StopSettings::default(),
            lock_scope: LockScope::default(),
            pool_max_idle_per_host: 0,
            pool_idle_timeout: Duration::from_secs(default_pool_idle_timeout()),
        }
    }

    /// Set health polling parameters (builder pattern)
    pub fn with_health(mut self, health: HealthSettings) -> Self {
        self.health = health;
        self
    }

    /// Set stop parameters (builder pattern)
    pub fn with_stop(mut self, stop: StopSettings) -> Self {
        self.stop = stop;
        self
    }

    /// Set lock scope (builder pattern)
    pub fn with_lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }
}
