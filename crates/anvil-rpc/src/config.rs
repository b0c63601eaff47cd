//! Engine configuration
//!
//! Configuration can be built in code, loaded from a TOML file, or read from
//! `ANVIL_*` environment variables. Every field has a default, so a file only
//! needs to mention what it changes.

use anvil_protocol::{Identity, DEFAULT_MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::connection::{Connector, TcpConnector};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:5000";
pub const DEFAULT_MAX_RETRIES: u32 = 12;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Where the peer lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn connector(&self) -> Arc<dyn Connector> {
        match self {
            Endpoint::Tcp(addr) => Arc::new(TcpConnector::new(addr.clone())),
            #[cfg(unix)]
            Endpoint::Unix(path) => Arc::new(crate::connection::UnixConnector::new(path.clone())),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Arc::new(crate::connection::Unsupported::new(format!(
                "unix:{}",
                path.display()
            ))),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Tcp(DEFAULT_ADDRESS.to_string())
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Accepts `host:port`, `tcp://host:port` or `unix:/path/to.sock`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::invalid("unix endpoint needs a path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            _ => Err(ConfigError::invalid(format!(
                "expected host:port or unix:/path, got {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Connect retry policy. Only connection-refused is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Watchdog interval of the I/O loop.
    pub poll_interval_ms: u64,
    pub max_frame_len: usize,
    /// Default timeout for blocking calls; `None` waits until the result or
    /// connection death.
    pub call_timeout_ms: Option<u64>,
    pub endpoint: Endpoint,
    /// Announced on every new connection. Accepting sides usually leave this
    /// unset.
    pub identity: Option<Identity>,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            call_timeout_ms: None,
            endpoint: Endpoint::default(),
            identity: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from environment variables.
    ///
    /// | Variable                    | Field                    |
    /// |-----------------------------|--------------------------|
    /// | `ANVIL_ADDRESS`             | `endpoint`               |
    /// | `ANVIL_SERVICE`             | `identity.service`       |
    /// | `ANVIL_INSTANCE`            | `identity.instance`      |
    /// | `ANVIL_TOKEN`               | `identity.token`         |
    /// | `ANVIL_RECONNECT_RETRIES`   | `reconnect.max_retries`  |
    /// | `ANVIL_RECONNECT_DELAY_MS`  | `reconnect.delay_ms`     |
    /// | `ANVIL_CALL_TIMEOUT_MS`     | `call_timeout_ms`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("ANVIL_ADDRESS") {
            config.endpoint = addr.parse()?;
        }

        if let Some(service) = lookup("ANVIL_SERVICE") {
            let mut identity = Identity::new(service, lookup("ANVIL_TOKEN").unwrap_or_default());
            identity.instance = parse_var(&lookup, "ANVIL_INSTANCE")?;
            config.identity = Some(identity);
        }

        if let Some(retries) = parse_var(&lookup, "ANVIL_RECONNECT_RETRIES")? {
            config.reconnect.max_retries = retries;
        }
        if let Some(delay) = parse_var(&lookup, "ANVIL_RECONNECT_DELAY_MS")? {
            config.reconnect.delay_ms = delay;
        }
        config.call_timeout_ms = parse_var(&lookup, "ANVIL_CALL_TIMEOUT_MS")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms must be greater than 0"));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::invalid("max_frame_len must be greater than 0"));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("call_timeout_ms must be greater than 0"));
        }
        if let Some(identity) = &self.identity {
            if identity.service.is_empty() {
                return Err(ConfigError::invalid("identity.service cannot be empty"));
            }
        }
        if let Endpoint::Tcp(addr) = &self.endpoint {
            if addr.is_empty() {
                return Err(ConfigError::invalid("endpoint address cannot be empty"));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::invalid(format!("{}={:?}: {}", key, raw, e))),
    }
}
