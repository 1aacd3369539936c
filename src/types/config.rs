//! Configuration structures.
//!
//! Configuration is built from defaults, optionally a JSON config file, then
//! overlaid with `POLYROUTE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Adapter connection transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Adapter dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Rate limiting and access control.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Circuit breaker and retry settings.
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Overlay `POLYROUTE_*` environment variables on top of this config.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("POLYROUTE_IPC_ADDR") {
            self.server.ipc_addr = addr;
        }
        if let Some(addr) = lookup("POLYROUTE_HTTP_ADDR") {
            self.server.http_addr = addr;
        }
        if let Some(level) = lookup("POLYROUTE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("POLYROUTE_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
        if let Some(ms) = lookup("POLYROUTE_HANDSHAKE_TIMEOUT_MS") {
            self.ipc.handshake_timeout = Duration::from_millis(parse_env_u64(
                "POLYROUTE_HANDSHAKE_TIMEOUT_MS",
                &ms,
            )?);
        }
        if let Some(ms) = lookup("POLYROUTE_REQUEST_TIMEOUT_MS") {
            self.dispatch.request_timeout =
                Duration::from_millis(parse_env_u64("POLYROUTE_REQUEST_TIMEOUT_MS", &ms)?);
        }
        if let Some(limit) = lookup("POLYROUTE_RATE_LIMIT") {
            let limit = parse_env_u64("POLYROUTE_RATE_LIMIT", &limit)?;
            self.policy.rate_limit = u32::try_from(limit).map_err(|_| {
                Error::configuration(format!("POLYROUTE_RATE_LIMIT out of range: {limit}"))
            })?;
        }
        Ok(())
    }

    /// Reject settings the kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.policy.rate_limit == 0 {
            return Err(Error::configuration("policy.rate_limit must be positive"));
        }
        if self.policy.rate_window.is_zero() {
            return Err(Error::configuration("policy.rate_window must be non-zero"));
        }
        if self.resilience.max_attempts == 0 {
            return Err(Error::configuration(
                "resilience.max_attempts must be positive",
            ));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(Error::configuration(
                "resilience.failure_threshold must be positive",
            ));
        }
        if self.dispatch.request_timeout.is_zero() || self.ipc.handshake_timeout.is_zero() {
            return Err(Error::configuration("timeouts must be non-zero"));
        }
        if self.ipc.max_connections == 0 || self.ipc.outbound_capacity == 0 {
            return Err(Error::configuration(
                "ipc.max_connections and ipc.outbound_capacity must be positive",
            ));
        }
        if self.ipc.heartbeat_interval.is_zero() || self.ipc.idle_timeout.is_zero() {
            return Err(Error::configuration(
                "ipc.heartbeat_interval and ipc.idle_timeout must be non-zero",
            ));
        }
        Ok(())
    }
}

fn parse_env_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::configuration(format!("{key}={value:?} is not a number: {e}")))
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address adapters and stream clients connect to.
    pub ipc_addr: String,

    /// HTTP task submission address.
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ipc_addr: "127.0.0.1:7400".to_string(),
            http_addr: "127.0.0.1:7480".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Adapter connection transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent TCP connections. Connections beyond this limit
    /// are refused.
    pub max_connections: usize,

    /// Connections silent for longer than this are dropped.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Slow consumers that cannot accept a frame within this window are dropped.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Time an adapter connection has to complete its `register` handshake.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Interval between kernel → adapter pings.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Outbound frame queue capacity per connection.
    pub outbound_capacity: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            outbound_capacity: 256,
        }
    }
}

/// Adapter dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline for one bus request to an adapter.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Rate limiting and access control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Requests allowed per source per window.
    pub rate_limit: u32,

    /// Fixed window length.
    #[serde(with = "humantime_serde")]
    pub rate_window: Duration,

    /// target → sources allowed to address it. Targets absent here are open.
    pub access: HashMap<String, Vec<String>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            rate_window: Duration::from_secs(1),
            access: HashMap::new(),
        }
    }
}

/// Circuit breaker and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures that open a breaker.
    pub failure_threshold: u32,

    /// How long a breaker stays open before allowing a trial call.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Attempts per dispatch, including the first.
    pub max_attempts: u32,

    /// Backoff unit; the wait after failed attempt `n` is `2^n * base_backoff`.
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}
