//! Client configuration, loadable from TOML or JSON files.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Dialect;

/// How asynchronous calls are grouped before hitting the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Every asynchronous call is sent on its own as soon as it is made.
    #[default]
    Immediate,
    /// Calls made between `start_batch` and `flush_batch` are sent together.
    Manual,
    /// Calls are collected for `auto_flush_delay_ms`, then flushed together.
    AutoFlush,
}

/// How a partition's deadline is derived from its members' timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Sum of member timeouts.
    #[default]
    Sum,
    /// Largest member timeout.
    Max,
}

impl TimeoutPolicy {
    /// Aggregate timeout for a set of member timeouts.
    pub fn aggregate<I>(&self, timeouts: I) -> Duration
    where
        I: IntoIterator<Item = Duration>,
    {
        match self {
            TimeoutPolicy::Sum => timeouts.into_iter().sum(),
            TimeoutPolicy::Max => timeouts.into_iter().max().unwrap_or_default(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Switch for the whole cache.
    pub enabled: bool,
    /// TTL used when a cacheable call does not declare one.
    pub default_ttl_ms: u64,
    /// Bound on the number of cached results.
    pub max_entries: usize,
    /// Bound on the approximate serialized size of all cached values.
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            default_ttl_ms: 60_000,
            max_entries: 1_000,
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Credentials for digest and bearer authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    /// Digest password.
    pub password: Option<String>,
    /// Token scheme, e.g. `Bearer`.
    pub token_type: Option<String>,
    /// Initial bearer token.
    pub access_token: Option<String>,
    /// Lifetime of `access_token` from client start, if known.
    pub token_lifetime_ms: Option<u64>,
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server URL.
    pub endpoint: String,
    /// JSON-RPC version spoken.
    pub dialect: Dialect,
    /// When queued calls are flushed.
    pub batch_mode: BatchMode,
    /// Delay before an automatic flush.
    pub auto_flush_delay_ms: u64,
    /// Concurrent connections per flush on a high-bandwidth network.
    pub max_connections_high_bandwidth: usize,
    /// Concurrent connections per flush on a constrained network.
    pub max_connections_constrained: usize,
    /// Whether method timeouts apply.
    pub timeout_policy: TimeoutPolicy,
    /// Default per-method timeout; 0 disables it.
    pub method_timeout_ms: u64,
    /// Connect timeout handed to the transport.
    pub connect_timeout_ms: u64,
    /// Use observed latency to balance partitions (longest-first).
    pub weighted_partitioning: bool,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Credentials.
    pub auth: AuthConfig,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("http://127.0.0.1:8080/rpc"),
            dialect: Dialect::JsonRpc2,
            batch_mode: BatchMode::Immediate,
            auto_flush_delay_ms: 20,
            max_connections_high_bandwidth: 4,
            max_connections_constrained: 2,
            timeout_policy: TimeoutPolicy::Sum,
            method_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            weighted_partitioning: false,
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
            headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Load a configuration file; the format follows the extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClientConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.is_empty() {
            anyhow::bail!("endpoint must not be empty");
        }
        if self.max_connections_high_bandwidth == 0 || self.max_connections_constrained == 0 {
            anyhow::bail!("connection limits must be at least 1");
        }
        if self.batch_mode == BatchMode::AutoFlush && self.auto_flush_delay_ms == 0 {
            anyhow::bail!("auto_flush_delay_ms must be positive in auto_flush mode");
        }
        Ok(())
    }

    /// `method_timeout_ms` as a duration.
    pub fn method_timeout(&self) -> Duration {
        Duration::from_millis(self.method_timeout_ms)
    }

    /// `auto_flush_delay_ms` as a duration.
    pub fn auto_flush_delay(&self) -> Duration {
        Duration::from_millis(self.auto_flush_delay_ms)
    }
}
