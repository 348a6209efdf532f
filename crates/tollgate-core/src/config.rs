//! Gateway configuration.
//!
//! Every knob has a default, so `GatewayConfig::default()` is a working
//! setup. YAML loading is provided for the CLI and for embedders that keep
//! configuration in files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::FingerprintScope;
use crate::ledger::{QuotaPolicy, RateTable};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_secs_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs: HashMap<&String, u64> = map.iter().map(|(k, v)| (k, v.as_secs())).collect();
        secs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = HashMap::<String, u64>::deserialize(deserializer)?;
        Ok(secs
            .into_iter()
            .map(|(k, v)| (k, Duration::from_secs(v)))
            .collect())
    }
}

/// Cache layer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Time-to-live stamped on new entries (in seconds).
    #[serde(with = "duration_secs")]
    pub ttl: Duration,

    /// Per-operation TTL overrides (in seconds); unlisted operations use `ttl`.
    #[serde(with = "duration_secs_map")]
    pub ttl_overrides: HashMap<String, Duration>,

    /// Total-size ceiling that triggers LRU eviction.
    pub size_ceiling_bytes: u64,

    /// Whether the provider chain participates in cache keys.
    pub scope: FingerprintScope,

    /// File-backed cache when set; in-memory otherwise.
    pub storage_path: Option<PathBuf>,
}

impl CacheConfig {
    /// Effective TTL for an operation.
    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.ttl_overrides.get(operation).copied().unwrap_or(self.ttl)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(7 * 24 * 3600),
            ttl_overrides: HashMap::new(),
            size_ceiling_bytes: 500 * 1024 * 1024,
            scope: FingerprintScope::default(),
            storage_path: None,
        }
    }
}

/// Circuit breaker knobs, applied per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Cooldown before an open circuit admits a probe (in seconds).
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry and failover knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts allowed against one provider before failing over.
    pub max_retries_per_provider: u32,

    /// First backoff delay; doubles each retry (in seconds).
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    /// Backoff cap (in seconds).
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Hard bound on a single invoke call (in seconds).
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_per_provider: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration handed to the gateway at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,

    /// Spending ceilings; `None` disables the quota gate.
    pub quota: Option<QuotaPolicy>,

    /// Unit rates used by the ledger.
    #[serde(default = "RateTable::builtin")]
    pub rates: RateTable,

    /// File-backed usage ledger when set; in-memory otherwise.
    pub usage_storage_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            quota: Some(QuotaPolicy::default()),
            rates: RateTable::builtin(),
            usage_storage_path: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }
}
