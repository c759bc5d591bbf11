//! # Backend Configuration
//!
//! Every field is optional; missing ones take the defaults below. The older
//! `redis_*` field names are accepted as aliases.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kvb_client::{PoolConfig, DEFAULT_POOL_CAPACITY};
use kvb_common::{KvError, KvResult};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6379";
pub const DEFAULT_SENTINEL_GROUP: &str = "master";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Standalone endpoint, and the seed node in cluster mode.
    #[serde(alias = "redis_addr")]
    pub address: String,
    #[serde(alias = "redis_sentinel_addr")]
    pub sentinel_addresses: Vec<String>,
    /// Master group resolved through the sentinels.
    #[serde(alias = "redis_sentinel_group")]
    pub sentinel_group: String,
    #[serde(alias = "redis_cluster")]
    pub use_cluster: bool,
    /// Takes precedence over `use_cluster`.
    #[serde(alias = "redis_sentinel")]
    pub use_sentinel: bool,
    /// Maximum connections lent out at once, per pool.
    pub pool_capacity: usize,
    /// Dial and read timeout for every connection.
    pub timeout_secs: u64,
    /// Record per-command counters and latency in every pool.
    pub debug_metrics: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            address: DEFAULT_ADDRESS.to_string(),
            sentinel_addresses: Vec::new(),
            sentinel_group: DEFAULT_SENTINEL_GROUP.to_string(),
            use_cluster: false,
            use_sentinel: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            debug_metrics: false,
        }
    }
}

impl BackendConfig {
    /// Standalone configuration for `address` with every other field at its
    /// default.
    pub fn standalone(address: impl Into<String>) -> Self {
        BackendConfig {
            address: address.into(),
            ..BackendConfig::default()
        }
    }

    pub fn from_json_str(json: &str) -> KvResult<Self> {
        serde_json::from_str(json).map_err(|err| KvError::InvalidConfig(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| KvError::InvalidConfig(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&json)
    }

    /// Rejects settings no backend can be built from.
    pub fn validate(&self) -> KvResult<()> {
        if self.pool_capacity == 0 {
            return Err(KvError::InvalidConfig("pool_capacity must be positive".into()));
        }
        if self.timeout_secs == 0 {
            return Err(KvError::InvalidConfig("timeout_secs must be positive".into()));
        }
        if self.use_sentinel {
            if self.sentinel_addresses.is_empty() {
                return Err(KvError::InvalidConfig(
                    "sentinel mode needs at least one sentinel address".into(),
                ));
            }
            if self.sentinel_group.is_empty() {
                return Err(KvError::InvalidConfig("sentinel mode needs a group name".into()));
            }
        } else if self.address.is_empty() {
            return Err(KvError::InvalidConfig("address must not be empty".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Pool settings for one node.
    pub fn pool_config(&self, addr: impl Into<String>) -> PoolConfig {
        PoolConfig::new(addr)
            .with_capacity(self.pool_capacity)
            .with_timeout(self.timeout())
            .with_metrics(self.debug_metrics)
    }
}
