//! # Standalone Backend
//!
//! One connection pool in front of one server.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kvb_client::{ConnectionPool, MetricsSnapshot, PoolStats};
use kvb_common::{Arg, KvResult, PipePart, RespValue};

use crate::backend::{first_error, Backend, BackendKind, SCAN_CHANNEL_CAPACITY};
use crate::config::BackendConfig;
use crate::scan::scan_node;

#[derive(Debug, Clone)]
pub struct StandaloneBackend {
    pool: ConnectionPool,
}

impl StandaloneBackend {
    /// Builds the pool for `config.address`; fails if the server cannot be
    /// dialed.
    pub async fn connect(config: &BackendConfig) -> KvResult<Self> {
        let pool = ConnectionPool::new(config.pool_config(config.address.as_str())).await?;
        info!(addr = %config.address, capacity = config.pool_capacity, "connected to standalone server");
        Ok(StandaloneBackend { pool })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.pool.metrics()
    }
}

#[async_trait]
impl Backend for StandaloneBackend {
    async fn cmd(&self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        self.pool.exec(command, args).await?.into_result()
    }

    async fn pipe(&self, parts: &[PipePart]) -> KvResult<Vec<RespValue>> {
        let mut conn = self.pool.acquire().await?;
        let replies = conn.pipeline(parts).await?;
        first_error(replies)
    }

    fn scan(&self, pattern: &str, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let result = match pool.acquire().await {
                Ok(mut conn) => scan_node(&mut conn, &pattern, &tx, &cancel).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(addr = pool.addr(), pattern = %pattern, error = %err, "scan aborted");
            }
        });
        rx
    }

    async fn get_addr(&self) -> KvResult<String> {
        Ok(self.pool.addr().to_string())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Standalone
    }
}
