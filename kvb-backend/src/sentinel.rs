//! # Sentinel Backend
//!
//! Purpose: Run commands on whichever server the sentinels currently report
//! as master of one group.
//!
//! ## Design Principles
//! 1. **Resolve Every Call**: Each operation asks the sentinels, in order,
//!    for the master. Which sentinel answered last is not remembered.
//! 2. **Every Sentinel Stays Listed**: A sentinel that cannot be dialed is
//!    dialed again the next time it is asked.
//! 3. **One Master Pool**: When the sentinels report a new master, its pool
//!    replaces the previous master's, which closes once its last borrower
//!    is done.
//! 4. **Last Error Wins**: When no sentinel yields a usable master, the last
//!    error observed is returned.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvb_client::ConnectionPool;
use kvb_common::{Arg, KvError, KvResult, PipePart, RespValue};

use crate::backend::{first_error, Backend, BackendKind, SCAN_CHANNEL_CAPACITY};
use crate::config::BackendConfig;
use crate::scan::scan_node;

/// Connections kept per sentinel.
pub const SENTINEL_POOL_CAPACITY: usize = 10;

/// One configured sentinel; its pool is built on first successful dial.
struct SentinelSlot {
    addr: String,
    pool: OnceCell<ConnectionPool>,
}

struct SentinelInner {
    config: BackendConfig,
    sentinels: Vec<SentinelSlot>,
    master: Mutex<Option<ConnectionPool>>,
}

/// Sentinel backend handle. Cloning shares sentinel and master pools.
#[derive(Clone)]
pub struct SentinelBackend {
    inner: Arc<SentinelInner>,
}

impl SentinelBackend {
    /// Dials every configured sentinel and resolves the master once.
    /// Sentinels that cannot be dialed yet are kept and retried on later
    /// calls; at least one must answer now.
    pub async fn connect(config: &BackendConfig) -> KvResult<Self> {
        let backend = SentinelBackend {
            inner: Arc::new(SentinelInner {
                config: config.clone(),
                sentinels: config
                    .sentinel_addresses
                    .iter()
                    .map(|addr| SentinelSlot {
                        addr: addr.clone(),
                        pool: OnceCell::new(),
                    })
                    .collect(),
                master: Mutex::new(None),
            }),
        };

        let mut reachable = 0;
        for slot in &backend.inner.sentinels {
            match backend.sentinel_pool(slot).await {
                Ok(_) => reachable += 1,
                Err(err) => warn!(addr = %slot.addr, error = %err, "sentinel not reachable yet"),
            }
        }
        if reachable == 0 {
            return Err(KvError::NoConnectableEndpoint);
        }

        let master = backend.resolve_master().await?;
        info!(group = %config.sentinel_group, master = master.addr(), sentinels = reachable, "connected through sentinel");
        Ok(backend)
    }

    pub fn group(&self) -> &str {
        &self.inner.config.sentinel_group
    }

    /// Asks each sentinel in order for the group's master and returns a pool
    /// to the first master that can be dialed.
    pub async fn resolve_master(&self) -> KvResult<ConnectionPool> {
        let mut last_err = None;
        for slot in &self.inner.sentinels {
            let resolved = match self.sentinel_pool(slot).await {
                Ok(sentinel) => match self.query_master(sentinel).await {
                    Ok(addr) => self.master_pool(&addr).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match resolved {
                Ok(pool) => return Ok(pool),
                Err(err) => {
                    debug!(sentinel = %slot.addr, error = %err, "sentinel gave no usable master");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| KvError::MasterUnavailable {
            group: self.group().to_string(),
        }))
    }

    /// Address of the master pool currently held, if any.
    pub fn current_master(&self) -> Option<String> {
        self.inner.master.lock().as_ref().map(|pool| pool.addr().to_string())
    }

    async fn sentinel_pool<'a>(&self, slot: &'a SentinelSlot) -> KvResult<&'a ConnectionPool> {
        slot.pool
            .get_or_try_init(|| {
                let pool_config = self
                    .inner
                    .config
                    .pool_config(slot.addr.as_str())
                    .with_capacity(SENTINEL_POOL_CAPACITY);
                ConnectionPool::new(pool_config)
            })
            .await
    }

    async fn query_master(&self, sentinel: &ConnectionPool) -> KvResult<String> {
        let args = [Arg::from("get-master-addr-by-name"), Arg::from(self.group())];
        let reply = sentinel.exec("SENTINEL", &args).await?.into_result()?;
        if reply.is_null() {
            return Err(KvError::MasterUnavailable {
                group: self.group().to_string(),
            });
        }
        let mut parts = reply.into_array()?.into_iter();
        match (parts.next(), parts.next()) {
            (Some(host), Some(port)) => Ok(format!("{}:{}", host.into_string()?, port.into_string()?)),
            _ => Err(KvError::unexpected("[host, port]", "short array")),
        }
    }

    async fn master_pool(&self, addr: &str) -> KvResult<ConnectionPool> {
        let cached = self.inner.master.lock().clone();
        if let Some(pool) = cached.filter(|pool| pool.addr() == addr) {
            return Ok(pool);
        }
        let pool = ConnectionPool::new(self.inner.config.pool_config(addr)).await?;

        let mut master = self.inner.master.lock();
        match master.as_ref() {
            Some(current) if current.addr() == addr => Ok(current.clone()),
            current => {
                debug!(
                    group = %self.group(),
                    master = addr,
                    previous = ?current.map(|pool| pool.addr()),
                    "switching master pool"
                );
                *master = Some(pool.clone());
                Ok(pool)
            }
        }
    }
}

#[async_trait]
impl Backend for SentinelBackend {
    async fn cmd(&self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        let master = self.resolve_master().await?;
        master.exec(command, args).await?.into_result()
    }

    async fn pipe(&self, parts: &[PipePart]) -> KvResult<Vec<RespValue>> {
        let master = self.resolve_master().await?;
        let mut conn = master.acquire().await?;
        let replies = conn.pipeline(parts).await?;
        first_error(replies)
    }

    fn scan(&self, pattern: &str, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let backend = self.clone();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            let result = match backend.resolve_master().await {
                Ok(master) => match master.acquire().await {
                    Ok(mut conn) => scan_node(&mut conn, &pattern, &tx, &cancel).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(group = %backend.group(), pattern = %pattern, error = %err, "scan aborted");
            }
        });
        rx
    }

    async fn get_addr(&self) -> KvResult<String> {
        let master = self.resolve_master().await?;
        Ok(master.addr().to_string())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sentinel
    }
}

impl std::fmt::Debug for SentinelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelBackend")
            .field("group", &self.inner.config.sentinel_group)
            .field("sentinels", &self.inner.sentinels.len())
            .field("master", &self.current_master())
            .finish()
    }
}
