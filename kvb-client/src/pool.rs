//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to one endpoint and bound how many are lent
//! out at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Backpressure**: A semaphore permit per lent connection; borrowers
//!    beyond capacity wait for a permit instead of failing.
//! 4. **Discard on Breakage**: A connection that hit a transport error is
//!    dropped instead of returned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use kvb_common::{Arg, KvError, KvResult, PipePart, RespValue};

use crate::connection::{Connection, DEFAULT_TIMEOUT};
use crate::metrics::{CommandMetrics, MetricsSnapshot};

/// Default maximum number of connections lent out at once.
pub const DEFAULT_POOL_CAPACITY: usize = 200;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum connections lent out at once.
    pub capacity: usize,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Dial/read/write timeout for every connection.
    pub timeout: Duration,
    /// Record per-command metrics.
    pub metrics: bool,
}

impl PoolConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        PoolConfig {
            addr: addr.into(),
            capacity: DEFAULT_POOL_CAPACITY,
            max_idle: DEFAULT_POOL_CAPACITY,
            timeout: DEFAULT_TIMEOUT,
            metrics: false,
        }
    }

    /// Sets capacity and keeps `max_idle` within it.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self.max_idle = self.max_idle.min(capacity);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<VecDeque<Connection>>,
    permits: Arc<Semaphore>,
    metrics: Option<CommandMetrics>,
}

/// Connection pool handle. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool and dials its first connection, so an unreachable
    /// endpoint fails here rather than on first use.
    pub async fn new(config: PoolConfig) -> KvResult<Self> {
        if config.capacity == 0 {
            return Err(KvError::InvalidConfig("pool capacity must be positive".into()));
        }
        let first = Connection::connect(&config.addr, config.timeout).await?;
        debug!(addr = %config.addr, capacity = config.capacity, "connection pool ready");

        let mut idle = VecDeque::with_capacity(config.max_idle.min(16));
        idle.push_back(first);
        let metrics = config.metrics.then(CommandMetrics::new);
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.capacity)),
                idle: Mutex::new(idle),
                metrics,
                config,
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.config.addr
    }

    /// Borrows a connection, waiting while the pool is at capacity.
    ///
    /// **Logic**:
    /// 1. Take a permit (this is the wait point).
    /// 2. Reuse an idle connection, or dial a new one.
    /// 3. A failed dial drops the permit with the error.
    pub async fn acquire(&self) -> KvResult<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KvError::Io(std::io::Error::other("connection pool closed")))?;

        let conn = match self.pop_idle() {
            Some(conn) => conn,
            None => Connection::connect(&self.inner.config.addr, self.inner.config.timeout).await?,
        };
        Ok(PooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
            valid: true,
            _permit: permit,
        })
    }

    /// Borrows a connection and runs one command on it.
    pub async fn exec(&self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        let mut conn = self.acquire().await?;
        conn.exec(command, args).await
    }

    pub fn stats(&self) -> PoolStats {
        let capacity = self.inner.config.capacity;
        PoolStats {
            capacity,
            idle: self.inner.idle.lock().len(),
            in_use: capacity - self.inner.permits.available_permits(),
        }
    }

    /// Command metrics, when the pool was built with metrics enabled.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.metrics.as_ref().map(CommandMetrics::snapshot)
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.inner.idle.lock().pop_front()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.config.addr)
            .field("stats", &self.stats())
            .finish()
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
    // Released after the connection is back in the idle list.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn addr(&self) -> &str {
        &self.pool.config.addr
    }

    /// Executes one command and returns the raw reply frame.
    ///
    /// If this future is dropped mid-exchange the connection is not returned
    /// to the pool: its reply may still be in flight.
    pub async fn exec(&mut self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        let reusable = self.begin_exchange();
        let conn = self.conn.as_mut().ok_or_else(released)?;
        let started = Instant::now();
        if let Some(metrics) = &self.pool.metrics {
            metrics.record_start(command);
        }

        let response = conn.exec(command, args).await;

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.pool.metrics {
            let failed = matches!(response, Ok(RespValue::Error(_)) | Err(_));
            metrics.record_end(elapsed, failed);
        }
        trace!(addr = %self.pool.config.addr, command, ?elapsed, "command finished");
        self.finish_exchange(reusable, &response);
        response
    }

    /// Pipelines every part on this connection; replies come back in request
    /// order. Each part is recorded as one command in the metrics.
    pub async fn pipeline(&mut self, parts: &[PipePart]) -> KvResult<Vec<RespValue>> {
        let reusable = self.begin_exchange();
        let conn = self.conn.as_mut().ok_or_else(released)?;
        let started = Instant::now();
        if let Some(metrics) = &self.pool.metrics {
            for part in parts {
                metrics.record_start(&part.command);
            }
        }

        let response = conn.pipeline(parts).await;

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.pool.metrics {
            match &response {
                Ok(replies) => {
                    for reply in replies {
                        metrics.record_end(elapsed, matches!(reply, RespValue::Error(_)));
                    }
                }
                Err(_) => {
                    for _ in parts {
                        metrics.record_end(elapsed, true);
                    }
                }
            }
        }
        trace!(addr = %self.pool.config.addr, parts = parts.len(), ?elapsed, "pipeline finished");
        self.finish_exchange(reusable, &response);
        response
    }

    /// Drops the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.valid = false;
    }

    // The connection counts as broken until the exchange completes.
    fn begin_exchange(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }

    fn finish_exchange<T>(&mut self, reusable: bool, response: &KvResult<T>) {
        match response {
            Err(err) if err.is_transport() => {
                // If IO/protocol fails, do not return this connection to the pool.
                debug!(addr = %self.pool.config.addr, error = %err, "discarding broken connection");
            }
            _ => self.valid = reusable,
        }
    }
}

fn released() -> KvError {
    KvError::Io(std::io::Error::other("connection already released"))
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if !self.valid {
            return;
        }

        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.config.max_idle {
            idle.push_back(conn);
        }
    }
}
