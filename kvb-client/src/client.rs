//! # Failover Client
//!
//! Purpose: Talk to whichever of several equivalent endpoints is reachable,
//! moving to the next one when the current connection breaks.
//!
//! ## Design Principles
//! 1. **Lazy Dial**: No connection exists until the first command needs one.
//! 2. **Sticky Endpoint**: Once a connection is live it is reused until it
//!    fails; other endpoints are left alone.
//! 3. **Bounded Retry**: At most `MAX_ATTEMPTS` tries per command, no backoff.
//! 4. **Exclusive Access**: The endpoint table sits behind an async mutex
//!    held for the whole exchange.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use kvb_common::{Arg, KvError, KvResult, RespValue};

use crate::connection::{Connection, DEFAULT_TIMEOUT};
use crate::metrics::{CommandMetrics, MetricsSnapshot};

/// Attempts per command before giving up with `RetriesExhausted`.
pub const MAX_ATTEMPTS: usize = 3;

struct Endpoint {
    addr: String,
    conn: Option<Connection>,
}

/// Client that fails over between a fixed set of endpoints.
pub struct FailoverClient {
    endpoints: Mutex<Vec<Endpoint>>,
    timeout: Duration,
    metrics: Option<CommandMetrics>,
}

impl FailoverClient {
    /// Creates a client over `addrs`. Nothing is dialed yet; duplicate
    /// addresses are ignored.
    pub fn new<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for addr in addrs {
            let addr = addr.into();
            if endpoints.iter().any(|endpoint| endpoint.addr == addr) {
                continue;
            }
            endpoints.push(Endpoint { addr, conn: None });
        }
        FailoverClient {
            endpoints: Mutex::new(endpoints),
            timeout: DEFAULT_TIMEOUT,
            metrics: None,
        }
    }

    /// Overrides the dial/read timeout (defaults to `DEFAULT_TIMEOUT`).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Records per-command counters and latency.
    pub fn with_metrics(mut self) -> Self {
        self.metrics = Some(CommandMetrics::new());
        self
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(CommandMetrics::snapshot)
    }

    /// Configured endpoint addresses, in dial order.
    pub async fn endpoints(&self) -> Vec<String> {
        let endpoints = self.endpoints.lock().await;
        endpoints.iter().map(|endpoint| endpoint.addr.clone()).collect()
    }

    /// Address of the endpoint holding a live connection, if any.
    pub async fn connected_endpoint(&self) -> Option<String> {
        let endpoints = self.endpoints.lock().await;
        endpoints
            .iter()
            .find(|endpoint| endpoint.conn.is_some())
            .map(|endpoint| endpoint.addr.clone())
    }

    /// Runs one command against the current endpoint.
    ///
    /// **Logic**:
    /// 1. Use the endpoint with a live connection, else dial each in order.
    /// 2. No dialable endpoint: `NoConnectableEndpoint`.
    /// 3. Transport failure: close that connection, clear it, try again.
    ///    A call dropped mid-exchange also leaves the endpoint without a
    ///    connection.
    /// 4. After `MAX_ATTEMPTS` transport failures: `RetriesExhausted`.
    ///
    /// Server error replies are returned as `KvError::Command` and never
    /// retried.
    pub async fn cmd(&self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        let mut endpoints = self.endpoints.lock().await;

        for attempt in 1..=MAX_ATTEMPTS {
            let idx = self.live_endpoint(&mut endpoints).await?;
            let endpoint = &mut endpoints[idx];
            // Out of the table for the exchange: if this future is dropped
            // before the reply is read, the connection goes with it.
            let mut conn = match endpoint.conn.take() {
                Some(conn) => conn,
                None => continue,
            };

            let started = Instant::now();
            if let Some(metrics) = &self.metrics {
                metrics.record_start(command);
            }
            let response = conn.exec(command, args).await;
            let elapsed = started.elapsed();
            if let Some(metrics) = &self.metrics {
                metrics.record_end(elapsed, matches!(response, Ok(RespValue::Error(_)) | Err(_)));
            }
            trace!(addr = %endpoint.addr, command, ?elapsed, "command finished");

            match response {
                Ok(value) => {
                    endpoint.conn = Some(conn);
                    return value.into_result();
                }
                Err(err) if err.is_transport() => {
                    // Dropping the connection closes the socket.
                    debug!(addr = %endpoint.addr, attempt, error = %err, "dropping broken connection");
                }
                Err(err) => {
                    endpoint.conn = Some(conn);
                    return Err(err);
                }
            }
        }

        Err(KvError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn live_endpoint(&self, endpoints: &mut [Endpoint]) -> KvResult<usize> {
        if let Some(idx) = endpoints.iter().position(|endpoint| endpoint.conn.is_some()) {
            return Ok(idx);
        }

        for (idx, endpoint) in endpoints.iter_mut().enumerate() {
            match Connection::connect(&endpoint.addr, self.timeout).await {
                Ok(conn) => {
                    endpoint.conn = Some(conn);
                    return Ok(idx);
                }
                Err(err) => debug!(addr = %endpoint.addr, error = %err, "endpoint not reachable"),
            }
        }

        Err(KvError::NoConnectableEndpoint)
    }
}

impl std::fmt::Debug for FailoverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
