//! # Async Client Layer
//!
//! Purpose: Provide Redis-compatible connections, a bounded connection pool
//! and a minimal failover client for the backend crate.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **RAII Release**: A borrowed connection goes back to its pool on drop,
//!    on every exit path.
//! 3. **Backpressure over Rejection**: Borrowers beyond capacity wait.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod client;
mod connection;
mod metrics;
mod pool;

pub use client::{FailoverClient, MAX_ATTEMPTS};
pub use connection::{Connection, DEFAULT_TIMEOUT};
pub use metrics::{CommandMetrics, LatencySnapshot, MetricsSnapshot, DEFAULT_LATENCY_BUCKETS_US};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection, DEFAULT_POOL_CAPACITY};
