//! # Error Taxonomy
//!
//! Purpose: One error type shared by every layer, so a failure keeps its
//! classification from the socket up to the backend caller.
//!
//! ## Design Principles
//! 1. **Transport vs. Command**: Transport failures poison a connection,
//!    command failures do not. `is_transport` is the single place that decides.
//! 2. **Typed Values**: Errors are returned, never logged-and-swallowed, except
//!    for the per-node scan truncation documented in the backend crate.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the workspace.
pub type KvResult<T> = Result<T, KvError>;

/// Errors surfaced by connections, pools and backends.
#[derive(Error, Debug)]
pub enum KvError {
    /// Dialing an endpoint failed.
    #[error("failed to connect to {addr}: {source}")]
    Connection { addr: String, source: io::Error },

    /// Transport broke mid-operation (includes read/write timeouts).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent bytes that are not valid RESP2.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Command(String),

    /// The reply did not have the shape the caller asked for.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    /// No configured endpoint accepted a connection.
    #[error("no connectable endpoints")]
    NoConnectableEndpoint,

    /// Every attempt hit a transport failure.
    #[error("could not find usable endpoint after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// Cluster topology could not be loaded or a key could not be routed.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Sentinel has no master for the requested group.
    #[error("no master available for group {group}")]
    MasterUnavailable { group: String },

    /// Configuration rejected before any connection was made.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl KvError {
    /// Returns true when the connection that produced this error must not be
    /// reused.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            KvError::Io(_) | KvError::Protocol(_) | KvError::Connection { .. }
        )
    }

    /// Builds the `Io` variant used when a read or dial exceeds its deadline.
    pub fn timeout(after: Duration) -> Self {
        KvError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("operation timed out after {:?}", after),
        ))
    }

    pub fn unexpected(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        KvError::UnexpectedResponse {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
