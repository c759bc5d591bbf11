//! # Key-Value Backends
//!
//! Purpose: Present one command/pipeline/scan surface over a standalone
//! server, a sharded cluster, or a sentinel-managed master.
//!
//! ## Design Principles
//! 1. **One Trait**: Callers hold a `SharedBackend` and never branch on the
//!    topology.
//! 2. **Explicit Construction**: `select_backend` returns an instance; there
//!    is no process-wide global.
//! 3. **Guaranteed Release**: Every borrowed connection is an RAII guard, so
//!    error and cancellation paths return it too.
//! 4. **Cancellable Scans**: Scans run as producer tasks that stop on a
//!    `CancellationToken` or when the receiver goes away.

mod backend;
mod cluster;
mod config;
mod info;
mod scan;
mod selector;
mod sentinel;
mod standalone;

pub use backend::{Backend, BackendKind, SharedBackend, SCAN_CHANNEL_CAPACITY};
pub use cluster::{ClusterBackend, MAX_REDIRECTS};
pub use config::{BackendConfig, DEFAULT_ADDRESS, DEFAULT_SENTINEL_GROUP, DEFAULT_TIMEOUT_SECS};
pub use info::{parse_info, parse_info_sections};
pub use scan::{scan_node, ScanOutcome, SCAN_BEGIN};
pub use selector::select_backend;
pub use sentinel::{SentinelBackend, SENTINEL_POOL_CAPACITY};
pub use standalone::StandaloneBackend;

pub use kvb_common::{pp, Arg, KvError, KvResult, PipePart, RespValue};
pub use tokio_util::sync::CancellationToken;
