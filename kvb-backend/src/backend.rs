use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kvb_common::{Arg, KvResult, PipePart, RespValue};

/// Buffered keys between a scan producer and its consumer.
pub const SCAN_CHANNEL_CAPACITY: usize = 64;

/// Handle shared by every caller once a backend is constructed.
pub type SharedBackend = Arc<dyn Backend>;

/// Topology a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Standalone,
    Cluster,
    Sentinel,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Standalone => "standalone",
            BackendKind::Cluster => "cluster",
            BackendKind::Sentinel => "sentinel",
        };
        f.write_str(name)
    }
}

/// Command surface shared by the standalone, cluster and sentinel backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Runs one command. Server error replies come back as
    /// `KvError::Command`.
    async fn cmd(&self, command: &str, args: &[Arg]) -> KvResult<RespValue>;

    /// Runs a batch in order and returns one reply per part. The first error
    /// reply aborts the batch and is returned instead. Not atomic.
    async fn pipe(&self, parts: &[PipePart]) -> KvResult<Vec<RespValue>>;

    /// Streams every key matching `pattern`. The channel closes when the
    /// key space is exhausted, on error (logged), or once `cancel` fires.
    ///
    /// Keys written or deleted while the scan runs may be missed or repeated.
    fn scan(&self, pattern: &str, cancel: CancellationToken) -> mpsc::Receiver<String>;

    /// An address usable for out-of-band connections.
    async fn get_addr(&self) -> KvResult<String>;

    fn kind(&self) -> BackendKind;
}

/// Returns the replies of a pipeline, or the first error reply among them.
pub(crate) fn first_error(replies: Vec<RespValue>) -> KvResult<Vec<RespValue>> {
    replies.into_iter().map(RespValue::into_result).collect()
}
