//! # Scan Cursor Protocol
//!
//! Walks one node's `SCAN` cursor from the begin token until the server hands
//! it back, pushing every matching key into a channel.
//!
//! The walk inherits the server's consistency: keys mutated during the scan
//! may be skipped or reported twice.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use kvb_client::PooledConnection;
use kvb_common::{Arg, KvError, KvResult, RespValue};

/// Cursor that starts a scan and, when returned, ends it.
pub const SCAN_BEGIN: &str = "0";

/// How a node scan ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The cursor came back to `SCAN_BEGIN`.
    Exhausted,
    /// The token fired or the receiver was dropped; callers should not scan
    /// further nodes.
    Stopped,
}

/// Scans every key on the node behind `conn` that matches `pattern`.
pub async fn scan_node(
    conn: &mut PooledConnection,
    pattern: &str,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> KvResult<ScanOutcome> {
    let mut cursor = SCAN_BEGIN.to_string();

    loop {
        if cancel.is_cancelled() || tx.is_closed() {
            return Ok(ScanOutcome::Stopped);
        }

        let args = [
            Arg::from(cursor.as_str()),
            Arg::from("MATCH"),
            Arg::from(pattern),
        ];
        let reply = conn.exec("SCAN", &args).await?.into_result()?;
        let (next, keys) = parse_scan_reply(reply)?;
        trace!(addr = conn.addr(), cursor = %cursor, next = %next, keys = keys.len(), "scan page");

        for key in keys {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ScanOutcome::Stopped),
                sent = tx.send(key) => {
                    if sent.is_err() {
                        return Ok(ScanOutcome::Stopped);
                    }
                }
            }
        }

        if next == SCAN_BEGIN {
            return Ok(ScanOutcome::Exhausted);
        }
        cursor = next;
    }
}

/// Splits a `[next_cursor, [key, ...]]` reply.
fn parse_scan_reply(reply: RespValue) -> KvResult<(String, Vec<String>)> {
    let mut parts = reply.into_array()?.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(cursor), Some(keys), None) => Ok((cursor.into_string()?, keys.into_string_list()?)),
        _ => Err(KvError::unexpected("two-element scan reply", "other array")),
    }
}
