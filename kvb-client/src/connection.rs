//! # Single Connection
//!
//! Purpose: Own one TCP stream to one endpoint and exchange RESP2 frames
//! over it.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Read and write buffers live on the connection.
//! 2. **Bounded Waits**: Dial, write and read are each capped by `timeout`.
//! 3. **No Sharing**: `&mut self` on every exchange; callers that share a
//!    connection must synchronize outside of it.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use kvb_common::{encode_command, Arg, KvError, KvResult, PipePart, RespDecoder, RespValue};

/// Transport timeout applied to dials, writes and reads.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Single TCP connection with reusable buffers.
pub struct Connection {
    addr: String,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    decoder: RespDecoder,
    timeout: Duration,
}

impl Connection {
    /// Dials `addr` within `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> KvResult<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(KvError::Connection {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(KvError::Connection {
                    addr: addr.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("dial timed out after {:?}", timeout),
                    ),
                })
            }
        };
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        debug!(addr, "connection established");

        Ok(Connection {
            addr: addr.to_string(),
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: Vec::with_capacity(256),
            decoder: RespDecoder::new(),
            timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one command and returns the raw reply frame.
    ///
    /// Error replies come back as `RespValue::Error`; only transport and
    /// framing failures are `Err`.
    pub async fn exec(&mut self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        self.write_buf.clear();
        encode_command(command, args, &mut self.write_buf);
        self.flush_request().await?;
        self.read_reply().await
    }

    /// Writes every part in one batch, then reads one reply per part in
    /// request order.
    ///
    /// All replies are drained even when some are errors, so the stream stays
    /// aligned for the next borrower.
    pub async fn pipeline(&mut self, parts: &[PipePart]) -> KvResult<Vec<RespValue>> {
        self.write_buf.clear();
        for part in parts {
            encode_command(&part.command, &part.args, &mut self.write_buf);
        }
        self.flush_request().await?;

        let mut replies = Vec::with_capacity(parts.len());
        for _ in parts {
            replies.push(self.read_reply().await?);
        }
        Ok(replies)
    }

    async fn flush_request(&mut self) -> KvResult<()> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let payload = &self.write_buf;
        let write = async move {
            stream.write_all(payload).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::timeout(timeout)),
        }
    }

    async fn read_reply(&mut self) -> KvResult<RespValue> {
        loop {
            if let Some(value) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(value);
            }
            let read = tokio::time::timeout(self.timeout, self.stream.read_buf(&mut self.read_buf));
            match read.await {
                Ok(Ok(0)) => {
                    return Err(KvError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(KvError::Io(err)),
                Err(_) => return Err(KvError::timeout(self.timeout)),
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("addr", &self.addr).finish()
    }
}
