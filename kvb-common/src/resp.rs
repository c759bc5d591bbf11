//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server frames from a growing
//! read buffer.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: A partial frame consumes nothing; the caller
//!    reads more bytes and tries again.
//! 2. **Buffer Reuse**: Callers own the buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, BytesMut};

use crate::error::{KvError, KvResult};
use crate::value::{Arg, RespValue};

/// Nesting bound for arrays; deeper frames are rejected as malformed.
const MAX_DEPTH: usize = 32;

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(command: &str, args: &[Arg], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len() + 1);
    out.extend_from_slice(b"\r\n");
    push_bulk(out, command.as_bytes());
    for arg in args {
        push_bulk(out, &arg.to_bytes());
    }
}

/// Encodes a RESP2 value as a server would send it.
pub fn encode_value(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(text) => {
            out.push(b'+');
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Error(message) => {
            out.push(b'-');
            out.extend_from_slice(message.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            out.push(b':');
            out.extend_from_slice(value.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::Bulk(Some(data)) => push_bulk(out, data),
        RespValue::Array(items) => {
            out.push(b'*');
            push_usize(out, items.len());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

/// Stateless frame decoder over a `BytesMut` read buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespDecoder;

impl RespDecoder {
    pub fn new() -> Self {
        RespDecoder
    }

    /// Decodes one complete frame from the front of `buf`.
    ///
    /// **Input**: buffer holding zero or more bytes received so far.
    /// **Output**: `Ok(Some(value))` with the frame removed from `buf`,
    /// `Ok(None)` when the frame is incomplete (buffer untouched), or a
    /// protocol error.
    pub fn decode(&self, buf: &mut BytesMut) -> KvResult<Option<RespValue>> {
        match parse_frame(&buf[..], 0, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn parse_frame(data: &[u8], start: usize, depth: usize) -> KvResult<Option<(RespValue, usize)>> {
    if depth > MAX_DEPTH {
        return Err(KvError::Protocol("array nesting too deep".into()));
    }
    let (line, next) = match read_line(data, start)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(KvError::Protocol("empty frame header".into()));
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(to_text(&line[1..])), next))),
        b'-' => Ok(Some((RespValue::Error(to_text(&line[1..])), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let len = len as usize;
            let end = next + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(KvError::Protocol("bulk string missing CRLF".into()));
            }
            Ok(Some((RespValue::Bulk(Some(data[next..end].to_vec())), end + 2)))
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            if len <= 0 {
                return Ok(Some((RespValue::Array(Vec::new()), next)));
            }
            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut cursor = next;
            for _ in 0..len {
                match parse_frame(data, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(KvError::Protocol(format!("invalid type byte {:#04x}", other))),
    }
}

/// Returns the line starting at `start` without its CRLF, and the offset just
/// past the CRLF.
fn read_line(data: &[u8], start: usize) -> KvResult<Option<(&[u8], usize)>> {
    let rest = match data.get(start..) {
        Some(rest) => rest,
        None => return Ok(None),
    };
    match rest.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            if pos == 0 || rest[pos - 1] != b'\r' {
                return Err(KvError::Protocol("line not terminated by CRLF".into()));
            }
            Ok(Some((&rest[..pos - 1], start + pos + 1)))
        }
        None => Ok(None),
    }
}

fn to_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> KvResult<i64> {
    if data.is_empty() {
        return Err(KvError::Protocol("empty integer".into()));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(KvError::Protocol("empty integer".into()));
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(KvError::Protocol("invalid integer".into()));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_usize(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
