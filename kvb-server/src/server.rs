//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them against the
//! in-memory store and the server's role (standalone, cluster node, sentinel).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use kvb_common::{encode_value, key_slot, RespDecoder, RespValue};

use crate::store::DEFAULT_SCAN_COUNT;
use crate::{Role, ServerState};

type KeyHandler = fn(&[Vec<u8>], &ServerState) -> RespValue;

/// Per-connection flags.
#[derive(Default)]
struct Session {
    asking: bool,
}

/// Handles a single TCP client connection until it closes, a fault is
/// injected, or the server shuts down.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let decoder = RespDecoder::new();
    let mut session = Session::default();
    let mut out = Vec::with_capacity(256);

    loop {
        let bytes = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = stream.read_buf(&mut buffer) => read?,
        };
        if bytes == 0 {
            break;
        }

        loop {
            let frame = match decoder.decode(&mut buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => {
                    stream.write_all(b"-ERR protocol error\r\n").await?;
                    return Ok(());
                }
            };
            let args = match command_args(frame) {
                Some(args) if !args.is_empty() => args,
                _ => {
                    stream.write_all(b"-ERR invalid request\r\n").await?;
                    continue;
                }
            };

            state.stats.commands.fetch_add(1, Ordering::Relaxed);
            if state.take_drop_fault() {
                trace!(addr = %state.addr, "dropping connection on injected fault");
                return Ok(());
            }

            let response = dispatch_command(&args, &state, &mut session).await;
            out.clear();
            encode_value(&response, &mut out);
            stream.write_all(&out).await?;
        }
    }

    Ok(())
}

fn command_args(frame: RespValue) -> Option<Vec<Vec<u8>>> {
    match frame {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(data)) => Some(data),
                RespValue::Simple(text) => Some(text.into_bytes()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

async fn dispatch_command(args: &[Vec<u8>], state: &ServerState, session: &mut Session) -> RespValue {
    let cmd = &args[0];
    let asking = std::mem::take(&mut session.asking);

    if eq_ignore_ascii_case(cmd, b"PING") {
        return handle_ping(args);
    }
    if eq_ignore_ascii_case(cmd, b"ECHO") {
        return match args.get(1) {
            Some(data) if args.len() == 2 => bulk(data),
            _ => wrong_args("ECHO"),
        };
    }
    if eq_ignore_ascii_case(cmd, b"ASKING") {
        session.asking = true;
        return ok();
    }
    if eq_ignore_ascii_case(cmd, b"INFO") {
        return handle_info(state);
    }
    if eq_ignore_ascii_case(cmd, b"DEBUG") {
        return handle_debug(args).await;
    }
    if eq_ignore_ascii_case(cmd, b"SCAN") {
        return handle_scan(args, state);
    }
    if eq_ignore_ascii_case(cmd, b"DBSIZE") {
        return RespValue::Integer(state.store.len() as i64);
    }
    if eq_ignore_ascii_case(cmd, b"FLUSHALL") {
        state.store.clear();
        return ok();
    }
    if eq_ignore_ascii_case(cmd, b"CLUSTER") {
        return handle_cluster(args, state);
    }
    if eq_ignore_ascii_case(cmd, b"SENTINEL") {
        return handle_sentinel(args, state);
    }

    let key_commands: [(&[u8], KeyHandler); 5] = [
        (&b"GET"[..], handle_get as KeyHandler),
        (&b"SET"[..], handle_set as KeyHandler),
        (&b"DEL"[..], handle_del as KeyHandler),
        (&b"EXISTS"[..], handle_exists as KeyHandler),
        (&b"INCR"[..], handle_incr as KeyHandler),
    ];
    for (name, handler) in key_commands {
        if eq_ignore_ascii_case(cmd, name) {
            if let Some(redirect) = args.get(1).and_then(|key| redirect_for(key, state, asking)) {
                return redirect;
            }
            return handler(args, state);
        }
    }

    error(&format!(
        "ERR unknown command '{}'",
        String::from_utf8_lossy(cmd)
    ))
}

/// Cluster nodes answer MOVED for slots they do not own, and ASK for keys of
/// a migrating slot that already left.
fn redirect_for(key: &[u8], state: &ServerState, asking: bool) -> Option<RespValue> {
    let role = state.role.read();
    let cluster = match &*role {
        Role::ClusterNode(cluster) => cluster,
        _ => return None,
    };
    let slot = key_slot(key);

    if let Some(target) = cluster.migrating.get(&slot) {
        if !state.store.contains(key) {
            return Some(error(&format!("ASK {} {}", slot, target)));
        }
    }
    match cluster.owner(slot) {
        Some(owner) if owner == state.addr || asking => None,
        Some(owner) => Some(error(&format!("MOVED {} {}", slot, owner))),
        None if asking => None,
        None => Some(error(&format!("CLUSTERDOWN Hash slot {} not served", slot))),
    }
}

fn handle_ping(args: &[Vec<u8>]) -> RespValue {
    match args.len() {
        1 => RespValue::Simple("PONG".into()),
        2 => bulk(&args[1]),
        _ => wrong_args("PING"),
    }
}

fn handle_get(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() != 2 {
        return wrong_args("GET");
    }
    RespValue::Bulk(state.store.get(&args[1]))
}

fn handle_set(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() != 3 {
        return wrong_args("SET");
    }
    state.store.set(args[1].clone(), args[2].clone());
    ok()
}

fn handle_del(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() < 2 {
        return wrong_args("DEL");
    }
    let removed = args[1..].iter().filter(|key| state.store.delete(key)).count();
    RespValue::Integer(removed as i64)
}

fn handle_exists(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() < 2 {
        return wrong_args("EXISTS");
    }
    let found = args[1..].iter().filter(|key| state.store.contains(key)).count();
    RespValue::Integer(found as i64)
}

fn handle_incr(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() != 2 {
        return wrong_args("INCR");
    }
    match state.store.incr(&args[1]) {
        Ok(value) => RespValue::Integer(value),
        Err(message) => error(&format!("ERR {}", message)),
    }
}

fn handle_scan(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    let cursor = match args.get(1).and_then(|raw| parse_u64(raw)) {
        Some(cursor) => cursor as usize,
        None => return error("ERR invalid cursor"),
    };
    let mut pattern = None;
    let mut count = DEFAULT_SCAN_COUNT;
    let mut idx = 2;
    while idx < args.len() {
        let option = &args[idx];
        let value = match args.get(idx + 1) {
            Some(value) => value,
            None => return error("ERR syntax error"),
        };
        if eq_ignore_ascii_case(option, b"MATCH") {
            pattern = Some(value.as_slice());
        } else if eq_ignore_ascii_case(option, b"COUNT") {
            count = match parse_u64(value) {
                Some(count) if count > 0 => count as usize,
                _ => return error("ERR value is not an integer or out of range"),
            };
        } else {
            return error("ERR syntax error");
        }
        idx += 2;
    }

    let (next, keys) = state.store.scan(cursor, pattern, count);
    RespValue::Array(vec![
        bulk(next.to_string().as_bytes()),
        RespValue::Array(keys.into_iter().map(|key| RespValue::Bulk(Some(key))).collect()),
    ])
}

async fn handle_debug(args: &[Vec<u8>]) -> RespValue {
    if args.len() == 3 && eq_ignore_ascii_case(&args[1], b"SLEEP") {
        let seconds = std::str::from_utf8(&args[2])
            .ok()
            .and_then(|text| text.parse::<f64>().ok());
        return match seconds {
            Some(seconds) if seconds >= 0.0 => {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                ok()
            }
            _ => error("ERR invalid sleep duration"),
        };
    }
    error("ERR unsupported DEBUG subcommand")
}

fn handle_info(state: &ServerState) -> RespValue {
    let (mode, role) = match &*state.role.read() {
        Role::Standalone => ("standalone", "master"),
        Role::ClusterNode(_) => ("cluster", "master"),
        Role::Sentinel(_) => ("sentinel", "sentinel"),
    };
    let port = state.addr.rsplit_once(':').map(|(_, port)| port).unwrap_or("0");
    let info = format!(
        "# Server\r\nredis_version:7.2.0\r\nredis_mode:{}\r\ntcp_port:{}\r\n\r\n# Replication\r\nrole:{}\r\n\r\n# Keyspace\r\ndb0:keys={},expires=0\r\n",
        mode,
        port,
        role,
        state.store.len()
    );
    bulk(info.as_bytes())
}

fn handle_cluster(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() != 2 || !eq_ignore_ascii_case(&args[1], b"SLOTS") {
        return error("ERR unsupported CLUSTER subcommand");
    }
    let role = state.role.read();
    let cluster = match &*role {
        Role::ClusterNode(cluster) => cluster,
        _ => return error("ERR This instance has cluster support disabled"),
    };

    let entries = cluster
        .layout
        .iter()
        .map(|range| {
            let (host, port) = range.addr.rsplit_once(':').unwrap_or((range.addr.as_str(), "0"));
            RespValue::Array(vec![
                RespValue::Integer(range.start as i64),
                RespValue::Integer(range.end as i64),
                RespValue::Array(vec![
                    bulk(host.as_bytes()),
                    RespValue::Integer(port.parse().unwrap_or(0)),
                    bulk(format!("node-{}", port).as_bytes()),
                ]),
            ])
        })
        .collect();
    RespValue::Array(entries)
}

fn handle_sentinel(args: &[Vec<u8>], state: &ServerState) -> RespValue {
    if args.len() != 3 || !eq_ignore_ascii_case(&args[1], b"get-master-addr-by-name") {
        return error("ERR unsupported SENTINEL subcommand");
    }
    let role = state.role.read();
    let masters = match &*role {
        Role::Sentinel(masters) => masters,
        _ => return error("ERR unknown command 'SENTINEL'"),
    };

    let group = String::from_utf8_lossy(&args[2]);
    match masters.get(group.as_ref()).and_then(|addr| addr.rsplit_once(':')) {
        Some((host, port)) => RespValue::Array(vec![bulk(host.as_bytes()), bulk(port.as_bytes())]),
        None => RespValue::Bulk(None),
    }
}

fn ok() -> RespValue {
    RespValue::Simple("OK".into())
}

fn bulk(data: &[u8]) -> RespValue {
    RespValue::Bulk(Some(data.to_vec()))
}

fn error(message: &str) -> RespValue {
    RespValue::Error(message.to_string())
}

fn wrong_args(command: &str) -> RespValue {
    error(&format!("ERR wrong number of arguments for '{}' command", command))
}

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn parse_u64(arg: &[u8]) -> Option<u64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}
