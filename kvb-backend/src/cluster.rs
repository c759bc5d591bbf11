//! # Cluster Backend
//!
//! Purpose: Route each command to the master owning its key's slot, with one
//! connection pool per master.
//!
//! ## Design Principles
//! 1. **Slot Table**: `CLUSTER SLOTS` is loaded at connect time and again
//!    whenever a node answers `MOVED`.
//! 2. **Bounded Redirects**: `MOVED` and `ASK` are followed at most
//!    `MAX_REDIRECTS` times per command.
//! 3. **No Batching**: Parts of a pipeline may live on different masters, so
//!    `pipe` runs them one by one.
//! 4. **Masters Only**: Each slot table reload drops the pools of nodes that
//!    no longer serve slots.
//! 5. **Partial Scans**: A node that fails mid-scan is logged and skipped;
//!    the remaining masters are still scanned.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvb_client::ConnectionPool;
use kvb_common::{key_slot, Arg, KvError, KvResult, PipePart, RespValue, SLOT_COUNT};

use crate::backend::{Backend, BackendKind, SCAN_CHANNEL_CAPACITY};
use crate::config::BackendConfig;
use crate::scan::{scan_node, ScanOutcome};

/// Redirects followed for one command before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// Commands that carry no key and may run on any master.
const KEYLESS_COMMANDS: &[&str] = &[
    "PING", "ECHO", "INFO", "DBSIZE", "FLUSHALL", "FLUSHDB", "SCAN", "KEYS", "RANDOMKEY",
    "CLUSTER", "CONFIG", "CLIENT", "COMMAND", "DEBUG", "SCRIPT", "TIME",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotRange {
    start: u16,
    end: u16,
    addr: String,
}

#[derive(Default)]
struct Topology {
    /// Slot -> index into `masters`.
    slots: Vec<Option<usize>>,
    masters: Vec<String>,
    pools: HashMap<String, ConnectionPool>,
}

impl Topology {
    fn owner(&self, slot: u16) -> Option<&str> {
        let idx = self.slots.get(slot as usize).copied().flatten()?;
        self.masters.get(idx).map(String::as_str)
    }
}

struct ClusterInner {
    config: BackendConfig,
    topology: RwLock<Topology>,
    // Serializes topology reloads.
    refresh: Mutex<()>,
}

/// Cluster backend handle. Cloning shares pools and slot table.
#[derive(Clone)]
pub struct ClusterBackend {
    inner: Arc<ClusterInner>,
}

impl ClusterBackend {
    /// Loads the slot table from `config.address` and dials every master.
    pub async fn connect(config: &BackendConfig) -> KvResult<Self> {
        let backend = ClusterBackend {
            inner: Arc::new(ClusterInner {
                config: config.clone(),
                topology: RwLock::new(Topology::default()),
                refresh: Mutex::new(()),
            }),
        };
        backend.refresh_topology().await?;
        info!(seed = %config.address, masters = backend.masters().len(), "connected to cluster");
        Ok(backend)
    }

    /// Master addresses of the current slot table.
    pub fn masters(&self) -> Vec<String> {
        self.inner.topology.read().masters.clone()
    }

    /// Master serving `slot`, if the table has one.
    pub fn owner_of(&self, slot: u16) -> Option<String> {
        self.inner.topology.read().owner(slot).map(str::to_string)
    }

    /// Reloads `CLUSTER SLOTS`, asking the known masters first and then the
    /// seed address.
    pub async fn refresh_topology(&self) -> KvResult<()> {
        let _guard = self.inner.refresh.lock().await;

        let mut candidates = self.masters();
        if !candidates.contains(&self.inner.config.address) {
            candidates.push(self.inner.config.address.clone());
        }

        let mut last_err = None;
        for addr in candidates {
            match self.fetch_slots(&addr).await {
                Ok(ranges) => return self.install(ranges).await,
                Err(err) => {
                    debug!(addr = %addr, error = %err, "cluster node could not report slots");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| KvError::Cluster("no node to load slots from".into())))
    }

    async fn fetch_slots(&self, addr: &str) -> KvResult<Vec<SlotRange>> {
        let pool = self.pool_for(addr).await?;
        let reply = pool.exec("CLUSTER", &[Arg::from("SLOTS")]).await?.into_result()?;
        parse_slots(reply, addr)
    }

    async fn install(&self, ranges: Vec<SlotRange>) -> KvResult<()> {
        let mut masters: Vec<String> = Vec::new();
        let mut slots = vec![None; SLOT_COUNT as usize];
        for range in &ranges {
            let idx = match masters.iter().position(|addr| *addr == range.addr) {
                Some(idx) => idx,
                None => {
                    masters.push(range.addr.clone());
                    masters.len() - 1
                }
            };
            for slot in range.start..=range.end {
                slots[slot as usize] = Some(idx);
            }
        }
        if masters.is_empty() {
            return Err(KvError::Cluster("CLUSTER SLOTS reported no slots".into()));
        }

        // Dial new masters without holding the table lock.
        let missing: Vec<String> = {
            let topology = self.inner.topology.read();
            masters
                .iter()
                .filter(|addr| !topology.pools.contains_key(*addr))
                .cloned()
                .collect()
        };
        let mut fresh = Vec::with_capacity(missing.len());
        for addr in missing {
            let pool = ConnectionPool::new(self.inner.config.pool_config(addr.as_str())).await?;
            fresh.push((addr, pool));
        }

        let mut topology = self.inner.topology.write();
        for (addr, pool) in fresh {
            topology.pools.entry(addr).or_insert(pool);
        }
        // Seeds and former masters lose their pools; borrowed connections
        // still finish, then close.
        topology.pools.retain(|addr, _| {
            let keep = masters.contains(addr);
            if !keep {
                debug!(addr = %addr, "dropping pool of node that serves no slots");
            }
            keep
        });
        topology.slots = slots;
        topology.masters = masters;
        debug!(masters = topology.masters.len(), "cluster slot table loaded");
        Ok(())
    }

    /// Pool for `addr`, dialing one if the node is new.
    async fn pool_for(&self, addr: &str) -> KvResult<ConnectionPool> {
        let cached = self.inner.topology.read().pools.get(addr).cloned();
        if let Some(pool) = cached {
            return Ok(pool);
        }
        let pool = ConnectionPool::new(self.inner.config.pool_config(addr)).await?;
        let mut topology = self.inner.topology.write();
        Ok(topology.pools.entry(addr.to_string()).or_insert(pool).clone())
    }

    async fn pool_for_slot(&self, slot: Option<u16>) -> KvResult<ConnectionPool> {
        let addr = {
            let topology = self.inner.topology.read();
            match slot {
                Some(slot) => topology.owner(slot).map(str::to_string),
                None => topology.masters.first().cloned(),
            }
        };
        match (addr, slot) {
            (Some(addr), _) => self.pool_for(&addr).await,
            (None, Some(slot)) => Err(KvError::Cluster(format!("slot {} is not served", slot))),
            (None, None) => Err(KvError::Cluster("no master known".into())),
        }
    }

    /// Sends one command to the owner of its key, following redirects.
    async fn route(&self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        let slot = command_key(command, args).map(|key| key_slot(&key.to_bytes()));
        let mut pool = self.pool_for_slot(slot).await?;
        let mut asking = false;

        for _ in 0..=MAX_REDIRECTS {
            let reply = {
                let mut conn = pool.acquire().await?;
                if asking {
                    conn.exec("ASKING", &[]).await?.into_result()?;
                }
                conn.exec(command, args).await?
            };

            match Redirect::parse(&reply) {
                Some(Redirect::Moved(addr)) => {
                    debug!(command, to = %addr, "MOVED, reloading slot table");
                    if let Err(err) = self.refresh_topology().await {
                        warn!(error = %err, "slot table reload failed");
                    }
                    pool = self.pool_for(&addr).await?;
                    asking = false;
                }
                Some(Redirect::Ask(addr)) => {
                    debug!(command, to = %addr, "ASK");
                    pool = self.pool_for(&addr).await?;
                    asking = true;
                }
                None => return reply.into_result(),
            }
        }

        Err(KvError::Cluster(format!(
            "{} exceeded {} redirects",
            command, MAX_REDIRECTS
        )))
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn cmd(&self, command: &str, args: &[Arg]) -> KvResult<RespValue> {
        self.route(command, args).await
    }

    async fn pipe(&self, parts: &[PipePart]) -> KvResult<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(parts.len());
        for part in parts {
            replies.push(self.route(&part.command, &part.args).await?);
        }
        Ok(replies)
    }

    fn scan(&self, pattern: &str, cancel: CancellationToken) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let backend = self.clone();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            for addr in backend.masters() {
                let result = match backend.pool_for(&addr).await {
                    Ok(pool) => match pool.acquire().await {
                        Ok(mut conn) => scan_node(&mut conn, &pattern, &tx, &cancel).await,
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                match result {
                    Ok(ScanOutcome::Exhausted) => {}
                    Ok(ScanOutcome::Stopped) => return,
                    Err(err) => {
                        warn!(addr = %addr, pattern = %pattern, error = %err, "cluster node scan failed, its keys are skipped");
                    }
                }
            }
        });
        rx
    }

    async fn get_addr(&self) -> KvResult<String> {
        let slot = key_slot(b"");
        self.owner_of(slot)
            .ok_or_else(|| KvError::Cluster(format!("slot {} is not served", slot)))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }
}

impl std::fmt::Debug for ClusterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBackend")
            .field("seed", &self.inner.config.address)
            .field("masters", &self.masters())
            .finish()
    }
}

enum Redirect {
    Moved(String),
    Ask(String),
}

impl Redirect {
    /// Recognizes `MOVED <slot> <addr>` and `ASK <slot> <addr>` error replies.
    fn parse(reply: &RespValue) -> Option<Redirect> {
        let message = match reply {
            RespValue::Error(message) => message,
            _ => return None,
        };
        let mut words = message.split_whitespace();
        let kind = words.next()?;
        let _slot = words.next()?;
        let addr = words.next()?.to_string();
        match kind {
            "MOVED" => Some(Redirect::Moved(addr)),
            "ASK" => Some(Redirect::Ask(addr)),
            _ => None,
        }
    }
}

/// Picks the argument that decides a command's slot.
fn command_key<'a>(command: &str, args: &'a [Arg]) -> Option<&'a Arg> {
    if KEYLESS_COMMANDS
        .iter()
        .any(|name| command.eq_ignore_ascii_case(name))
    {
        return None;
    }
    // EVAL script numkeys key [key ...]
    if command.eq_ignore_ascii_case("EVAL") || command.eq_ignore_ascii_case("EVALSHA") {
        let numkeys = args.get(1).and_then(|arg| {
            std::str::from_utf8(&arg.to_bytes())
                .ok()
                .and_then(|text| text.parse::<usize>().ok())
        })?;
        return if numkeys > 0 { args.get(2) } else { None };
    }
    args.first()
}

/// Parses a `CLUSTER SLOTS` reply. Entries with an empty host belong to the
/// node that was asked.
fn parse_slots(reply: RespValue, queried: &str) -> KvResult<Vec<SlotRange>> {
    let queried_host = queried.rsplit_once(':').map_or(queried, |(host, _)| host);
    let mut ranges = Vec::new();

    for entry in reply.into_array()? {
        let mut fields = entry.into_array()?.into_iter();
        let (start, end, master) = match (fields.next(), fields.next(), fields.next()) {
            (Some(start), Some(end), Some(master)) => (start.as_int()?, end.as_int()?, master),
            _ => return Err(KvError::unexpected("slot range entry", "short array")),
        };
        if start < 0 || end < start || end >= SLOT_COUNT as i64 {
            return Err(KvError::Cluster(format!("invalid slot range {}-{}", start, end)));
        }

        let mut node = master.into_array()?.into_iter();
        let (host, port) = match (node.next(), node.next()) {
            (Some(host), Some(port)) => (host.into_string()?, port.as_int()?),
            _ => return Err(KvError::unexpected("host and port", "short array")),
        };
        let host = if host.is_empty() { queried_host.to_string() } else { host };

        ranges.push(SlotRange {
            start: start as u16,
            end: end as u16,
            addr: format!("{}:{}", host, port),
        });
    }
    Ok(ranges)
}
