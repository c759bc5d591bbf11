//! # In-Process RESP Test Server
//!
//! Purpose: Give the client and backend test suites a real TCP peer that
//! speaks RESP2, without an external server.
//!
//! ## Roles
//! - **Standalone**: a plain key-value node.
//! - **Cluster node**: owns slot ranges of a shared layout, answers
//!   `CLUSTER SLOTS`, and redirects foreign keys with `MOVED`/`ASK`.
//! - **Sentinel**: answers `SENTINEL get-master-addr-by-name` from a table.
//!
//! ## Fault Injection
//! `drop_next(n)` makes the server close the connection instead of answering
//! the next `n` commands it receives.

mod server;
mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use store::{glob_match, Store};

/// One contiguous slot range and the address of the node serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub addr: String,
}

impl SlotRange {
    pub fn new(start: u16, end: u16, addr: impl Into<String>) -> Self {
        SlotRange {
            start,
            end,
            addr: addr.into(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    pub(crate) layout: Vec<SlotRange>,
    pub(crate) migrating: HashMap<u16, String>,
}

impl ClusterState {
    pub(crate) fn owner(&self, slot: u16) -> Option<&str> {
        self.layout
            .iter()
            .find(|range| range.start <= slot && slot <= range.end)
            .map(|range| range.addr.as_str())
    }
}

#[derive(Debug)]
pub(crate) enum Role {
    Standalone,
    ClusterNode(ClusterState),
    Sentinel(HashMap<String, String>),
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) accepted: AtomicUsize,
    pub(crate) active: AtomicUsize,
    pub(crate) peak_active: AtomicUsize,
    pub(crate) commands: AtomicUsize,
}

/// Connection and command counters observed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections accepted since start.
    pub accepted: usize,
    /// Connections open right now.
    pub active: usize,
    /// Highest number of simultaneously open connections.
    pub peak_active: usize,
    /// Commands received (including ones answered by a dropped connection).
    pub commands: usize,
}

pub(crate) struct ServerState {
    pub(crate) addr: String,
    pub(crate) store: Store,
    pub(crate) role: RwLock<Role>,
    pub(crate) stats: Counters,
    drop_next: AtomicUsize,
}

impl ServerState {
    /// Consumes one pending drop fault, if any.
    pub(crate) fn take_drop_fault(&self) -> bool {
        self.drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| pending.checked_sub(1))
            .is_ok()
    }
}

/// A RESP server bound to an ephemeral local port. Stops when dropped.
pub struct TestServer {
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    /// Starts a standalone node.
    pub async fn standalone() -> anyhow::Result<Self> {
        Self::spawn(Role::Standalone).await
    }

    /// Starts a cluster node with an empty layout; see `set_cluster_layout`.
    pub async fn cluster_node() -> anyhow::Result<Self> {
        Self::spawn(Role::ClusterNode(ClusterState::default())).await
    }

    /// Starts a sentinel with no known masters; see `set_master`.
    pub async fn sentinel() -> anyhow::Result<Self> {
        Self::spawn(Role::Sentinel(HashMap::new())).await
    }

    /// Starts a sentinel on `addr`, typically one taken from `closed_addr`
    /// that a client was already configured with.
    pub async fn sentinel_at(addr: &str) -> anyhow::Result<Self> {
        Self::spawn_at(addr, Role::Sentinel(HashMap::new())).await
    }

    async fn spawn(role: Role) -> anyhow::Result<Self> {
        Self::spawn_at("127.0.0.1:0", role).await
    }

    async fn spawn_at(bind: &str, role: Role) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind test server on {bind}"))?;
        let addr = listener.local_addr().context("test server address")?.to_string();
        let state = Arc::new(ServerState {
            addr,
            store: Store::new(),
            role: RwLock::new(role),
            stats: Counters::default(),
            drop_next: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));
        debug!(addr = %state.addr, "test server listening");

        Ok(TestServer {
            state,
            shutdown,
            accept_task,
        })
    }

    /// Address in `host:port` form.
    pub fn addr(&self) -> String {
        self.state.addr.clone()
    }

    /// Direct access to the server's key space.
    pub fn store(&self) -> &Store {
        &self.state.store
    }

    /// Seeds a key without going through the protocol.
    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.state.store.set(key.into(), value.into());
    }

    /// Closes the connection instead of answering the next `count` commands.
    pub fn drop_next(&self, count: usize) {
        self.state.drop_next.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ServerStats {
        let counters = &self.state.stats;
        ServerStats {
            accepted: counters.accepted.load(Ordering::SeqCst),
            active: counters.active.load(Ordering::SeqCst),
            peak_active: counters.peak_active.load(Ordering::SeqCst),
            commands: counters.commands.load(Ordering::SeqCst),
        }
    }

    /// Replaces the slot layout of a cluster node. No-op for other roles.
    pub fn set_cluster_layout(&self, layout: Vec<SlotRange>) {
        if let Role::ClusterNode(cluster) = &mut *self.state.role.write() {
            cluster.layout = layout;
        }
    }

    /// Marks `slot` as migrating to `target`: keys of that slot missing here
    /// are answered with `ASK`.
    pub fn set_migrating(&self, slot: u16, target: impl Into<String>) {
        if let Role::ClusterNode(cluster) = &mut *self.state.role.write() {
            cluster.migrating.insert(slot, target.into());
        }
    }

    /// Points a sentinel's `group` at `master_addr`. No-op for other roles.
    pub fn set_master(&self, group: impl Into<String>, master_addr: impl Into<String>) {
        if let Role::Sentinel(masters) = &mut *self.state.role.write() {
            masters.insert(group.into(), master_addr.into());
        }
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.accept_task.abort();
    }

    /// Shuts down and waits (up to two seconds) until the listener is gone and
    /// every connection is closed.
    pub async fn stop(&self) {
        self.shutdown();
        for _ in 0..200 {
            if self.accept_task.is_finished() && self.state.stats.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a cluster of `nodes` test servers splitting the slot space evenly;
/// every node knows the full layout.
pub async fn spawn_cluster(nodes: usize) -> anyhow::Result<Vec<TestServer>> {
    anyhow::ensure!(nodes > 0, "a cluster needs at least one node");
    let mut servers = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        servers.push(TestServer::cluster_node().await?);
    }

    let total = kvb_common::SLOT_COUNT as usize;
    let layout: Vec<SlotRange> = servers
        .iter()
        .enumerate()
        .map(|(idx, server)| {
            let start = idx * total / nodes;
            let end = (idx + 1) * total / nodes - 1;
            SlotRange::new(start as u16, end as u16, server.addr())
        })
        .collect();
    for server in &servers {
        server.set_cluster_layout(layout.clone());
    }
    Ok(servers)
}

/// Returns a local address nothing listens on.
pub async fn closed_addr() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);
    Ok(addr)
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    debug!(error = %err, "accept failed");
                    continue;
                }
            },
        };

        let counters = &state.stats;
        counters.accepted.fetch_add(1, Ordering::SeqCst);
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);

        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = server::handle_connection(stream, state.clone(), shutdown).await {
                debug!(error = %err, "test server connection ended with error");
            }
            state.stats.active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
