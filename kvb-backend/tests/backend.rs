use std::collections::HashSet;
use std::time::Duration;

use kvb_backend::{
    pp, select_backend, Arg, Backend, BackendConfig, BackendKind, CancellationToken, ClusterBackend,
    KvError, RespValue, SentinelBackend, StandaloneBackend, MAX_REDIRECTS,
};
use kvb_common::key_slot;
use kvb_server::{closed_addr, spawn_cluster, SlotRange, TestServer};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_for(addr: String) -> BackendConfig {
    BackendConfig {
        timeout_secs: 2,
        ..BackendConfig::standalone(addr)
    }
}

fn cluster_config(seed: String) -> BackendConfig {
    BackendConfig {
        use_cluster: true,
        ..config_for(seed)
    }
}

fn sentinel_config(sentinels: Vec<String>, group: &str) -> BackendConfig {
    BackendConfig {
        use_sentinel: true,
        sentinel_addresses: sentinels,
        sentinel_group: group.to_string(),
        ..config_for(String::new())
    }
}

async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
    let mut keys = Vec::new();
    while let Some(key) = rx.recv().await {
        keys.push(key);
    }
    keys
}

async fn write_scan_keys(backend: &dyn Backend) -> HashSet<String> {
    let mut written = HashSet::new();
    for idx in 0..100 {
        let key = format!("scantest:{idx}");
        backend
            .cmd("SET", &[Arg::from(key.as_str()), Arg::from(idx)])
            .await
            .expect("set");
        written.insert(key);
    }
    backend.cmd("SET", &[Arg::from("other"), Arg::from("x")]).await.expect("set");
    written
}

/// Waits until the server holds no open connection.
async fn connections_close(server: &TestServer) -> bool {
    for _ in 0..200 {
        if server.stats().active == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn assert_exactly_once(keys: Vec<String>, expected: &HashSet<String>) {
    let unique: HashSet<String> = keys.iter().cloned().collect();
    assert_eq!(unique.len(), keys.len(), "a key was reported twice");
    assert_eq!(&unique, expected);
}

#[tokio::test]
async fn standalone_set_then_get() {
    init_tracing();
    let server = TestServer::standalone().await.expect("server");
    let backend = select_backend(&config_for(server.addr())).await.expect("backend");
    assert_eq!(backend.kind(), BackendKind::Standalone);

    let reply = backend.cmd("SET", &[Arg::from("k"), Arg::from("v")]).await.expect("set");
    assert_eq!(reply, RespValue::Simple("OK".into()));
    let reply = backend.cmd("GET", &[Arg::from("k")]).await.expect("get");
    assert_eq!(reply.into_string().unwrap(), "v");
    assert_eq!(backend.get_addr().await.unwrap(), server.addr());
}

#[tokio::test]
async fn standalone_command_errors_are_typed() {
    let server = TestServer::standalone().await.expect("server");
    let backend = StandaloneBackend::connect(&config_for(server.addr())).await.expect("backend");

    match backend.cmd("NOPE", &[]).await {
        Err(KvError::Command(message)) => assert!(message.contains("unknown command")),
        other => panic!("unexpected {other:?}"),
    }
    // The connection that carried the error reply stays in the pool.
    assert_eq!(backend.pool_stats().idle, 1);
}

#[tokio::test]
async fn standalone_construction_fails_without_server() {
    let addr = closed_addr().await.expect("addr");
    assert!(matches!(
        select_backend(&config_for(addr)).await,
        Err(KvError::Connection { .. })
    ));
}

#[tokio::test]
async fn standalone_scan_yields_every_match_once() {
    init_tracing();
    let server = TestServer::standalone().await.expect("server");
    let backend = StandaloneBackend::connect(&config_for(server.addr())).await.expect("backend");
    let written = write_scan_keys(&backend).await;

    let keys = collect(backend.scan("scantest:*", CancellationToken::new())).await;
    assert_exactly_once(keys, &written);
    assert_eq!(backend.pool_stats().in_use, 0);
}

#[tokio::test]
async fn scan_of_missing_pattern_closes_empty() {
    let server = TestServer::standalone().await.expect("server");
    server.insert("a", "1");
    let backend = StandaloneBackend::connect(&config_for(server.addr())).await.expect("backend");

    let keys = collect(backend.scan("nothing:*", CancellationToken::new())).await;
    assert!(keys.is_empty());
}

#[tokio::test]
async fn cancelled_scan_releases_its_connection() {
    let server = TestServer::standalone().await.expect("server");
    for idx in 0..500 {
        server.insert(format!("bulk:{idx}"), "v");
    }
    let config = BackendConfig {
        pool_capacity: 1,
        ..config_for(server.addr())
    };
    let backend = StandaloneBackend::connect(&config).await.expect("backend");

    let cancel = CancellationToken::new();
    let mut rx = backend.scan("bulk:*", cancel.clone());
    assert!(rx.recv().await.is_some());
    cancel.cancel();

    let mut drained = 1;
    while rx.recv().await.is_some() {
        drained += 1;
    }
    assert!(drained < 500, "producer kept going after cancellation");

    // With capacity 1 this only succeeds once the scan gave its connection back.
    let reply = tokio::time::timeout(Duration::from_secs(2), backend.cmd("PING", &[]))
        .await
        .expect("connection released")
        .expect("ping");
    assert_eq!(reply, RespValue::Simple("PONG".into()));
}

#[tokio::test]
async fn dropped_receiver_stops_the_producer() {
    let server = TestServer::standalone().await.expect("server");
    for idx in 0..500 {
        server.insert(format!("bulk:{idx}"), "v");
    }
    let config = BackendConfig {
        pool_capacity: 1,
        ..config_for(server.addr())
    };
    let backend = StandaloneBackend::connect(&config).await.expect("backend");

    let mut rx = backend.scan("bulk:*", CancellationToken::new());
    assert!(rx.recv().await.is_some());
    drop(rx);

    tokio::time::timeout(Duration::from_secs(2), backend.cmd("PING", &[]))
        .await
        .expect("connection released")
        .expect("ping");
}

#[tokio::test]
async fn pipe_returns_replies_in_order() {
    let server = TestServer::standalone().await.expect("server");
    let backend = StandaloneBackend::connect(&config_for(server.addr())).await.expect("backend");

    let replies = backend
        .pipe(&[
            pp("SET", ["n", "1"]),
            pp("INCR", ["n"]),
            pp("INCR", ["n"]),
            pp("GET", ["n"]),
        ])
        .await
        .expect("pipe");
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[1], RespValue::Integer(2));
    assert_eq!(replies[2], RespValue::Integer(3));
    assert_eq!(replies[3].as_str().unwrap(), "3");
}

#[tokio::test]
async fn pipe_stops_at_first_error() {
    let server = TestServer::standalone().await.expect("server");
    let backend = StandaloneBackend::connect(&config_for(server.addr())).await.expect("backend");

    let result = backend
        .pipe(&[
            pp("SET", ["s", "text"]),
            pp("INCR", ["s"]),
            pp("SET", ["after", "1"]),
        ])
        .await;
    assert!(matches!(result, Err(KvError::Command(_))));

    // The connection stayed aligned: the next command gets its own reply.
    let reply = backend.cmd("GET", &[Arg::from("s")]).await.expect("get");
    assert_eq!(reply.into_string().unwrap(), "text");
}

#[tokio::test]
async fn timed_out_calls_leave_no_stale_reply() {
    let server = TestServer::standalone().await.expect("server");
    server.insert("k", "v");
    let config = BackendConfig {
        pool_capacity: 1,
        ..config_for(server.addr())
    };
    let backend = StandaloneBackend::connect(&config).await.expect("backend");
    let sleep = [Arg::from("SLEEP"), Arg::from("0.3")];

    let slow = tokio::time::timeout(Duration::from_millis(50), backend.cmd("DEBUG", &sleep)).await;
    assert!(slow.is_err());
    let reply = backend.cmd("GET", &[Arg::from("k")]).await.expect("get");
    assert_eq!(reply.into_string().unwrap(), "v");

    let slow = tokio::time::timeout(
        Duration::from_millis(50),
        backend.pipe(&[pp("DEBUG", ["SLEEP", "0.3"]), pp("PING", Vec::<Arg>::new())]),
    )
    .await;
    assert!(slow.is_err());
    let replies = backend.pipe(&[pp("GET", ["k"])]).await.expect("pipe");
    assert_eq!(replies[0].as_str().unwrap(), "v");

    assert_eq!(server.stats().accepted, 3, "each cancelled call costs its connection");
}

#[tokio::test]
async fn pool_bound_holds_under_load() {
    let server = TestServer::standalone().await.expect("server");
    let config = BackendConfig {
        pool_capacity: 3,
        ..config_for(server.addr())
    };
    let backend = select_backend(&config).await.expect("backend");

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let backend = backend.clone();
        tasks.push(tokio::spawn(async move {
            backend.cmd("DEBUG", &[Arg::from("SLEEP"), Arg::from("0.05")]).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("every caller completes");
    }

    let stats = server.stats();
    assert!(stats.peak_active <= 3, "peak {} exceeds capacity", stats.peak_active);
    assert_eq!(stats.commands, 12);
}

#[tokio::test]
async fn debug_metrics_record_commands() {
    let server = TestServer::standalone().await.expect("server");
    let config = BackendConfig {
        debug_metrics: true,
        ..config_for(server.addr())
    };
    let backend = StandaloneBackend::connect(&config).await.expect("backend");

    backend.cmd("PING", &[]).await.expect("ping");
    let _ = backend.cmd("NOPE", &[]).await;

    let snapshot = backend.metrics().expect("metrics enabled");
    assert_eq!(snapshot.requests_total, 2);
    assert_eq!(snapshot.errors_total, 1);
}

#[tokio::test]
async fn debug_metrics_count_pipelined_parts() {
    let server = TestServer::standalone().await.expect("server");
    let config = BackendConfig {
        debug_metrics: true,
        ..config_for(server.addr())
    };
    let backend = StandaloneBackend::connect(&config).await.expect("backend");

    backend
        .pipe(&[pp("SET", ["a", "1"]), pp("INCR", ["a"]), pp("GET", ["a"])])
        .await
        .expect("pipe");

    let snapshot = backend.metrics().expect("metrics enabled");
    assert_eq!(snapshot.requests_total, 3);
    assert_eq!(snapshot.errors_total, 0);
    assert_eq!(snapshot.per_command.get("INCR"), Some(&1));
}

#[tokio::test]
async fn cluster_routes_keys_to_owners() {
    init_tracing();
    let nodes = spawn_cluster(3).await.expect("cluster");
    let backend = select_backend(&cluster_config(nodes[0].addr())).await.expect("backend");
    assert_eq!(backend.kind(), BackendKind::Cluster);

    for idx in 0..30 {
        let key = format!("user:{idx}");
        backend.cmd("SET", &[Arg::from(key.as_str()), Arg::from("v")]).await.expect("set");
    }
    let total: usize = nodes.iter().map(|node| node.store().len()).sum();
    assert_eq!(total, 30);
    assert!(nodes.iter().all(|node| !node.store().is_empty()), "keys should spread over masters");

    let reply = backend.cmd("GET", &[Arg::from("user:7")]).await.expect("get");
    assert_eq!(reply.into_string().unwrap(), "v");

    // Slot of the empty key is 0, which the first node serves.
    assert_eq!(backend.get_addr().await.unwrap(), nodes[0].addr());
}

#[tokio::test]
async fn cluster_scan_covers_every_master() {
    let nodes = spawn_cluster(3).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[1].addr())).await.expect("backend");
    assert_eq!(backend.masters().len(), 3);
    let written = write_scan_keys(&backend).await;

    let keys = collect(backend.scan("scantest:*", CancellationToken::new())).await;
    assert_exactly_once(keys, &written);
}

#[tokio::test]
async fn cluster_scan_skips_failed_node() {
    let nodes = spawn_cluster(2).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[0].addr())).await.expect("backend");
    write_scan_keys(&backend).await;

    let surviving: HashSet<String> = nodes[1]
        .store()
        .keys()
        .into_iter()
        .map(|key| String::from_utf8(key).unwrap())
        .filter(|key| key.starts_with("scantest:"))
        .collect();

    // The first node's pooled connection breaks on the next SCAN.
    nodes[0].drop_next(1);
    let keys = collect(backend.scan("scantest:*", CancellationToken::new())).await;
    assert_exactly_once(keys, &surviving);
}

#[tokio::test]
async fn cluster_follows_moved_and_reloads_slots() {
    let nodes = spawn_cluster(2).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[0].addr())).await.expect("backend");

    let slot = key_slot(b"foo");
    assert_eq!(backend.owner_of(slot), Some(nodes[1].addr()));

    // Everything moves to the first node.
    let layout = vec![SlotRange::new(0, 16383, nodes[0].addr())];
    for node in &nodes {
        node.set_cluster_layout(layout.clone());
    }

    backend.cmd("SET", &[Arg::from("foo"), Arg::from("bar")]).await.expect("set");
    assert_eq!(nodes[0].store().get(b"foo"), Some(b"bar".to_vec()));
    assert!(nodes[1].store().get(b"foo").is_none());
    assert_eq!(backend.owner_of(slot), Some(nodes[0].addr()));
    assert_eq!(backend.masters(), vec![nodes[0].addr()]);
}

#[tokio::test]
async fn cluster_follows_ask_without_reloading() {
    let nodes = spawn_cluster(2).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[0].addr())).await.expect("backend");

    let slot = key_slot(b"foo");
    nodes[1].set_migrating(slot, nodes[0].addr());

    backend.cmd("SET", &[Arg::from("foo"), Arg::from("bar")]).await.expect("set");
    assert_eq!(nodes[0].store().get(b"foo"), Some(b"bar".to_vec()));
    let reply = backend.cmd("GET", &[Arg::from("foo")]).await.expect("get");
    assert_eq!(reply.into_string().unwrap(), "bar");

    // ASK is one-shot: the slot table still names the old owner.
    assert_eq!(backend.owner_of(slot), Some(nodes[1].addr()));
}

#[tokio::test]
async fn cluster_ask_after_timed_out_command_gets_its_own_reply() {
    let nodes = spawn_cluster(2).await.expect("cluster");
    let config = BackendConfig {
        pool_capacity: 1,
        ..cluster_config(nodes[0].addr())
    };
    let backend = ClusterBackend::connect(&config).await.expect("backend");
    assert_eq!(backend.masters()[0], nodes[0].addr());

    // Keyless, so it runs on the first master.
    let slow = tokio::time::timeout(
        Duration::from_millis(50),
        backend.cmd("DEBUG", &[Arg::from("SLEEP"), Arg::from("0.3")]),
    )
    .await;
    assert!(slow.is_err());

    // The ASK retry lands on the first master; a reused connection would
    // hand back the late "OK" instead of the value.
    nodes[0].insert("foo", "bar");
    nodes[1].set_migrating(key_slot(b"foo"), nodes[0].addr());
    let reply = backend.cmd("GET", &[Arg::from("foo")]).await.expect("get");
    assert_eq!(reply.into_string().unwrap(), "bar");
}

#[tokio::test]
async fn cluster_reload_drops_pools_of_former_masters() {
    let nodes = spawn_cluster(2).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[0].addr())).await.expect("backend");
    assert!(nodes[1].stats().active > 0);

    let layout = vec![SlotRange::new(0, 16383, nodes[0].addr())];
    for node in &nodes {
        node.set_cluster_layout(layout.clone());
    }
    backend.cmd("SET", &[Arg::from("foo"), Arg::from("bar")]).await.expect("set");
    assert_eq!(backend.masters(), vec![nodes[0].addr()]);

    assert!(connections_close(&nodes[1]).await, "pool of the old owner stayed open");
    assert!(nodes[0].stats().active > 0);
}

#[tokio::test]
async fn cluster_redirect_loop_is_bounded() {
    let nodes = spawn_cluster(2).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[0].addr())).await.expect("backend");

    // Each node claims the other one owns everything.
    nodes[0].set_cluster_layout(vec![SlotRange::new(0, 16383, nodes[1].addr())]);
    nodes[1].set_cluster_layout(vec![SlotRange::new(0, 16383, nodes[0].addr())]);

    match backend.cmd("GET", &[Arg::from("foo")]).await {
        Err(KvError::Cluster(message)) => assert!(message.contains(&MAX_REDIRECTS.to_string())),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn cluster_pipe_runs_parts_across_nodes() {
    let nodes = spawn_cluster(3).await.expect("cluster");
    let backend = ClusterBackend::connect(&cluster_config(nodes[0].addr())).await.expect("backend");

    let parts: Vec<_> = (0..6).map(|idx| pp("INCR", [format!("counter:{idx}")])).collect();
    let replies = backend.pipe(&parts).await.expect("pipe");
    assert_eq!(replies, vec![RespValue::Integer(1); 6]);

    let result = backend
        .pipe(&[pp("SET", ["x", "text"]), pp("INCR", ["x"]), pp("SET", ["y", "1"])])
        .await;
    assert!(matches!(result, Err(KvError::Command(_))));
    let y_written = nodes.iter().any(|node| node.store().contains(b"y"));
    assert!(!y_written, "parts after the failure must not run");
}

#[tokio::test]
async fn cluster_construction_fails_on_plain_server() {
    let server = TestServer::standalone().await.expect("server");
    assert!(matches!(
        ClusterBackend::connect(&cluster_config(server.addr())).await,
        Err(KvError::Command(_))
    ));
}

#[tokio::test]
async fn sentinel_resolves_master() {
    init_tracing();
    let master = TestServer::standalone().await.expect("master");
    let sentinel = TestServer::sentinel().await.expect("sentinel");
    sentinel.set_master("mymaster", master.addr());

    let config = sentinel_config(vec![sentinel.addr()], "mymaster");
    let backend = select_backend(&config).await.expect("backend");
    assert_eq!(backend.kind(), BackendKind::Sentinel);

    backend.cmd("SET", &[Arg::from("k"), Arg::from("v")]).await.expect("set");
    assert_eq!(master.store().get(b"k"), Some(b"v".to_vec()));
    assert_eq!(backend.get_addr().await.unwrap(), master.addr());

    let replies = backend
        .pipe(&[pp("GET", ["k"]), pp("EXISTS", ["k"])])
        .await
        .expect("pipe");
    assert_eq!(replies[1], RespValue::Integer(1));

    let written = write_scan_keys(backend.as_ref()).await;
    let keys = collect(backend.scan("scantest:*", CancellationToken::new())).await;
    assert_exactly_once(keys, &written);
}

#[tokio::test]
async fn sentinel_falls_through_to_next_sentinel() {
    let master = TestServer::standalone().await.expect("master");
    let unaware = TestServer::sentinel().await.expect("sentinel");
    let aware = TestServer::sentinel().await.expect("sentinel");
    aware.set_master("mymaster", master.addr());
    let down = closed_addr().await.expect("addr");

    let config = sentinel_config(vec![down, unaware.addr(), aware.addr()], "mymaster");
    let backend = SentinelBackend::connect(&config).await.expect("backend");

    backend.cmd("PING", &[]).await.expect("ping");
    assert!(unaware.stats().commands >= 2, "the first sentinel is asked on every call");
}

#[tokio::test]
async fn sentinel_follows_master_change() {
    let old_master = TestServer::standalone().await.expect("master");
    let new_master = TestServer::standalone().await.expect("master");
    let sentinel = TestServer::sentinel().await.expect("sentinel");
    sentinel.set_master("mymaster", old_master.addr());

    let backend = SentinelBackend::connect(&sentinel_config(vec![sentinel.addr()], "mymaster"))
        .await
        .expect("backend");
    backend.cmd("SET", &[Arg::from("k"), Arg::from("old")]).await.expect("set");

    sentinel.set_master("mymaster", new_master.addr());
    backend.cmd("SET", &[Arg::from("k"), Arg::from("new")]).await.expect("set");

    assert_eq!(old_master.store().get(b"k"), Some(b"old".to_vec()));
    assert_eq!(new_master.store().get(b"k"), Some(b"new".to_vec()));

    assert_eq!(backend.current_master(), Some(new_master.addr()));
    assert!(connections_close(&old_master).await, "old master pool stayed open");
}

#[tokio::test]
async fn sentinel_down_at_startup_is_dialed_later() {
    init_tracing();
    let master = TestServer::standalone().await.expect("master");
    let early = TestServer::sentinel().await.expect("sentinel");
    early.set_master("mymaster", master.addr());
    let late_addr = closed_addr().await.expect("addr");

    let config = sentinel_config(vec![late_addr.clone(), early.addr()], "mymaster");
    let backend = SentinelBackend::connect(&config).await.expect("backend");

    let late = TestServer::sentinel_at(&late_addr).await.expect("sentinel");
    late.set_master("mymaster", master.addr());
    early.stop().await;

    backend.cmd("SET", &[Arg::from("k"), Arg::from("v")]).await.expect("set");
    assert_eq!(master.store().get(b"k"), Some(b"v".to_vec()));
    assert!(late.stats().commands >= 1, "late sentinel was never asked");
}

#[tokio::test]
async fn sentinel_without_master_reports_last_error() {
    let sentinel = TestServer::sentinel().await.expect("sentinel");
    let config = sentinel_config(vec![sentinel.addr()], "unknown");

    match SentinelBackend::connect(&config).await {
        Err(KvError::MasterUnavailable { group }) => assert_eq!(group, "unknown"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn sentinel_without_reachable_sentinel() {
    let config = sentinel_config(vec![closed_addr().await.expect("addr")], "mymaster");
    assert!(matches!(
        select_backend(&config).await,
        Err(KvError::NoConnectableEndpoint)
    ));
}

#[tokio::test]
async fn selection_precedence() {
    let master = TestServer::standalone().await.expect("master");
    let sentinel = TestServer::sentinel().await.expect("sentinel");
    sentinel.set_master("master", master.addr());
    let nodes = spawn_cluster(1).await.expect("cluster");

    // Sentinel wins even with use_cluster set.
    let both = BackendConfig {
        use_sentinel: true,
        use_cluster: true,
        sentinel_addresses: vec![sentinel.addr()],
        ..config_for(nodes[0].addr())
    };
    assert_eq!(select_backend(&both).await.unwrap().kind(), BackendKind::Sentinel);

    let cluster_only = cluster_config(nodes[0].addr());
    assert_eq!(select_backend(&cluster_only).await.unwrap().kind(), BackendKind::Cluster);

    let neither = config_for(master.addr());
    assert_eq!(select_backend(&neither).await.unwrap().kind(), BackendKind::Standalone);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_dialing() {
    let config = BackendConfig {
        pool_capacity: 0,
        ..BackendConfig::default()
    };
    assert!(matches!(
        select_backend(&config).await,
        Err(KvError::InvalidConfig(_))
    ));
}
