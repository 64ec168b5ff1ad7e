use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use raftkv::{
    try_create_node, GossipOptions, HandlerError, MemberStatus, Membership, MembershipConfig, MembershipHandler,
    NodeConfig, RaftOptions, RecordDecoder, ReplicatedStore, StoreError, StoreLimits, TlsConfig, RPC_ADDR_TAG,
};
use slog::Drain;
use std::collections::HashMap;
use std::error::Error;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn replicated_writes_and_reads() -> Result<(), Box<dyn Error>> {
    let nodes = start_cluster(3, options()).await?;
    let leader = &nodes[0];

    leader.set("foo".into(), "bar".into()).await?;
    leader.set("john".into(), "doe".into()).await?;
    // Applied on the leader before `set` returns.
    assert_eq!(leader.get("foo")?, "bar");

    for follower in &nodes[1..] {
        eventually(Duration::from_secs(5), || follower.get("foo").ok() == Some("bar".into())).await;
        eventually(Duration::from_secs(5), || follower.get("john").ok() == Some("doe".into())).await;
    }

    leader.delete("foo".into()).await?;
    assert!(matches!(leader.get("foo"), Err(StoreError::NotFound)));
    assert_eq!(leader.get("john")?, "doe");
    // Deleting again is not an error.
    leader.delete("foo".into()).await?;

    for follower in &nodes[1..] {
        eventually(Duration::from_secs(5), || {
            matches!(follower.get("foo"), Err(StoreError::NotFound))
        })
        .await;
    }

    let exported: Vec<_> = RecordDecoder::from(&nodes[2].stream_all().into_bytes()[..])
        .collect::<Result<_, _>>()?;
    assert_eq!(exported.len(), 1);
    assert_eq!(exported[0].key, "john");
    assert_eq!(exported[0].value, "doe");

    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn follower_redirects_writes_to_leader() -> Result<(), Box<dyn Error>> {
    let nodes = start_cluster(3, options()).await?;
    let leader = &nodes[0];
    let follower = &nodes[1];
    eventually(Duration::from_secs(5), || follower.leader().is_some()).await;

    match follower.set("foo".into(), "bar".into()).await {
        Err(StoreError::NotLeader(info)) => {
            assert_eq!(info.replica_id, leader.id());
            assert_eq!(info.address, leader.address());
        }
        other => panic!("Expected NotLeader, got {:?}", other),
    }
    assert!(StoreError::NoLeader.is_retryable());

    // Oversized input is rejected before it reaches the log, leader or not.
    let too_long = "x".repeat(64);
    assert!(matches!(
        follower.set(too_long.clone(), "v".into()).await,
        Err(StoreError::Validation { .. })
    ));
    assert!(matches!(
        leader.set("k".into(), too_long).await,
        Err(StoreError::Validation { .. })
    ));

    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn follower_forwards_membership_changes() -> Result<(), Box<dyn Error>> {
    let nodes = start_cluster(2, options()).await?;
    let follower = &nodes[1];
    eventually(Duration::from_secs(5), || follower.leader().is_some()).await;

    let newcomer = start_node(2, false, None, options()).await?;
    retry_membership(|| follower.join(newcomer.id(), newcomer.address())).await?;

    nodes[0].set("after".into(), "join".into()).await?;
    eventually(Duration::from_secs(5), || newcomer.get("after").ok() == Some("join".into())).await;

    // Removing through the follower, twice. The second is a no-op.
    retry_membership(|| follower.leave(newcomer.id())).await?;
    retry_membership(|| follower.leave(newcomer.id())).await?;

    nodes[0].set("after".into(), "leave".into()).await?;
    eventually(Duration::from_secs(5), || follower.get("after").ok() == Some("leave".into())).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(newcomer.get("after")?, "join");

    newcomer.shutdown().await;
    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn new_node_catches_up_from_snapshot() -> Result<(), Box<dyn Error>> {
    let options = RaftOptions {
        snapshot_threshold: Some(5),
        snapshot_chunk_size: Some(64),
        ..options()
    };
    let nodes = start_cluster(1, options.clone()).await?;
    let leader = &nodes[0];

    for i in 0..30 {
        leader.set(format!("k{}", i), format!("v{}", i)).await?;
    }
    leader.delete("k7".into()).await?;

    // The log has been compacted well past the start, so this node can only catch up through
    // InstallSnapshot.
    let newcomer = start_node(1, false, None, options).await?;
    retry_membership(|| leader.join(newcomer.id(), newcomer.address())).await?;

    eventually(Duration::from_secs(10), || newcomer.get("k29").ok() == Some("v29".into())).await;
    assert_eq!(newcomer.get("k0")?, "v0");
    assert!(matches!(newcomer.get("k7"), Err(StoreError::NotFound)));

    leader.set("k30".into(), "v30".into()).await?;
    eventually(Duration::from_secs(5), || newcomer.get("k30").ok() == Some("v30".into())).await;

    newcomer.shutdown().await;
    shutdown(&nodes).await;
    Ok(())
}

#[tokio::test]
async fn restart_recovers_from_disk() -> Result<(), Box<dyn Error>> {
    let data_dir = tempfile::tempdir()?;
    let options = RaftOptions {
        snapshot_threshold: Some(4),
        ..options()
    };

    let node = start_node(0, true, Some(data_dir.path().to_path_buf()), options.clone()).await?;
    wait_for_leader(std::slice::from_ref(&node), Duration::from_secs(10)).await;
    for i in 0..10 {
        node.set(format!("k{}", i), format!("v{}", i)).await?;
    }
    node.delete("k3".into()).await?;
    node.shutdown().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Recovers from the snapshot plus the log entries after it, and keeps serving writes.
    let node = start_node(0, true, Some(data_dir.path().to_path_buf()), options).await?;
    // The snapshot is restored before the node starts, the rest once it's leader again.
    assert!(node.stream_all().count() > 0);
    wait_for_leader(std::slice::from_ref(&node), Duration::from_secs(10)).await;
    eventually(Duration::from_secs(5), || node.get("k9").ok() == Some("v9".into())).await;
    assert_eq!(node.get("k0")?, "v0");
    assert!(matches!(node.get("k3"), Err(StoreError::NotFound)));
    node.set("k10".into(), "v10".into()).await?;

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn gossip_drives_voter_set() -> Result<(), Box<dyn Error>> {
    let stores = vec![
        start_node(0, true, None, options()).await?,
        start_node(1, false, None, options()).await?,
        start_node(2, false, None, options()).await?,
    ];
    wait_for_leader(&stores[..1], Duration::from_secs(10)).await;

    let mut memberships = Vec::new();
    for store in &stores {
        let seeds = memberships.first().map(|m: &Membership| vec![m.local_addr()]).unwrap_or_default();
        let membership = Membership::new(
            gossip_config(store.id(), store.address(), seeds),
            Arc::new(store.clone()),
        )
        .await?;
        memberships.push(membership);
    }

    // Gossip join events added both followers as voters.
    stores[0].set("gossip".into(), "joined".into()).await?;
    for store in &stores[1..] {
        eventually(Duration::from_secs(10), || store.get("gossip").ok() == Some("joined".into())).await;
    }

    memberships[2].leave().await?;
    // Wait for the leader to have removed it. Removing an absent server is a no-op.
    eventually_async(Duration::from_secs(10), || async {
        let removed = stores[0].leave(stores[2].id()).await.is_ok();
        removed
    })
    .await;

    stores[0].set("gossip".into(), "left".into()).await?;
    eventually(Duration::from_secs(5), || stores[1].get("gossip").ok() == Some("left".into())).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(stores[2].get("gossip")?, "joined");

    shutdown(&stores).await;
    Ok(())
}

#[tokio::test]
async fn crashed_leader_is_removed_from_voters() -> Result<(), Box<dyn Error>> {
    let stores = vec![
        start_node(0, true, None, options()).await?,
        start_node(1, false, None, options()).await?,
        start_node(2, false, None, options()).await?,
    ];
    wait_for_leader(&stores[..1], Duration::from_secs(10)).await;

    let mut memberships = Vec::new();
    for store in &stores {
        let seeds = memberships.first().map(|m: &Membership| vec![m.local_addr()]).unwrap_or_default();
        let mut config = gossip_config(store.id(), store.address(), seeds);
        config.options.suspicion_timeout = Duration::from_millis(500);
        // Covers the election that follows the crash.
        config.options.handler_timeout = Duration::from_secs(15);
        memberships.push(Membership::new(config, Arc::new(store.clone())).await?);
    }

    stores[0].set("k".into(), "before".into()).await?;
    for store in &stores[1..] {
        eventually(Duration::from_secs(10), || store.get("k").ok() == Some("before".into())).await;
    }
    eventually_async(Duration::from_secs(10), || async {
        stores[0].servers().await.map(|servers| servers.len() == 3).unwrap_or(false)
    })
    .await;

    // Crash: no graceful leave, so the others only learn of it through failure detection.
    drop(memberships.remove(0));
    stores[0].shutdown().await;

    let survivors = &stores[1..];
    eventually_async(Duration::from_secs(20), || async {
        for store in survivors {
            if let Ok(servers) = store.servers().await {
                let leads = servers.iter().any(|s| s.is_leader && s.id == store.id());
                let excludes_crashed = servers.iter().all(|s| s.id != node_id(0));
                if leads && excludes_crashed && servers.len() == 2 {
                    return true;
                }
            }
        }
        false
    })
    .await;

    let leader = survivors
        .iter()
        .find(|store| store.leader().map(|l| l.replica_id == store.id()).unwrap_or(false))
        .ok_or("no leader among survivors")?;
    leader.set("k".into(), "after".into()).await?;
    for store in survivors {
        eventually(Duration::from_secs(5), || store.get("k").ok() == Some("after".into())).await;
    }

    shutdown(survivors).await;
    Ok(())
}

#[tokio::test]
async fn gossip_membership_converges() -> Result<(), Box<dyn Error>> {
    let node_count = 5;
    let mut memberships: Vec<Membership> = Vec::new();
    let mut handlers = Vec::new();
    for i in 0..node_count {
        let seeds = memberships.first().map(|m| vec![m.local_addr()]).unwrap_or_default();
        let handler = Arc::new(RecordingHandler::default());
        let membership = Membership::new(
            gossip_config(&i.to_string(), &format!("rpc-{}", i), seeds),
            handler.clone(),
        )
        .await?;
        memberships.push(membership);
        handlers.push(handler);
    }

    // Every node learns every other node's rpc address, and never its own.
    eventually(Duration::from_secs(10), || {
        handlers.iter().all(|handler| handler.members.lock().len() == node_count - 1)
    })
    .await;
    for (i, handler) in handlers.iter().enumerate() {
        let members = handler.members.lock();
        assert!(!members.contains_key(&i.to_string()));
        for j in (0..node_count).filter(|j| *j != i) {
            assert_eq!(members.get(&j.to_string()), Some(&format!("rpc-{}", j)));
        }
    }

    memberships[0].leave().await?;

    eventually(Duration::from_secs(10), || {
        handlers[1..]
            .iter()
            .all(|handler| handler.members.lock().len() == node_count - 2)
    })
    .await;
    for handler in &handlers[1..] {
        assert!(!handler.members.lock().contains_key("0"));
        assert_eq!(handler.leaves.lock().iter().filter(|name| *name == "0").count(), 1);
    }
    for membership in &memberships[1..] {
        let departed = membership.members().into_iter().find(|m| m.name == "0");
        assert_eq!(departed.map(|m| m.status), Some(MemberStatus::Left));
    }

    Ok(())
}

// ------- Helpers --------

#[derive(Default)]
struct RecordingHandler {
    members: Mutex<HashMap<String, String>>,
    leaves: Mutex<Vec<String>>,
}

#[async_trait]
impl MembershipHandler for RecordingHandler {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError> {
        self.members.lock().insert(name.to_string(), rpc_addr.to_string());
        Ok(())
    }

    async fn leave(&self, name: &str) -> Result<(), HandlerError> {
        self.members.lock().remove(name);
        self.leaves.lock().push(name.to_string());
        Ok(())
    }
}

fn options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(50)),
        follower_min_timeout: Some(Duration::from_millis(300)),
        follower_max_timeout: Some(Duration::from_millis(600)),
        leader_append_entries_timeout: Some(Duration::from_millis(150)),
        apply_timeout: Some(Duration::from_secs(5)),
        dial_timeout: Some(Duration::from_secs(2)),
        ..RaftOptions::default()
    }
}

fn cert_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs").join(name)
}

fn tls() -> TlsConfig {
    TlsConfig {
        ca_file: cert_path("ca.pem"),
        cert_file: cert_path("peer.pem"),
        key_file: cert_path("peer-key.pem"),
        server_name: "localhost".into(),
    }
}

fn node_id(i: usize) -> String {
    format!("node-{}", i)
}

async fn start_node(
    i: usize,
    bootstrap: bool,
    data_dir: Option<PathBuf>,
    options: RaftOptions,
) -> Result<ReplicatedStore, Box<dyn Error>> {
    let node = try_create_node(NodeConfig {
        node_id: node_id(i),
        bind_addr: "127.0.0.1:0".parse()?,
        advertise_addr: None,
        tls: tls(),
        data_dir,
        bootstrap,
        limits: StoreLimits::default(),
        options,
        logger: create_root_logger_for_stdout(node_id(i)),
    })
    .await?;

    Ok(node)
}

/// Bootstraps node 0, waits for it to lead, then adds the rest one at a time.
async fn start_cluster(size: usize, options: RaftOptions) -> Result<Vec<ReplicatedStore>, Box<dyn Error>> {
    let mut nodes = vec![start_node(0, true, None, options.clone()).await?];
    wait_for_leader(&nodes, Duration::from_secs(10)).await;

    for i in 1..size {
        let node = start_node(i, false, None, options.clone()).await?;
        retry_membership(|| nodes[0].join(node.id(), node.address())).await?;
        nodes.push(node);
    }

    Ok(nodes)
}

/// Membership changes are refused while another one is uncommitted, or before a new leader has
/// committed in its term.
async fn retry_membership<F, Fut>(change: F) -> Result<(), StoreError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match change().await {
            Err(e) if e.is_retryable() && Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            result => return result,
        }
    }
}

async fn wait_for_leader(nodes: &[ReplicatedStore], timeout: Duration) {
    eventually(timeout, || {
        nodes
            .iter()
            .any(|node| node.leader().map(|leader| leader.replica_id == node.id()).unwrap_or(false))
    })
    .await;
}

async fn shutdown(nodes: &[ReplicatedStore]) {
    for node in nodes {
        node.shutdown().await;
    }
}

async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "Condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn eventually_async<F, Fut>(timeout: Duration, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while !condition().await {
        assert!(Instant::now() < deadline, "Condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn gossip_config(name: &str, rpc_addr: &str, seeds: Vec<SocketAddr>) -> MembershipConfig {
    let mut tags = HashMap::new();
    tags.insert(RPC_ADDR_TAG.to_string(), rpc_addr.to_string());
    MembershipConfig {
        node_name: name.to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        tags,
        start_join_addrs: seeds,
        options: GossipOptions {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(50),
            ..GossipOptions::default()
        },
        logger: create_root_logger_for_stdout(name.to_string()),
    }
}

#[allow(dead_code)]
fn create_root_logger_for_file(directory_prefix: String, node_id: String) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/info_log_{}/{}_info.log", directory_prefix, node_id, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

fn create_root_logger_for_stdout(node_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("NodeId" => node_id))
}
