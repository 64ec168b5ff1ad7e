use crate::actor::{ActorClient, Event, ReplicaActor};
use crate::api::options::RaftOptionsValidated;
use crate::api::replicated_store::ReplicatedStore;
use crate::api::RaftOptions;
use crate::commitlog::{FileLog, InMemoryLog, Log};
use crate::fsm::KvStateMachine;
use crate::replica::{
    self, ClusterTracker, ElectionStateChangeListener, FileLocalState, FileSnapshotStore, InMemorySnapshotStore,
    ReplicaCreationError, ReplicaId, ReplicaStorage, VolatileLocalState, WriteAheadLogEntry,
};
use crate::server::{self, RpcServer, RpcServerShutdownHandle};
use crate::store::{KeyValueStore, StoreLimits};
use crate::transport::{StreamLayer, TlsConfig, TransportError};
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

// Snapshots kept on disk besides the latest one are never read back, so keep only that.
const SNAPSHOTS_RETAINED: usize = 1;

pub struct NodeConfig {
    pub node_id: String,
    /// Where the raft RPC server listens. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Address peers dial to reach this node. Defaults to the bound address.
    pub advertise_addr: Option<String>,
    pub tls: TlsConfig,
    /// Root for the durable log, stable state and snapshots. In-memory storage when None.
    pub data_dir: Option<PathBuf>,
    /// Write the initial single-voter config if the log is empty. Exactly one node of a new
    /// cluster should bootstrap; the others are added with `join`.
    pub bootstrap: bool,
    pub limits: StoreLimits,
    pub options: RaftOptions,
    pub logger: slog::Logger,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to open persisted state: {0}")]
    Storage(io::Error),
    #[error("Failed to restore persisted snapshot: {0}")]
    Restore(String),
}

impl From<ReplicaCreationError> for NodeCreationError {
    fn from(e: ReplicaCreationError) -> Self {
        match e {
            ReplicaCreationError::Storage(e) => NodeCreationError::Storage(e),
            ReplicaCreationError::Restore(e) => NodeCreationError::Restore(e.to_string()),
        }
    }
}

pub async fn try_create_node(config: NodeConfig) -> Result<ReplicatedStore, NodeCreationError> {
    let root_logger = config.logger.new(slog::o!("Node" => config.node_id.clone()));

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;
    if config.node_id.is_empty() {
        return Err(NodeCreationError::IllegalOptions(String::from("Node ID must not be empty")));
    }

    let stream_layer = Arc::new(
        StreamLayer::bind(
            root_logger.clone(),
            config.bind_addr,
            &config.tls,
            options.dial_timeout,
        )
        .await?,
    );
    let address = config
        .advertise_addr
        .unwrap_or_else(|| stream_layer.local_addr().to_string());

    let my_replica_id = ReplicaId::new(config.node_id.clone());
    let cluster_tracker = ClusterTracker::new(
        root_logger.clone(),
        my_replica_id.clone(),
        address.clone(),
        stream_layer.clone(),
        options.dial_timeout,
    );

    let store = Arc::new(KeyValueStore::new(root_logger.clone(), config.limits));
    let state_machine = Box::new(KvStateMachine::new(root_logger.clone(), store.clone()));

    let (actor_client, actor_queue_rx) = ActorClient::new(64);
    let (server_shutdown_handle, server_shutdown_signal) = server::shutdown_signal();

    let spawn = SpawnReplica {
        logger: root_logger.clone(),
        cluster_tracker,
        state_machine,
        bootstrap: config.bootstrap,
        server_shutdown_handle,
        actor_client: actor_client.clone(),
        actor_queue_rx,
        options: options.replica_options(),
    };

    let election_state_change_listener = match &config.data_dir {
        Some(data_dir) => spawn.run(file_storage(&root_logger, data_dir, &my_replica_id)?)?,
        None => spawn.run(in_memory_storage(my_replica_id)?)?,
    };

    let replica_raft_server = RpcServer::new(root_logger.clone(), actor_client.weak());
    tokio::spawn(replica_raft_server.run(stream_layer.clone(), server_shutdown_signal));

    Ok(ReplicatedStore::new(
        root_logger,
        config.node_id,
        address,
        store,
        actor_client,
        election_state_change_listener,
        stream_layer,
        &options,
    ))
}

fn file_storage(
    logger: &slog::Logger,
    data_dir: &Path,
    my_replica_id: &ReplicaId,
) -> Result<ReplicaStorage<FileLog<WriteAheadLogEntry>>, NodeCreationError> {
    let raft_dir = data_dir.join("raft");
    let log = FileLog::open(raft_dir.join("log")).map_err(NodeCreationError::Storage)?;
    let local_state =
        FileLocalState::open(raft_dir.join("stable"), my_replica_id.clone()).map_err(NodeCreationError::Storage)?;
    let snapshot_store = FileSnapshotStore::open(logger.clone(), raft_dir.join("snapshots"), SNAPSHOTS_RETAINED)
        .map_err(NodeCreationError::Storage)?;

    Ok(ReplicaStorage {
        log,
        local_state: Box::new(local_state),
        snapshot_store: Box::new(snapshot_store),
    })
}

fn in_memory_storage(
    my_replica_id: ReplicaId,
) -> Result<ReplicaStorage<InMemoryLog<WriteAheadLogEntry>>, NodeCreationError> {
    let log = InMemoryLog::create().map_err(NodeCreationError::Storage)?;

    Ok(ReplicaStorage {
        log,
        local_state: Box::new(VolatileLocalState::new(my_replica_id)),
        snapshot_store: Box::new(InMemorySnapshotStore::default()),
    })
}

/// Everything needed to start the replica actor, independent of which log backs it.
struct SpawnReplica {
    logger: slog::Logger,
    cluster_tracker: ClusterTracker,
    state_machine: Box<KvStateMachine>,
    bootstrap: bool,
    server_shutdown_handle: RpcServerShutdownHandle,
    actor_client: ActorClient,
    actor_queue_rx: mpsc::Receiver<Event>,
    options: replica::ReplicaOptions,
}

impl SpawnReplica {
    fn run<L>(self, storage: ReplicaStorage<L>) -> Result<ElectionStateChangeListener, NodeCreationError>
    where
        L: Log<WriteAheadLogEntry> + Send + 'static,
    {
        let (replica, election_state_change_listener) = replica::create_replica(
            self.logger.clone(),
            self.cluster_tracker,
            storage,
            self.state_machine,
            self.bootstrap,
            self.server_shutdown_handle,
            self.actor_client.weak(),
            self.options,
        )?;

        let replica_actor = ReplicaActor::new(self.logger, self.actor_queue_rx, replica);
        tokio::spawn(replica_actor.run_event_loop());

        Ok(election_state_change_listener)
    }
}
