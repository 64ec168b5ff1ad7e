use crate::actor::WeakActorClient;
use crate::commitlog::Log;
use crate::replica::{
    ClusterTracker, ElectionStateChangeListener, PersistentLocalState, Replica, ReplicaConfig, ReplicaOptions,
    RestoreError, SnapshotStore, StateMachine, WriteAheadLog, WriteAheadLogEntry,
};
use crate::server;
use std::io;

/// ReplicaStorage is everything a replica persists: its log, its term and vote, and its snapshots.
pub(crate) struct ReplicaStorage<L> {
    pub(crate) log: L,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) snapshot_store: Box<dyn SnapshotStore>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReplicaCreationError {
    #[error("Failed to recover persisted state: {0}")]
    Storage(#[from] io::Error),
    #[error("Failed to restore latest snapshot: {0}")]
    Restore(#[from] RestoreError),
}

/// Recovers the replica from storage. The latest snapshot is restored into `state_machine` before
/// anything else, so the log only needs to replay what came after it.
pub(crate) fn create_replica<L>(
    logger: slog::Logger,
    cluster_tracker: ClusterTracker,
    storage: ReplicaStorage<L>,
    mut state_machine: Box<dyn StateMachine>,
    bootstrap: bool,
    server_shutdown_handle: server::RpcServerShutdownHandle,
    actor_client: WeakActorClient,
    options: ReplicaOptions,
) -> Result<(Replica<L>, ElectionStateChangeListener), ReplicaCreationError>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    let current_snapshot = storage.snapshot_store.load_latest()?;
    if let Some(snapshot) = &current_snapshot {
        state_machine.restore(snapshot.data.clone())?;
        slog::info!(
            logger,
            "Restored snapshot through {:?}",
            snapshot.meta.last_included_index()
        );
    }

    let snapshot_base = current_snapshot
        .as_ref()
        .map(|snapshot| (snapshot.meta.last_included_term, snapshot.meta.last_included_index()));
    let wal = WriteAheadLog::new(logger.clone(), storage.log, snapshot_base)?;

    let replica = Replica::new(ReplicaConfig {
        logger,
        cluster_tracker,
        local_state: storage.local_state,
        wal,
        state_machine,
        snapshot_store: storage.snapshot_store,
        current_snapshot,
        bootstrap,
        actor_client,
        options,
        server_shutdown_handle,
    })?;

    Ok(replica)
}
