mod election;
mod local_state;
mod peer_client;
mod peers;
mod replica;
mod replica_api;
mod replica_wiring;
mod snapshot_store;
mod state_machine;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use peer_client::RaftClient;
pub(crate) use peers::ClusterConfig;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::ReplicaId;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica::ReplicaOptions;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaCreationError;
pub(crate) use replica_wiring::ReplicaStorage;
pub(crate) use snapshot_store::FileSnapshotStore;
pub(crate) use snapshot_store::InMemorySnapshotStore;
pub(crate) use snapshot_store::Snapshot;
pub(crate) use snapshot_store::SnapshotMeta;
pub(crate) use snapshot_store::SnapshotStore;
pub(crate) use state_machine::RestoreError;
pub(crate) use state_machine::StateMachine;
pub(crate) use write_ahead_log::EntryKind;
pub(crate) use write_ahead_log::WriteAheadLog;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
