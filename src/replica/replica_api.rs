use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::{ClusterConfig, ReplicaId};
use crate::replica::EntryKind;
use crate::store::StoreError;
use bytes::Bytes;
use std::io;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) address: String,
}

/// A voter in the latest config this replica knows of.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) address: String,
    pub(crate) is_leader: bool,
}

#[derive(Debug)]
pub(crate) struct ApplyInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct ApplyOutput {
    pub(crate) index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApplyError {
    #[error("I'm not leader")]
    NotLeader(Option<LeaderRedirectInfo>),

    #[error("Entry not committed: {0}")]
    NotCommitted(String),

    #[error("State machine rejected committed entry: {0}")]
    Rejected(StoreError),

    #[error("Failed to persist entry: {0}")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChangeMembershipInput {
    AddVoter { replica_id: ReplicaId, address: String },
    RemoveServer { replica_id: ReplicaId },
}

#[derive(Debug)]
pub(crate) struct ChangeMembershipOutput {
    // Index of the config entry that holds the change. None only if the cluster has no config yet.
    pub(crate) config_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ChangeMembershipError {
    #[error("I'm not leader")]
    NotLeader(Option<LeaderRedirectInfo>),

    #[error("Another membership change is still uncommitted")]
    ChangeInProgress,

    #[error("Membership change not committed: {0}")]
    NotCommitted(String),

    #[error("Invalid membership change: {0}")]
    Invalid(String),

    #[error("Failed to persist config entry: {0}")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_address: String,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    pub(crate) kind: EntryKind,
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry { last_log_entry_index: Option<Index> },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) leader_address: String,
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    pub(crate) config: ClusterConfig,
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
    pub(crate) done: bool,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Chunk offset doesn't line up, expected {expected}")]
    UnexpectedOffset { expected: u64 },
    #[error("We (server) failed to install the snapshot: {0}")]
    ServerFault(String),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_entry_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) descriptor: InstallSnapshotReplyFromPeerDescriptor,
    pub(crate) result: Result<(), InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) done: bool,
}

#[derive(Debug)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    UnexpectedOffset { expected: u64 },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}
