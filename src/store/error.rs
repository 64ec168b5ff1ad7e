use crate::api::LeaderInfo;
use crate::fsm::CommandDecodeError;

/// Errors surfaced to callers of the key-value API, local or replicated.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Key not found")]
    NotFound,

    #[error("{field} is {len} bytes, must be at most {max} bytes")]
    Validation {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// The write may or may not have been applied. Set and Delete are safe to retry.
    #[error("Write was not confirmed as committed: {0}")]
    NotCommitted(String),

    #[error("Not leader, retry against {0:?}")]
    NotLeader(LeaderInfo),

    #[error("Not leader, and no leader is currently known")]
    NoLeader,

    #[error("A cluster membership change is already in progress")]
    ChangeInProgress,

    #[error("Invalid membership change: {0}")]
    InvalidMembership(String),

    /// The local store can't serve reads until it catches up from a fresh snapshot.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandDecodeError),

    #[error("Operation failed, retry: {0}")]
    Transport(String),

    #[error("Replica has exited")]
    ReplicaExited,
}

impl StoreError {
    /// Whether the caller should retry the same operation, possibly against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::NotCommitted(_)
                | StoreError::NotLeader(_)
                | StoreError::NoLeader
                | StoreError::ChangeInProgress
                | StoreError::Transport(_)
        )
    }
}
