use crate::snapshot::CorruptSnapshot;
use crate::store::StoreError;
use bytes::Bytes;

/// StateMachine is what the replica applies committed commands to. Implementations must be
/// deterministic: replicas that apply the same entries in the same order, starting from the same
/// snapshot, must end up in the same state.
///
/// All methods are called from the replica's event loop, so they should return quickly.
pub(crate) trait StateMachine: Send {
    /// Applies one committed command. An error is reported to whoever proposed the command, but the
    /// entry still counts as applied.
    fn apply_committed_entry(&mut self, entry: Bytes) -> Result<(), StoreError>;

    /// Freezes the current state into snapshot bytes. Later applies must not affect the result.
    fn snapshot(&mut self) -> Result<Bytes, StoreError>;

    /// Discards all state and rebuilds it from `snapshot`.
    fn restore(&mut self, snapshot: Bytes) -> Result<(), RestoreError>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RestoreError {
    #[error(transparent)]
    Corrupt(#[from] CorruptSnapshot),

    #[error("Snapshot record rejected: {0}")]
    Rejected(#[from] StoreError),
}
