use crate::store::StoreError;
use async_trait::async_trait;

/// MembershipHandler is told about every other member that joins or leaves the gossip pool.
/// Calls arrive one at a time, so a slow handler delays every event behind it.
#[async_trait]
pub trait MembershipHandler: Send + Sync {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError>;

    async fn leave(&self, name: &str) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Expected on every node but the leader when changes aren't forwarded.
    #[error("Not leader")]
    NotLeader,

    #[error(transparent)]
    Store(StoreError),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::NotLeader => false,
            HandlerError::Store(e) => e.is_retryable(),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotLeader(_) => HandlerError::NotLeader,
            // Mid-election. Retried until a leader emerges.
            e => HandlerError::Store(e),
        }
    }
}
