use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Invalid gossip options: {0}")]
    InvalidOptions(&'static str),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("Failed to encode gossip message: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Failed to send to {addr}: {source}")]
    Send { addr: SocketAddr, source: io::Error },

    #[error("No seed answered the join request: {0:?}")]
    JoinFailed(Vec<SocketAddr>),

    #[error("Already left the gossip pool")]
    AlreadyLeft,
}
