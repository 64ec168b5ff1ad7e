use crate::replica;

/// Where to send requests that need the leader. `address` is the leader's raft RPC address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaderInfo {
    pub replica_id: String,
    pub address: String,
}

/// A voting member of the cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Server {
    pub id: String,
    pub address: String,
    pub is_leader: bool,
}

impl From<replica::ServerInfo> for Server {
    fn from(info: replica::ServerInfo) -> Self {
        Self {
            id: info.replica_id.into_inner(),
            address: info.address,
            is_leader: info.is_leader,
        }
    }
}

impl From<replica::LeaderRedirectInfo> for LeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            address: internal_leader.address,
        }
    }
}
