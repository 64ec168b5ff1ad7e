use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Tag under which a member advertises the address of its raft RPC server.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    /// Missed a probe. Becomes `Failed` unless it refutes within the suspicion timeout.
    Suspect,
    Failed,
    /// Left gracefully.
    Left,
}

impl MemberStatus {
    /// Alive and Suspect members are still probed and still count as part of the cluster.
    pub fn is_active(&self) -> bool {
        matches!(self, MemberStatus::Alive | MemberStatus::Suspect)
    }
}

/// Member is one node as seen by the gossip layer. `addr` is its gossip address. Its raft RPC
/// address is in `tags` under `RPC_ADDR_TAG`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    /// Only the member itself increments this, to refute suspicion or to leave.
    pub incarnation: u64,
}

impl Member {
    pub fn rpc_addr(&self) -> Option<&str> {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str)
    }
}

/// A change in the cluster, delivered in order to the `MembershipHandler`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemberEvent {
    Join(Vec<Member>),
    Leave(Vec<Member>),
    Failed(Vec<Member>),
}

impl MemberEvent {
    pub fn members(&self) -> &[Member] {
        match self {
            MemberEvent::Join(members) | MemberEvent::Leave(members) | MemberEvent::Failed(members) => members,
        }
    }

    // Folds `other` into `self` if both are the same kind of event.
    pub(super) fn try_merge(&mut self, other: MemberEvent) -> Option<MemberEvent> {
        match (self, other) {
            (MemberEvent::Join(mine), MemberEvent::Join(more))
            | (MemberEvent::Leave(mine), MemberEvent::Leave(more))
            | (MemberEvent::Failed(mine), MemberEvent::Failed(more)) => {
                mine.extend(more);
                None
            }
            (_, other) => Some(other),
        }
    }
}
