use crate::membership::{Member, MembershipError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// Largest UDP payload over IPv4.
pub(super) const MAX_DATAGRAM: usize = 65_507;

/// Everything exchanged between gossip members, one message per datagram. Probes and acks
/// piggyback recent membership updates in `gossip`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(super) enum Message {
    Ping {
        seq: u64,
        from: String,
        gossip: Vec<Member>,
    },
    Ack {
        seq: u64,
        from: String,
        gossip: Vec<Member>,
    },
    /// Asks the receiver to ping `target` and forward the ack, keeping `seq`.
    PingReq {
        seq: u64,
        from: String,
        target: SocketAddr,
        gossip: Vec<Member>,
    },
    Join {
        seq: u64,
        member: Member,
    },
    /// Everything the seed knows, tombstones included.
    JoinAck {
        seq: u64,
        members: Vec<Member>,
    },
    /// A change pushed straight to every member rather than gossiped: a join accepted by a seed,
    /// or our own departure.
    Announce {
        member: Member,
    },
}

impl Message {
    pub(super) fn encode(&self) -> Result<Vec<u8>, MembershipError> {
        Ok(bincode::serialize(self)?)
    }

    pub(super) fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
