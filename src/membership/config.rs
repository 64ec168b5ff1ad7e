use crate::membership::MembershipError;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::time::Duration;

pub struct MembershipConfig {
    pub node_name: String,
    /// UDP address for gossip. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Should include `RPC_ADDR_TAG`, or peers can't add this node to the raft cluster.
    pub tags: HashMap<String, String>,
    /// Gossip addresses of existing members. Empty to start a new pool.
    pub start_join_addrs: Vec<SocketAddr>,
    pub options: GossipOptions,
    pub logger: slog::Logger,
}

#[derive(Clone, Debug)]
pub struct GossipOptions {
    /// Time between probes of a random member.
    pub probe_interval: Duration,
    /// How long to wait for an ack, first directly and then through relays.
    pub probe_timeout: Duration,
    /// Members asked to probe on our behalf after a missed direct ack.
    pub indirect_probes: usize,
    pub suspicion_timeout: Duration,
    /// Each update is piggybacked `retransmit_multiplier * ceil(log10(n + 1))` times.
    pub retransmit_multiplier: u32,
    pub max_gossip_per_message: usize,
    /// Upper bound on one handler call, including retries of retryable errors.
    pub handler_timeout: Duration,
    pub join_timeout: Duration,
}

impl Default for GossipOptions {
    fn default() -> Self {
        GossipOptions {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            indirect_probes: 3,
            suspicion_timeout: Duration::from_secs(1),
            retransmit_multiplier: 4,
            max_gossip_per_message: 16,
            handler_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(1),
        }
    }
}

impl GossipOptions {
    pub fn validate(&self) -> Result<(), MembershipError> {
        if self.probe_interval == Duration::from_millis(0) || self.probe_timeout == Duration::from_millis(0) {
            return Err(MembershipError::InvalidOptions("Probe interval and timeout must be non-zero"));
        }
        if self.suspicion_timeout <= self.probe_timeout {
            return Err(MembershipError::InvalidOptions(
                "Suspicion timeout must be greater than probe timeout",
            ));
        }
        if self.retransmit_multiplier == 0 || self.max_gossip_per_message == 0 {
            return Err(MembershipError::InvalidOptions("Gossip must be retransmitted at least once"));
        }
        if self.handler_timeout == Duration::from_millis(0) || self.join_timeout == Duration::from_millis(0) {
            return Err(MembershipError::InvalidOptions("Handler and join timeouts must be non-zero"));
        }

        Ok(())
    }
}
