use crate::commitlog::Index;
use crate::grpc::{ProtoClusterConfig, ProtoClusterMember};
use crate::replica::peer_client::RaftClient;
use crate::transport::StreamLayer;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new<S: Into<String>>(replica_id: S) -> Self {
        ReplicaId(replica_id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ClusterConfig is the voter set, keyed by id, with the address each voter serves raft RPCs on.
/// It is carried whole in CONFIG log entries and in snapshot metadata.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct ClusterConfig {
    voters: BTreeMap<ReplicaId, String>,
}

impl ClusterConfig {
    pub(crate) fn single(replica_id: ReplicaId, address: String) -> Self {
        let mut voters = BTreeMap::new();
        voters.insert(replica_id, address);
        ClusterConfig { voters }
    }

    pub(crate) fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.voters.contains_key(replica_id)
    }

    pub(crate) fn address(&self, replica_id: &ReplicaId) -> Option<&str> {
        self.voters.get(replica_id).map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.voters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &str)> {
        self.voters.iter().map(|(id, address)| (id, address.as_str()))
    }

    pub(crate) fn with_voter(&self, replica_id: ReplicaId, address: String) -> Self {
        let mut next = self.clone();
        next.voters.insert(replica_id, address);
        next
    }

    pub(crate) fn without(&self, replica_id: &ReplicaId) -> Self {
        let mut next = self.clone();
        next.voters.remove(replica_id);
        next
    }

    pub(crate) fn to_proto(&self) -> ProtoClusterConfig {
        ProtoClusterConfig {
            members: self
                .voters
                .iter()
                .map(|(id, address)| ProtoClusterMember {
                    replica_id: id.as_str().to_string(),
                    address: address.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn from_proto(proto: ProtoClusterConfig) -> Self {
        let voters = proto
            .members
            .into_iter()
            .map(|member| (ReplicaId::new(member.replica_id), member.address))
            .collect();
        ClusterConfig { voters }
    }

    /// Payload of a CONFIG log entry.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let proto = self.to_proto();
        let mut buf = Vec::with_capacity(proto.encoded_len());
        // Vec grows on demand, so this can't run out of capacity.
        let _ = proto.encode(&mut buf);
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, io::Error> {
        ProtoClusterConfig::decode(bytes)
            .map(Self::from_proto)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) replica_id: ReplicaId,
    pub(crate) client: RaftClient,
}

/// ClusterTracker owns this replica's view of cluster membership.
///
/// It tracks two configs. `latest` is the newest config present in the log, and is in effect as
/// soon as it is appended. `committed` is the newest config known to be committed, and is what the
/// replica falls back on when an uncommitted config is truncated away.
pub(crate) struct ClusterTracker {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    my_address: String,
    committed: (Option<Index>, ClusterConfig),
    latest: (Option<Index>, ClusterConfig),
    peers: HashMap<ReplicaId, Peer>,
    stream_layer: Arc<StreamLayer>,
    dial_timeout: Duration,
}

impl ClusterTracker {
    pub(crate) fn new(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        my_address: String,
        stream_layer: Arc<StreamLayer>,
        dial_timeout: Duration,
    ) -> Self {
        ClusterTracker {
            logger,
            my_replica_id,
            my_address,
            committed: (None, ClusterConfig::default()),
            latest: (None, ClusterConfig::default()),
            peers: HashMap::new(),
            stream_layer,
            dial_timeout,
        }
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub(crate) fn my_address(&self) -> &str {
        &self.my_address
    }

    pub(crate) fn latest_config(&self) -> &ClusterConfig {
        &self.latest.1
    }

    pub(crate) fn latest_config_index(&self) -> Option<Index> {
        self.latest.0
    }

    pub(crate) fn committed_config(&self) -> &ClusterConfig {
        &self.committed.1
    }

    pub(crate) fn committed_config_index(&self) -> Option<Index> {
        self.committed.0
    }

    pub(crate) fn has_uncommitted_config(&self) -> bool {
        self.latest.0 != self.committed.0
    }

    pub(crate) fn am_i_voter(&self) -> bool {
        self.latest.1.contains(&self.my_replica_id)
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.latest.1.len()
    }

    pub(crate) fn peer(&self, peer_id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// A config entry was appended at `index`. It takes effect immediately.
    pub(crate) fn set_latest(&mut self, index: Index, config: ClusterConfig) {
        slog::info!(self.logger, "Cluster config at {:?} is now in effect: {:?}", index, config);
        self.latest = (Some(index), config);
        self.rebuild_peers();
    }

    /// The config entry at `index` was applied, so it is committed.
    pub(crate) fn mark_applied(&mut self, index: Index, config: ClusterConfig) {
        if self.committed.0.map(|ci| ci < index).unwrap_or(true) {
            slog::info!(self.logger, "Cluster config at {:?} is committed", index);
            self.committed = (Some(index), config);
        }
    }

    /// Config entries at `from` and later were removed from the log. `replacement` is the newest
    /// config entry still in the log after `committed`, if any.
    pub(crate) fn revert_latest(&mut self, replacement: Option<(Index, ClusterConfig)>) {
        self.latest = match replacement {
            Some((index, config)) => (Some(index), config),
            None => self.committed.clone(),
        };
        slog::info!(self.logger, "Cluster config reverted to {:?}", self.latest.1);
        self.rebuild_peers();
    }

    /// Both configs are replaced wholesale, e.g. after restoring a snapshot.
    pub(crate) fn reset(&mut self, index: Option<Index>, config: ClusterConfig) {
        self.committed = (index, config.clone());
        self.latest = (index, config);
        self.rebuild_peers();
    }

    fn rebuild_peers(&mut self) {
        let config = &self.latest.1;
        self.peers
            .retain(|id, peer| config.address(id) == Some(peer.client.address()));

        for (id, address) in config.iter() {
            if *id == self.my_replica_id || self.peers.contains_key(id) {
                continue;
            }
            let client = RaftClient::new(
                self.logger.new(slog::o!("Peer" => id.as_str().to_string())),
                address.to_string(),
                self.stream_layer.clone(),
                self.dial_timeout,
            );
            self.peers.insert(
                id.clone(),
                Peer {
                    replica_id: id.clone(),
                    client,
                },
            );
        }
    }
}
