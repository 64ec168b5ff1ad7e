use crate::actor::ActorClient;
use crate::api::options::RaftOptionsValidated;
use crate::api::{ElectionEvent, EventListener, LeaderInfo, Server};
use crate::fsm::Command;
use crate::grpc::{
    proto_change_membership_error, proto_change_membership_req, proto_change_membership_result, ProtoAddVoter,
    ProtoChangeMembershipReq, ProtoChangeMembershipResult, ProtoRemoveServer,
};
use crate::membership::{HandlerError, MembershipHandler};
use crate::replica::{
    self, ApplyError, ChangeMembershipError, ChangeMembershipInput, ElectionStateChangeListener, RaftClient, ReplicaId,
};
use crate::snapshot::SnapshotStream;
use crate::store::{KeyValueDb, KeyValueStore, StoreError};
use crate::transport::StreamLayer;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{self, Duration};

/// ReplicatedStore is a key-value store kept consistent across the cluster. Writes go through the
/// raft log and return once applied locally. Reads are served from the local copy, which may lag
/// the leader.
#[derive(Clone)]
pub struct ReplicatedStore {
    logger: slog::Logger,
    node_id: String,
    address: String,
    store: Arc<KeyValueStore>,
    actor_client: ActorClient,
    election_state_change_listener: ElectionStateChangeListener,
    stream_layer: Arc<StreamLayer>,
    apply_timeout: Duration,
    dial_timeout: Duration,
    forward_membership_changes: bool,
}

impl ReplicatedStore {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        logger: slog::Logger,
        node_id: String,
        address: String,
        store: Arc<KeyValueStore>,
        actor_client: ActorClient,
        election_state_change_listener: ElectionStateChangeListener,
        stream_layer: Arc<StreamLayer>,
        options: &RaftOptionsValidated,
    ) -> Self {
        ReplicatedStore {
            logger,
            node_id,
            address,
            store,
            actor_client,
            election_state_change_listener,
            stream_layer,
            apply_timeout: options.apply_timeout,
            dial_timeout: options.dial_timeout,
            forward_membership_changes: options.forward_membership_changes,
        }
    }

    pub fn id(&self) -> &str {
        &self.node_id
    }

    /// The raft RPC address peers use to reach this node.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.store.get(key)
    }

    pub async fn set(&self, key: String, value: String) -> Result<(), StoreError> {
        self.store.limits().validate(&key, Some(&value))?;
        self.apply(Command::Set { key, value }).await
    }

    pub async fn delete(&self, key: String) -> Result<(), StoreError> {
        self.store.limits().validate(&key, None)?;
        self.apply(Command::Delete { key }).await
    }

    /// Adds `node_id` as a voter. Succeeds without a new entry if it's already a voter at `address`.
    pub async fn join(&self, node_id: &str, address: &str) -> Result<(), StoreError> {
        self.change_membership(ChangeMembershipInput::AddVoter {
            replica_id: ReplicaId::new(node_id),
            address: address.to_string(),
        })
        .await
    }

    /// Removes `node_id` from the voters. Succeeds if it isn't one.
    pub async fn leave(&self, node_id: &str) -> Result<(), StoreError> {
        self.change_membership(ChangeMembershipInput::RemoveServer {
            replica_id: ReplicaId::new(node_id),
        })
        .await
    }

    /// Every record in the local store, framed the same way as snapshots.
    pub fn stream_all(&self) -> SnapshotStream<'_> {
        self.store.snapshot()
    }

    /// The leader as last observed by this node, which may be this node.
    pub fn leader(&self) -> Option<LeaderInfo> {
        match ElectionEvent::from(self.election_state_change_listener.current()) {
            ElectionEvent::Leader => Some(LeaderInfo {
                replica_id: self.node_id.clone(),
                address: self.address.clone(),
            }),
            ElectionEvent::Follower(data) => Some(LeaderInfo {
                replica_id: data.leader_replica_id,
                address: data.leader_address,
            }),
            ElectionEvent::Candidate | ElectionEvent::FollowerNoLeader => None,
        }
    }

    /// Voters in this node's latest cluster config, flagging the leader it currently knows of.
    pub async fn servers(&self) -> Result<Vec<Server>, StoreError> {
        let servers = self
            .actor_client
            .get_servers()
            .await
            .map_err(|_| StoreError::ReplicaExited)?;

        Ok(servers.into_iter().map(Server::from).collect())
    }

    pub fn events(&self) -> EventListener {
        EventListener::new(self.election_state_change_listener.clone())
    }

    /// Stops the replica and its RPC server. Calls made afterwards fail with `ReplicaExited`.
    pub async fn shutdown(&self) {
        slog::info!(self.logger, "Shutting down");
        self.actor_client.shutdown().await;
    }

    async fn apply(&self, command: Command) -> Result<(), StoreError> {
        let input = replica::ApplyInput { data: command.encode() };

        match time::timeout(self.apply_timeout, self.actor_client.apply(input)).await {
            Ok(Ok(output)) => {
                slog::debug!(self.logger, "Applied at {:?}", output.index);
                Ok(())
            }
            Ok(Err(e)) => Err(convert_apply_error(e)),
            Err(_) => Err(StoreError::NotCommitted(format!(
                "Not applied within {:?}",
                self.apply_timeout
            ))),
        }
    }

    async fn change_membership(&self, input: ChangeMembershipInput) -> Result<(), StoreError> {
        let result = time::timeout(self.apply_timeout, self.actor_client.change_membership(input.clone())).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(ChangeMembershipError::NotLeader(Some(leader)))) if self.forward_membership_changes => {
                self.forward_change_membership(LeaderInfo::from(leader), input).await
            }
            Ok(Err(e)) => Err(convert_change_membership_error(e)),
            Err(_) => Err(StoreError::NotCommitted(format!(
                "Membership change not applied within {:?}",
                self.apply_timeout
            ))),
        }
    }

    // Single hop. The leader's RPC server handles the request locally and never forwards again.
    async fn forward_change_membership(
        &self,
        leader: LeaderInfo,
        input: ChangeMembershipInput,
    ) -> Result<(), StoreError> {
        slog::debug!(self.logger, "Forwarding {:?} to leader {:?}", input, leader);

        let client = RaftClient::new(
            self.logger.new(slog::o!("Peer" => leader.replica_id.clone())),
            leader.address.clone(),
            self.stream_layer.clone(),
            self.dial_timeout,
        );
        let request = convert_change_membership_request(input);

        match time::timeout(self.apply_timeout, client.change_membership(request)).await {
            Ok(Ok(reply)) => convert_change_membership_reply(reply),
            Ok(Err(status)) => Err(StoreError::Transport(format!(
                "Forwarding to leader {} failed: {}",
                leader.replica_id,
                status.message()
            ))),
            Err(_) => Err(StoreError::NotCommitted(format!(
                "Leader {} didn't confirm membership change within {:?}",
                leader.replica_id, self.apply_timeout
            ))),
        }
    }
}

#[async_trait]
impl KeyValueDb for ReplicatedStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        ReplicatedStore::get(self, key)
    }

    async fn set(&self, key: String, value: String) -> Result<(), StoreError> {
        ReplicatedStore::set(self, key, value).await
    }

    async fn delete(&self, key: String) -> Result<(), StoreError> {
        ReplicatedStore::delete(self, key).await
    }

    fn read_all(&self) -> SnapshotStream<'_> {
        self.stream_all()
    }
}

#[async_trait]
impl MembershipHandler for ReplicatedStore {
    async fn join(&self, name: &str, rpc_addr: &str) -> Result<(), HandlerError> {
        ReplicatedStore::join(self, name, rpc_addr)
            .await
            .map_err(HandlerError::from)
    }

    async fn leave(&self, name: &str) -> Result<(), HandlerError> {
        ReplicatedStore::leave(self, name).await.map_err(HandlerError::from)
    }
}

// ------- Conversions --------

fn convert_apply_error(e: ApplyError) -> StoreError {
    match e {
        ApplyError::NotLeader(Some(leader)) => StoreError::NotLeader(LeaderInfo::from(leader)),
        ApplyError::NotLeader(None) => StoreError::NoLeader,
        ApplyError::NotCommitted(message) => StoreError::NotCommitted(message),
        ApplyError::Rejected(e) => e,
        ApplyError::LocalIoError(e) => StoreError::Transport(format!("Leader failed to persist entry: {}", e)),
        ApplyError::ActorExited => StoreError::ReplicaExited,
    }
}

fn convert_change_membership_error(e: ChangeMembershipError) -> StoreError {
    match e {
        ChangeMembershipError::NotLeader(Some(leader)) => StoreError::NotLeader(LeaderInfo::from(leader)),
        ChangeMembershipError::NotLeader(None) => StoreError::NoLeader,
        ChangeMembershipError::ChangeInProgress => StoreError::ChangeInProgress,
        ChangeMembershipError::NotCommitted(message) => StoreError::NotCommitted(message),
        ChangeMembershipError::Invalid(message) => StoreError::InvalidMembership(message),
        ChangeMembershipError::LocalIoError(e) => {
            StoreError::Transport(format!("Leader failed to persist config: {}", e))
        }
        ChangeMembershipError::ActorExited => StoreError::ReplicaExited,
    }
}

fn convert_change_membership_request(input: ChangeMembershipInput) -> ProtoChangeMembershipReq {
    let change = match input {
        ChangeMembershipInput::AddVoter { replica_id, address } => {
            proto_change_membership_req::Change::AddVoter(ProtoAddVoter {
                replica_id: replica_id.into_inner(),
                address,
            })
        }
        ChangeMembershipInput::RemoveServer { replica_id } => {
            proto_change_membership_req::Change::RemoveServer(ProtoRemoveServer {
                replica_id: replica_id.into_inner(),
            })
        }
    };

    ProtoChangeMembershipReq { change: Some(change) }
}

fn convert_change_membership_reply(reply: ProtoChangeMembershipResult) -> Result<(), StoreError> {
    let err = match reply.result {
        Some(proto_change_membership_result::Result::Ok(_)) => return Ok(()),
        Some(proto_change_membership_result::Result::Err(err)) => err.err,
        None => None,
    };

    Err(match err {
        Some(proto_change_membership_error::Err::NotLeader(not_leader)) => {
            if not_leader.leader_id.is_empty() {
                StoreError::NoLeader
            } else {
                StoreError::NotLeader(LeaderInfo {
                    replica_id: not_leader.leader_id,
                    address: not_leader.leader_address,
                })
            }
        }
        Some(proto_change_membership_error::Err::ChangeInProgress(_)) => StoreError::ChangeInProgress,
        Some(proto_change_membership_error::Err::NotCommitted(not_committed)) => {
            StoreError::NotCommitted(not_committed.message)
        }
        Some(proto_change_membership_error::Err::ServerFault(fault)) => StoreError::Transport(fault.message),
        None => StoreError::Transport(String::from("Leader sent an empty membership reply")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{ProtoChangeInProgress, ProtoChangeMembershipError, ProtoChangeMembershipSuccess, ProtoNotLeader};

    fn reply_err(err: proto_change_membership_error::Err) -> ProtoChangeMembershipResult {
        ProtoChangeMembershipResult {
            result: Some(proto_change_membership_result::Result::Err(ProtoChangeMembershipError {
                err: Some(err),
            })),
        }
    }

    #[test]
    fn forwarded_success() {
        let reply = ProtoChangeMembershipResult {
            result: Some(proto_change_membership_result::Result::Ok(ProtoChangeMembershipSuccess {
                config_index: 4,
            })),
        };
        assert!(convert_change_membership_reply(reply).is_ok());
    }

    #[test]
    fn forwarded_not_leader_without_leader() {
        let reply = reply_err(proto_change_membership_error::Err::NotLeader(ProtoNotLeader {
            leader_id: String::new(),
            leader_address: String::new(),
        }));
        assert!(matches!(convert_change_membership_reply(reply), Err(StoreError::NoLeader)));
    }

    #[test]
    fn forwarded_not_leader_with_leader() {
        let reply = reply_err(proto_change_membership_error::Err::NotLeader(ProtoNotLeader {
            leader_id: String::from("node-2"),
            leader_address: String::from("127.0.0.1:7002"),
        }));
        match convert_change_membership_reply(reply) {
            Err(StoreError::NotLeader(leader)) => {
                assert_eq!(leader.replica_id, "node-2");
                assert_eq!(leader.address, "127.0.0.1:7002");
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn forwarded_change_in_progress_is_retryable() {
        let reply = reply_err(proto_change_membership_error::Err::ChangeInProgress(ProtoChangeInProgress {}));
        let err = convert_change_membership_reply(reply).unwrap_err();
        assert!(matches!(err, StoreError::ChangeInProgress));
        assert!(err.is_retryable());
    }

    #[test]
    fn request_round_trips_remove() {
        let request = convert_change_membership_request(ChangeMembershipInput::RemoveServer {
            replica_id: ReplicaId::new("node-3"),
        });
        match request.change {
            Some(proto_change_membership_req::Change::RemoveServer(remove)) => assert_eq!(remove.replica_id, "node-3"),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn rejected_command_surfaces_store_error() {
        let err = convert_apply_error(ApplyError::Rejected(StoreError::Validation {
            field: "key",
            len: 20,
            max: 16,
        }));
        assert!(matches!(err, StoreError::Validation { .. }));
        assert!(matches!(convert_apply_error(ApplyError::NotLeader(None)), StoreError::NoLeader));
    }
}
