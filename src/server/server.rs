use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_change_membership_error,
    proto_change_membership_req, proto_change_membership_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoChangeInProgress,
    ProtoChangeMembershipError, ProtoChangeMembershipReq, ProtoChangeMembershipResult, ProtoChangeMembershipSuccess,
    ProtoClientStaleTerm, ProtoInstallSnapshotError, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoInstallSnapshotSuccess, ProtoNotCommitted, ProtoNotLeader, ProtoRequestVoteError, ProtoRequestVoteReq,
    ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault, ProtoServerMissingPreviousLog,
    ProtoUnexpectedSnapshotOffset,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, ChangeMembershipError,
    ChangeMembershipInput, ChangeMembershipOutput, ClusterConfig, EntryKind, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    Term,
};
use crate::server::RpcServerShutdownSignal;
use crate::transport::StreamLayer;
use bytes::Bytes;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    /// Serves until the shutdown signal fires. Every connection comes from `stream_layer`, so every
    /// caller has already been authenticated.
    pub(crate) async fn run(self, stream_layer: Arc<StreamLayer>, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", stream_layer.local_addr());

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_incoming_shutdown(stream_layer.clone().incoming(), shutdown_signal)
            .await;

        stream_layer.close();
        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let vote_granted = match app_result {
            Ok(ok) => ok.vote_granted,
            // The candidate learns our term from the next leader's AppendEntries, so both of these
            // are a plain "no".
            Err(RequestVoteError::CandidateNotInCluster) | Err(RequestVoteError::RequestTermOutOfDate(_)) => false,
            Err(RequestVoteError::ServerIoError(_)) => {
                return Self::request_vote_fault("Local IO failure");
            }
            Err(RequestVoteError::ActorExited) => {
                return Self::request_vote_fault("Server internal replica task has exited");
            }
        };

        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                vote_granted,
            })),
        }
    }

    fn request_vote_fault(message: &str) -> ProtoRequestVoteResult {
        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                    message: message.to_string(),
                })),
            })),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let leader_commit_index = Index::from_u64(rpc_request.commit_index);

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            let kind = EntryKind::from_proto(proto_entry.kind)
                .ok_or_else(|| Status::invalid_argument(format!("Unknown log entry kind {}", proto_entry.kind)))?;
            new_entries.push(AppendEntriesLogEntry {
                term: Term::new(proto_entry.term),
                kind,
                data: Bytes::from(proto_entry.data),
            })
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_address: rpc_request.client_address,
            leader_previous_log_entry,
            leader_commit_index,
            new_entries,
        })
    }

    // Term 0 only ever belongs to the bootstrap config entry at index 1.
    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (_, 0) if log_entry_term != 0 => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (_, 0) => Ok(None),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        // Empty
                    })),
                }
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_entry_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: last_log_entry_index.map(|i| i.as_u64()).unwrap_or(0),
                })
            }
            Err(AppendEntriesError::ServerIoError(_)) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Local IO failure".to_string(),
            }),
            Err(AppendEntriesError::ActorExited) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = Self::convert_install_snapshot_input(rpc_request)?;
        let app_result = self.local_replica.install_snapshot(app_input).await;
        let rpc_reply = Self::convert_install_snapshot_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_install_snapshot_input(rpc_request: ProtoInstallSnapshotReq) -> Result<InstallSnapshotInput, Status> {
        let last_included_index = Index::from_u64(rpc_request.last_included_index)
            .ok_or_else(|| Status::invalid_argument("LastIncludedIndex must be non-0"))?;
        let config = rpc_request
            .last_included_config
            .map(ClusterConfig::from_proto)
            .ok_or_else(|| Status::invalid_argument("LastIncludedConfig is required"))?;

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_address: rpc_request.client_address,
            last_included_index,
            last_included_term: Term::new(rpc_request.last_included_term),
            config,
            offset: rpc_request.offset,
            data: Bytes::from(rpc_request.data),
            done: rpc_request.done,
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                        // Empty
                    })),
                }
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(InstallSnapshotError::UnexpectedOffset { expected }) => {
                proto_install_snapshot_error::Err::UnexpectedOffset(ProtoUnexpectedSnapshotOffset {
                    expected_offset: expected,
                })
            }
            Err(InstallSnapshotError::ServerFault(message)) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault { message })
            }
            Err(InstallSnapshotError::ActorExited) => proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        }
    }

    async fn handle_change_membership(
        &self,
        rpc_request: ProtoChangeMembershipReq,
    ) -> Result<ProtoChangeMembershipResult, Status> {
        let app_input = Self::convert_change_membership_input(rpc_request)?;
        let app_result = self.local_replica.change_membership(app_input).await;
        let rpc_reply = Self::convert_change_membership_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_change_membership_input(rpc_request: ProtoChangeMembershipReq) -> Result<ChangeMembershipInput, Status> {
        match rpc_request.change {
            Some(proto_change_membership_req::Change::AddVoter(add)) => Ok(ChangeMembershipInput::AddVoter {
                replica_id: ReplicaId::new(add.replica_id),
                address: add.address,
            }),
            Some(proto_change_membership_req::Change::RemoveServer(remove)) => {
                Ok(ChangeMembershipInput::RemoveServer {
                    replica_id: ReplicaId::new(remove.replica_id),
                })
            }
            None => Err(Status::invalid_argument("Missing membership change")),
        }
    }

    fn convert_change_membership_result(
        app_result: Result<ChangeMembershipOutput, ChangeMembershipError>,
    ) -> ProtoChangeMembershipResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoChangeMembershipResult {
                    result: Some(proto_change_membership_result::Result::Ok(ProtoChangeMembershipSuccess {
                        config_index: ok.config_index.map(|i| i.as_u64()).unwrap_or(0),
                    })),
                }
            }
            Err(ChangeMembershipError::NotLeader(leader)) => {
                let (leader_id, leader_address) = match leader {
                    Some(leader) => (leader.replica_id.into_inner(), leader.address),
                    None => (String::new(), String::new()),
                };
                proto_change_membership_error::Err::NotLeader(ProtoNotLeader {
                    leader_id,
                    leader_address,
                })
            }
            Err(ChangeMembershipError::ChangeInProgress) => {
                proto_change_membership_error::Err::ChangeInProgress(ProtoChangeInProgress {})
            }
            Err(ChangeMembershipError::NotCommitted(message)) => {
                proto_change_membership_error::Err::NotCommitted(ProtoNotCommitted { message })
            }
            Err(ChangeMembershipError::Invalid(message)) => {
                proto_change_membership_error::Err::ServerFault(ProtoServerFault { message })
            }
            Err(ChangeMembershipError::LocalIoError(_)) => {
                proto_change_membership_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                })
            }
            Err(ChangeMembershipError::ActorExited) => {
                proto_change_membership_error::Err::ServerFault(ProtoServerFault {
                    message: "Server internal replica task has exited".to_string(),
                })
            }
        };

        ProtoChangeMembershipResult {
            result: Some(proto_change_membership_result::Result::Err(ProtoChangeMembershipError {
                err: Some(err),
            })),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot(from={}, index={}, offset={}, len={}, done={})",
            rpc_request.client_node_id,
            rpc_request.last_included_index,
            rpc_request.offset,
            rpc_request.data.len(),
            rpc_request.done
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn change_membership(
        &self,
        rpc_request_wrapped: Request<ProtoChangeMembershipReq>,
    ) -> Result<Response<ProtoChangeMembershipResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_change_membership(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{ProtoAddVoter, ProtoLogEntry};

    #[test]
    fn previous_entry_metadata() {
        assert_eq!(RpcServer::convert_log_entry_metadata(0, 0).unwrap(), None);
        // Bootstrap config entry.
        assert_eq!(
            RpcServer::convert_log_entry_metadata(0, 1).unwrap(),
            Some((Term::new(0), Index::new(1)))
        );
        assert!(RpcServer::convert_log_entry_metadata(3, 0).is_err());
    }

    #[test]
    fn append_entries_rejects_unknown_kind() {
        let request = ProtoAppendEntriesReq {
            client_node_id: "leader".into(),
            term: 2,
            commit_index: 0,
            previous_log_entry_term: 0,
            previous_log_entry_index: 0,
            new_entries: vec![ProtoLogEntry {
                term: 2,
                data: vec![],
                kind: 42,
            }],
            client_address: "127.0.0.1:1".into(),
        };
        assert!(RpcServer::convert_append_entries_input(request).is_err());
    }

    #[test]
    fn missing_log_reports_zero_for_empty() {
        let reply = RpcServer::convert_append_entries_result(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
            last_log_entry_index: None,
        }));
        assert!(matches!(
            reply.result,
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: 0
                }))
            }))
        ));
    }

    #[test]
    fn change_membership_round_trip() {
        let input = RpcServer::convert_change_membership_input(ProtoChangeMembershipReq {
            change: Some(proto_change_membership_req::Change::AddVoter(ProtoAddVoter {
                replica_id: "n2".into(),
                address: "127.0.0.1:2".into(),
            })),
        })
        .unwrap();
        assert_eq!(
            input,
            ChangeMembershipInput::AddVoter {
                replica_id: ReplicaId::new("n2"),
                address: "127.0.0.1:2".into(),
            }
        );

        let reply = RpcServer::convert_change_membership_result(Err(ChangeMembershipError::NotLeader(None)));
        match reply.result {
            Some(proto_change_membership_result::Result::Err(ProtoChangeMembershipError {
                err: Some(proto_change_membership_error::Err::NotLeader(not_leader)),
            })) => assert!(not_leader.leader_id.is_empty()),
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    #[test]
    fn snapshot_chunk_needs_config() {
        let request = ProtoInstallSnapshotReq {
            client_node_id: "leader".into(),
            term: 2,
            client_address: "127.0.0.1:1".into(),
            last_included_index: 10,
            last_included_term: 2,
            last_included_config: None,
            offset: 0,
            data: vec![1, 2, 3],
            done: true,
        };
        assert!(RpcServer::convert_install_snapshot_input(request).is_err());
    }
}
