use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::grpc::{proto_request_vote_error, proto_request_vote_result, ProtoRequestVoteReq};
use crate::replica::peer_client::RaftClient;
use crate::replica::replica::Replica;
use crate::replica::{
    ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult,
    Term, TermOutOfDateInfo, WriteAheadLogEntry,
};
use std::time::Duration;

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member. An empty config means we haven't caught up yet.
        let config = self.cluster_tracker.latest_config();
        if !config.is_empty() && !config.contains(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        // > if a server receives a RequestVote request within the minimum election timeout of
        // > hearing from a current leader, it does not update its term or grant its vote
        if self.has_live_leader() {
            slog::info!(
                self.logger,
                "Not granting vote to {:?}. We have a live leader.",
                input.candidate_id
            );
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        if self
            .observe_term(input.candidate_term)
            .map_err(RequestVoteError::ServerIoError)?
        {
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Election state: {:?}",
                self.election_state
            );
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        let (_, opt_voted_for) = self.local_state.voted_for_current_term();
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // ...grant vote
        slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RequestVoteError::ServerIoError)?;

        if cas_success {
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput { vote_granted: true });
        }

        // The vote was already recorded, e.g. the candidate retried. Grant it again if it went to
        // the same candidate in the same term.
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && *reread_voted_for == input.candidate_id {
                return Ok(RequestVoteOutput { vote_granted: true });
            }
        }

        slog::info!(self.logger, "Not granting vote. Vote state changed underneath us.");
        Ok(RequestVoteOutput { vote_granted: false })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.wal.latest_entry(), candidate_last_entry) {
            (None, None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term > my_last_entry_term {
                    return true;
                } else if candidate_last_entry_term < my_last_entry_term {
                    return false;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        if self.election_state.is_leader() {
            slog::debug!(self.logger, "Ignoring follower timeout as leader");
            return;
        }
        if !self.cluster_tracker.am_i_voter() {
            slog::debug!(self.logger, "Not a voter, so not starting an election");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist new term, not starting election: {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        if 1 >= Self::get_majority_vote_count(self.cluster_tracker.num_voting_replicas()) {
            self.become_leader(new_term);
            return;
        }

        for peer in self.cluster_tracker.iter_peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                peer.client.clone(),
                peer.replica_id.clone(),
                self.new_request_vote_request(new_term),
                self.options.append_entries_timeout,
                self.actor_client.clone(),
                new_term,
                None,
            ));
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to a election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_voting_replicas,
                    reply.term,
                );

                if num_votes_received >= Self::get_majority_vote_count(num_voting_replicas) {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                if !self.election_state.is_candidate() {
                    return;
                }
                match self.cluster_tracker.peer(&reply.peer_id) {
                    Some(peer) => {
                        tokio::task::spawn(Self::call_peer_request_vote(
                            self.logger.clone(),
                            peer.client.clone(),
                            peer.replica_id.clone(),
                            self.new_request_vote_request(reply.term),
                            self.options.append_entries_timeout,
                            self.actor_client.clone(),
                            reply.term,
                            Some(self.options.leader_heartbeat_duration),
                        ));
                    }
                    None => slog::info!(
                        self.logger,
                        "Peer {:?} left the cluster, not retrying RequestVote",
                        reply.peer_id
                    ),
                }
            }
        }
    }

    fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
        (num_voting_replicas / 2) + 1
    }

    fn become_leader(&mut self, term: Term) {
        self.election_state.transition_to_leader(
            term,
            self.cluster_tracker.peer_ids(),
            self.wal.latest_entry().map(|(_, index)| index),
        );
        slog::info!(self.logger, "Won election for term {:?}", term);

        // > [a leader] commit[s] a blank no-op entry into the log at the start of its term
        match self.wal.append(WriteAheadLogEntry::noop(term)) {
            Ok(_) => self.after_leader_append(),
            Err(e) => {
                slog::error!(self.logger, "Failed to append no-op as new leader: {:?}", e);
                self.step_down(None);
            }
        }
    }

    fn new_request_vote_request(&self, term: Term) -> ProtoRequestVoteReq {
        let (last_log_entry_term, last_log_entry_index) = match self.wal.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        ProtoRequestVoteReq {
            client_node_id: self.my_replica_id.clone().into_inner(),
            term: term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        peer_client: RaftClient,
        peer_id: ReplicaId,
        rpc_request: ProtoRequestVoteReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        term: Term,
        delay: Option<Duration>,
    ) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.request_vote(rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_result = match rpc_reply {
            Ok(Ok(rpc_result)) => match rpc_result.result {
                Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                    if success_reply.vote_granted {
                        RequestVoteResult::VoteGranted
                    } else {
                        RequestVoteResult::VoteNotGranted
                    }
                }
                Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                    Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                        slog::warn!(logger, "RequestVote Service Fault: {:?}", fault.message);
                        RequestVoteResult::RetryableFailure
                    }
                    None => RequestVoteResult::MalformedReply,
                },
                None => RequestVoteResult::MalformedReply,
            },
            Ok(Err(rpc_status)) => {
                slog::warn!(logger, "Un-modeled failure from RequestVote RPC call: {:?}", rpc_status);
                RequestVoteResult::RetryableFailure
            }
            Err(_timeout) => {
                slog::warn!(logger, "Timed out calling RequestVote");
                RequestVoteResult::RetryableFailure
            }
        };

        let callback_input = RequestVoteReplyFromPeer {
            peer_id,
            term,
            result: callback_result,
        };

        // Nothing to do if the actor is gone.
        let _ = callback.notify_request_vote_reply_from_peer(callback_input).await;
    }
}
