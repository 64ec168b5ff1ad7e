use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq,
    ProtoInstallSnapshotResult, ProtoLogEntry,
};
use crate::replica::election::PeerStateUpdate;
use crate::replica::peer_client::RaftClient;
use crate::replica::replica::Replica;
use crate::replica::{
    AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError,
    InstallSnapshotReplyFromPeer, InstallSnapshotReplyFromPeerDescriptor, InstallSnapshotReplyFromPeerError,
    LeaderTimerTick, ReplicaId, Term, WriteAheadLogEntry,
};
use std::time::Duration;
use std::{cmp, io};
use tokio::time::error::Elapsed;
use tonic::Status;

enum ReplicateError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    UnknownPeer,
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
    MissingSnapshot(Index),
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn handle_leader_timer(&mut self, input: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != input.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                input.term,
                current_term
            );
            return;
        }

        self.try_replicate_to_peer(&input.peer_id);
    }

    /// Runs after the leader appends to its own log: commit what we can, and push the new entries
    /// to peers without waiting for their heartbeats.
    pub(super) fn after_leader_append(&mut self) {
        self.try_advance_leader_commit_index();
        for peer_id in self.cluster_tracker.peer_ids() {
            self.try_replicate_to_peer(&peer_id);
        }
    }

    /// Sends the peer whatever it needs next: a batch of entries (possibly empty, as a heartbeat),
    /// or the next snapshot chunk if its next entry was compacted away.
    pub(super) fn try_replicate_to_peer(&mut self, peer_id: &ReplicaId) {
        match self.try_replicate_to_peer_impl(peer_id) {
            Ok(_) => {}
            Err(ReplicateError::NoLongerLeader) => {
                slog::debug!(self.logger, "Not replicating to {:?}, no longer leader", peer_id)
            }
            Err(ReplicateError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {:?} already outstanding", peer_id)
            }
            Err(ReplicateError::UnknownPeer) => {
                slog::debug!(self.logger, "Peer {:?} is no longer in the cluster", peer_id)
            }
            Err(ReplicateError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, ioe);
            }
            Err(ReplicateError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "Wtf! LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
            Err(ReplicateError::MissingSnapshot(index)) => {
                slog::error!(
                    self.logger,
                    "Entry {:?} was compacted, but there's no snapshot to send instead",
                    index
                );
            }
        }
    }

    fn try_replicate_to_peer_impl(&mut self, peer_id: &ReplicaId) -> Result<(), ReplicateError> {
        let peer = self
            .cluster_tracker
            .peer(peer_id)
            .cloned()
            .ok_or(ReplicateError::UnknownPeer)?;
        let current_term = self.local_state.current_term();

        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(ReplicateError::NoLongerLeader)?;
        let peer_state = leader_state
            .peer_state_mut(peer_id)
            .ok_or(ReplicateError::UnknownPeer)?;

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. Entries are still batched.
        if peer_state.has_outstanding_request() {
            return Err(ReplicateError::PeerConcurrencyThrottle);
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let my_id = self.my_replica_id.clone().into_inner();
        let my_address = self.cluster_tracker.my_address().to_string();

        if self.wal.is_compacted(next_index) {
            let snapshot = self
                .current_snapshot
                .as_ref()
                .ok_or(ReplicateError::MissingSnapshot(next_index))?;

            let transfer = peer_state.begin_or_continue_snapshot(snapshot.meta.last_included_index());
            let len = snapshot.data.len() as u64;
            let start = cmp::min(transfer.offset, len);
            let end = cmp::min(start + self.options.snapshot_chunk_size as u64, len);
            let done = end == len;

            let descriptor = InstallSnapshotReplyFromPeerDescriptor {
                peer_id: peer_id.clone(),
                term: current_term,
                seq_no: peer_state.next_seq_no(),
                last_included_index: transfer.last_included_index,
                offset: start,
                len: end - start,
                done,
            };
            let rpc_request = ProtoInstallSnapshotReq {
                client_node_id: my_id,
                term: current_term.as_u64(),
                client_address: my_address,
                last_included_index: transfer.last_included_index.as_u64(),
                last_included_term: snapshot.meta.last_included_term.as_u64(),
                last_included_config: Some(snapshot.meta.config.to_proto()),
                offset: start,
                data: snapshot.data.slice(start as usize..end as usize).to_vec(),
                done,
            };

            tokio::task::spawn(Self::call_peer_install_snapshot(
                self.logger.new(slog::o!("Peer" => peer_id.as_str().to_string())),
                peer.client,
                rpc_request,
                self.options.append_entries_timeout,
                self.actor_client.clone(),
                descriptor,
            ));
            peer_state.reset_heartbeat_timer();
            return Ok(());
        }

        let previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match self.wal.term_at(previous_index) {
                Ok(Some(term)) => Some((term, previous_index)),
                Ok(None) => return Err(ReplicateError::UnexpectedMissingLogEntry(previous_index)),
                Err(e) => return Err(ReplicateError::DiskRead(previous_index, e)),
            },
        };

        let mut new_entries = Vec::new();
        let mut index = next_index;
        while new_entries.len() < self.options.max_entries_per_append {
            match self.wal.read(index) {
                Ok(Some(entry)) => new_entries.push(entry),
                Ok(None) => break,
                Err(e) => return Err(ReplicateError::DiskRead(index, e)),
            }
            index = index.plus(1);
        }

        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_id.clone(),
            term: current_term,
            seq_no: peer_state.next_seq_no(),
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        };
        let rpc_request = build_append_entries_request(
            current_term,
            my_id,
            my_address,
            previous_log_entry,
            self.wal.commit_index(),
            new_entries,
        );

        tokio::task::spawn(Self::call_peer_append_entries(
            self.logger.new(slog::o!("Peer" => peer_id.as_str().to_string())),
            peer.client,
            rpc_request,
            self.options.append_entries_timeout,
            self.actor_client.clone(),
            descriptor,
        ));
        peer_state.reset_heartbeat_timer();

        Ok(())
    }

    /// Whether the peer is missing entries we have, including ones only a snapshot can give it.
    fn peer_is_behind(&self, peer_id: &ReplicaId) -> bool {
        let peer_state = match self
            .election_state
            .leader_state()
            .and_then(|leader_state| leader_state.peer_state(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return false,
        };
        let (next_index, _) = peer_state.next_and_previous_log_index();
        matches!(self.wal.latest_entry(), Some((_, last_index)) if last_index >= next_index)
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.descriptor.peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                match self.observe_term(new_term) {
                    Ok(true) => return,
                    Ok(false) => {
                        slog::warn!(logger, "Peer sent StaleTerm without a newer term. Treating as generic failure.");
                        PeerStateUpdate::OtherError
                    }
                    Err(e) => {
                        slog::error!(logger, "Failed to persist newer term: {:?}", e);
                        PeerStateUpdate::OtherError
                    }
                }
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_entry_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer's last entry: {:?}", last_log_entry_index);
                PeerStateUpdate::PeerLogBehind { last_log_entry_index }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => {
                slog::debug!(logger, "Successful AE reply");
                PeerStateUpdate::Success {
                    previous_log_entry: reply.descriptor.previous_log_entry_index,
                    num_entries_replicated: reply.descriptor.num_log_entries,
                }
            }
        };

        let descriptor = reply.descriptor;
        self.handle_peer_state_update(&logger, descriptor.peer_id, descriptor.term, descriptor.seq_no, update);
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.descriptor.peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "InstallSnapshot reply from peer result: {:?}", reply.result);

        let descriptor = reply.descriptor;
        let update = match reply.result {
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) => match self.observe_term(new_term) {
                Ok(true) => return,
                Ok(false) => PeerStateUpdate::OtherError,
                Err(e) => {
                    slog::error!(logger, "Failed to persist newer term: {:?}", e);
                    PeerStateUpdate::OtherError
                }
            },
            Err(InstallSnapshotReplyFromPeerError::UnexpectedOffset { expected }) => {
                slog::info!(logger, "Peer expects snapshot offset {}", expected);
                PeerStateUpdate::SnapshotOffsetMismatch {
                    last_included_index: descriptor.last_included_index,
                    expected_offset: expected,
                }
            }
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "InstallSnapshot failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => {
                if descriptor.done {
                    slog::info!(logger, "Peer installed snapshot through {:?}", descriptor.last_included_index);
                }
                PeerStateUpdate::SnapshotChunkAccepted {
                    last_included_index: descriptor.last_included_index,
                    next_offset: descriptor.offset + descriptor.len,
                    done: descriptor.done,
                }
            }
        };

        self.handle_peer_state_update(&logger, descriptor.peer_id, descriptor.term, descriptor.seq_no, update);
    }

    fn handle_peer_state_update(
        &mut self,
        logger: &slog::Logger,
        peer_id: ReplicaId,
        term: Term,
        seq_no: u64,
        update: PeerStateUpdate,
    ) {
        let current_term = self.local_state.current_term();
        if current_term != term {
            slog::info!(
                logger,
                "Received reply for outdated term {:?}, but we're on term {:?}",
                term,
                current_term
            );
            return;
        }

        // 1. Update peer log tracker
        let retry_now = !matches!(update, PeerStateUpdate::OtherError);
        match self
            .election_state
            .leader_state_mut()
            .map(|leader_state| leader_state.peer_state_mut(&peer_id))
        {
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
            Some(None) => {
                slog::info!(logger, "Peer {:?} is no longer tracked", peer_id);
                return;
            }
            Some(Some(peer_state)) => peer_state.handle_reply(logger, seq_no, update),
        }

        // 2. Check for majority replication and apply new commits.
        self.try_advance_leader_commit_index();

        // 3. Keep going while the peer is behind. Failures wait for the next heartbeat.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if retry_now && self.peer_is_behind(&peer_id) {
            self.try_replicate_to_peer(&peer_id);
        }
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// See also:
    /// > Figure 8: A time sequence showing why a leader cannot determine
    /// > commitment using log entries from older terms.
    pub(super) fn try_advance_leader_commit_index(&mut self) {
        let voters_matched_index = {
            let leader_state = match self.election_state.leader_state() {
                Some(leader_state) => leader_state,
                None => return,
            };
            let config = self.cluster_tracker.latest_config();
            let mut matched: Vec<Option<Index>> = config
                .iter()
                .filter(|(id, _)| **id != self.my_replica_id)
                .map(|(id, _)| leader_state.peer_state(id).and_then(|peer_state| peer_state.matched()))
                .collect();
            // Our own log is always as long as any peer's.
            if config.contains(&self.my_replica_id) {
                matched.push(self.wal.latest_entry().map(|(_, index)| index));
            }
            matched
        };

        let tentative_new_commit_index = match Self::get_cluster_commit_index(voters_matched_index) {
            Some(index) => index,
            None => return,
        };
        match self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            Ok(true) => self.apply_committed_entries(),
            Ok(false) => {}
            Err(ioe) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                ioe
            ),
        }
    }

    /// Highest index that a majority of voters have. Empty means no voters, so nothing commits.
    pub(super) fn get_cluster_commit_index(mut voters_matched_index: Vec<Option<Index>>) -> Option<Index> {
        if voters_matched_index.is_empty() {
            return None;
        }
        voters_matched_index.sort_by_key(|matched| match matched {
            None => 0u64,
            Some(m) => m.as_u64(),
        });

        // Everything from `quorum_idx` onwards is a majority of voters, all of which have at least
        // the entry at `quorum_idx`.
        let majority = (voters_matched_index.len() / 2) + 1;
        let quorum_idx = voters_matched_index.len() - majority;

        voters_matched_index.remove(quorum_idx)
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer_client: RaftClient,
        rpc_request: ProtoAppendEntriesReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.append_entries(rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_input = AppendEntriesReplyFromPeer {
            descriptor,
            result: convert_append_entries_rpc_reply(rpc_reply),
        };

        let _ = callback.notify_append_entries_reply_from_peer(callback_input).await;
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        peer_client: RaftClient,
        rpc_request: ProtoInstallSnapshotReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: InstallSnapshotReplyFromPeerDescriptor,
    ) {
        slog::debug!(
            logger,
            "ClientWire - InstallSnapshot(index={}, offset={}, len={}, done={})",
            rpc_request.last_included_index,
            rpc_request.offset,
            rpc_request.data.len(),
            rpc_request.done
        );
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.install_snapshot(rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let callback_input = InstallSnapshotReplyFromPeer {
            descriptor,
            result: convert_install_snapshot_rpc_reply(rpc_reply),
        };

        let _ = callback.notify_install_snapshot_reply_from_peer(callback_input).await;
    }
}

// This is the infallible parts of creating the request object.
fn build_append_entries_request(
    current_term: Term,
    my_id: String,
    my_address: String,
    previous_log_entry_metadata: Option<(Term, Index)>,
    commit_index: Option<Index>,
    new_entries: Vec<WriteAheadLogEntry>,
) -> ProtoAppendEntriesReq {
    let commit_index_u64 = match commit_index {
        None => 0,
        Some(ci) => ci.as_u64(),
    };

    let (previous_log_entry_term_u64, previous_log_entry_index_u64) = match previous_log_entry_metadata {
        None => (0, 0),
        Some((term, idx)) => (term.as_u64(), idx.as_u64()),
    };

    let new_entries = new_entries
        .into_iter()
        .map(|entry| ProtoLogEntry {
            term: entry.term.as_u64(),
            kind: entry.kind.to_proto(),
            data: entry.data,
        })
        .collect();

    ProtoAppendEntriesReq {
        client_node_id: my_id,
        term: current_term.as_u64(),
        commit_index: commit_index_u64,
        previous_log_entry_term: previous_log_entry_term_u64,
        previous_log_entry_index: previous_log_entry_index_u64,
        new_entries,
        client_address: my_address,
    }
}

fn convert_append_entries_rpc_reply(
    rpc_reply: Result<Result<ProtoAppendEntriesResult, Status>, Elapsed>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.result {
            Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
            Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                Some(proto_append_entries_error::Err::ServerFault(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                        "Explicit server fault: {:?}",
                        payload.message
                    )))
                }
                Some(proto_append_entries_error::Err::StaleTerm(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                        last_log_entry_index: Index::from_u64(payload.last_log_entry_index),
                    })
                }
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed AppendEntries Err".into(),
                )),
            },
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed AppendEntries Result".into(),
            )),
        },
        Ok(Err(rpc_status)) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(format!(
            "Un-modeled failure from AppendEntries RPC call: {:?}",
            rpc_status
        ))),
        Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            "Timed out calling AppendEntries".into(),
        )),
    }
}

fn convert_install_snapshot_rpc_reply(
    rpc_reply: Result<Result<ProtoInstallSnapshotResult, Status>, Elapsed>,
) -> Result<(), InstallSnapshotReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.result {
            Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(()),
            Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
                Some(proto_install_snapshot_error::Err::ServerFault(payload)) => {
                    Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
                        "Explicit server fault: {:?}",
                        payload.message
                    )))
                }
                Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => {
                    Err(InstallSnapshotReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                Some(proto_install_snapshot_error::Err::UnexpectedOffset(payload)) => {
                    Err(InstallSnapshotReplyFromPeerError::UnexpectedOffset {
                        expected: payload.expected_offset,
                    })
                }
                None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                    "Malformed InstallSnapshot Err".into(),
                )),
            },
            None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                "Malformed InstallSnapshot Result".into(),
            )),
        },
        Ok(Err(rpc_status)) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
            "Un-modeled failure from InstallSnapshot RPC call: {:?}",
            rpc_status
        ))),
        Err(_timeout) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
            "Timed out calling InstallSnapshot".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{
        ProtoAppendEntriesError, ProtoInstallSnapshotError, ProtoServerMissingPreviousLog, ProtoUnexpectedSnapshotOffset,
    };
    use crate::replica::EntryKind;

    #[test]
    fn request_carries_batch_and_prev() {
        let request = build_append_entries_request(
            Term::new(3),
            "a".into(),
            "127.0.0.1:1".into(),
            Some((Term::new(2), Index::new(4))),
            Some(Index::new(4)),
            vec![WriteAheadLogEntry::noop(Term::new(3)), WriteAheadLogEntry::command(Term::new(3), vec![1])],
        );

        assert_eq!(request.previous_log_entry_index, 4);
        assert_eq!(request.previous_log_entry_term, 2);
        assert_eq!(request.commit_index, 4);
        assert_eq!(request.new_entries.len(), 2);
        assert_eq!(EntryKind::from_proto(request.new_entries[0].kind), Some(EntryKind::Noop));
        assert_eq!(request.new_entries[1].data, vec![1]);

        let empty = build_append_entries_request(Term::new(1), "a".into(), "x".into(), None, None, Vec::new());
        assert_eq!((empty.previous_log_entry_index, empty.commit_index), (0, 0));
    }

    #[test]
    fn missing_log_hint_survives_the_wire() {
        let reply = ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: 0,
                })),
            })),
        };
        assert!(matches!(
            convert_append_entries_rpc_reply(Ok(Ok(reply))),
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                last_log_entry_index: None
            })
        ));

        let reply = ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(proto_install_snapshot_error::Err::UnexpectedOffset(
                    ProtoUnexpectedSnapshotOffset { expected_offset: 32 },
                )),
            })),
        };
        assert!(matches!(
            convert_install_snapshot_rpc_reply(Ok(Ok(reply))),
            Err(InstallSnapshotReplyFromPeerError::UnexpectedOffset { expected: 32 })
        ));

        let status = Status::unavailable("down");
        assert!(matches!(
            convert_append_entries_rpc_reply(Ok(Err(status))),
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(_))
        ));
    }
}
