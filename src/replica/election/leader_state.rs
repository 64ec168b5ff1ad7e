use crate::commitlog::Index;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::ReplicaId;
use std::collections::{HashMap, HashSet};

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(super) fn contains(&self, peer_id: &ReplicaId) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(super) fn insert(&mut self, peer_id: ReplicaId, state: PeerState) {
        self.peer_state.insert(peer_id, state);
    }

    /// Stops tracking the peer. Its heartbeat timer stops with it.
    pub(super) fn remove(&mut self, peer_id: &ReplicaId) {
        self.peer_state.remove(peer_id);
    }
}

/// SnapshotTransfer is a chunked InstallSnapshot in flight to a peer whose next entry has already
/// been compacted away.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SnapshotTransfer {
    pub(crate) last_included_index: Index,
    pub(crate) offset: u64,
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    snapshot_transfer: Option<SnapshotTransfer>,

    // A logical clock of this leader's requests to the peer. Replies carry the seq-no of their
    // request, and anything older than the newest reply already handled is dropped.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat: HeartbeatTimerHandle, latest_log_entry_index: Option<Index>) -> Self {
        PeerState {
            heartbeat,
            next: latest_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            snapshot_transfer: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    #[cfg(test)]
    pub(crate) fn snapshot_transfer(&self) -> Option<&SnapshotTransfer> {
        self.snapshot_transfer.as_ref()
    }

    /// Returns the transfer to continue. A transfer of an older snapshot is abandoned and the new
    /// one starts from offset zero.
    pub(crate) fn begin_or_continue_snapshot(&mut self, last_included_index: Index) -> SnapshotTransfer {
        match &self.snapshot_transfer {
            Some(transfer) if transfer.last_included_index == last_included_index => transfer.clone(),
            _ => {
                let transfer = SnapshotTransfer {
                    last_included_index,
                    offset: 0,
                };
                self.snapshot_transfer.replace(transfer.clone());
                transfer
            }
        }
    }

    pub(crate) fn handle_reply(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::debug!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                let replicated_through = match previous_log_entry {
                    None if num_entries_replicated == 0 => return,
                    None => Index::new_usize(num_entries_replicated),
                    Some(prev) => prev.plus(num_entries_replicated as u64),
                };
                self.mark_replicated_through(replicated_through);
            }
            PeerStateUpdate::PeerLogBehind { last_log_entry_index } => {
                self.rewind(logger, last_log_entry_index);
            }
            PeerStateUpdate::SnapshotChunkAccepted {
                last_included_index,
                next_offset,
                done,
            } => {
                if !self.is_transferring(last_included_index) {
                    slog::debug!(logger, "Ignoring reply for abandoned snapshot transfer {:?}", last_included_index);
                } else if done {
                    self.snapshot_transfer = None;
                    self.mark_replicated_through(last_included_index);
                } else if let Some(transfer) = &mut self.snapshot_transfer {
                    transfer.offset = next_offset;
                }
            }
            PeerStateUpdate::SnapshotOffsetMismatch {
                last_included_index,
                expected_offset,
            } => {
                if let Some(transfer) = &mut self.snapshot_transfer {
                    if transfer.last_included_index == last_included_index {
                        transfer.offset = expected_offset;
                    }
                }
            }
        }
    }

    fn is_transferring(&self, last_included_index: Index) -> bool {
        self.snapshot_transfer
            .as_ref()
            .map(|t| t.last_included_index == last_included_index)
            .unwrap_or(false)
    }

    fn mark_replicated_through(&mut self, index: Index) {
        if self.matched.map(|m| m < index).unwrap_or(true) {
            self.matched.replace(index);
        }
        let next = index.plus(1);
        if next > self.next {
            self.next = next;
        }
    }

    fn rewind(&mut self, logger: &slog::Logger, peer_last_index: Option<Index>) {
        // Jump straight past whatever the peer told us it has, but never move forward here.
        let hinted = peer_last_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index);
        let stepped = self.next.checked_minus(1).unwrap_or_else(Index::start_index);
        let new_next = hinted.min(stepped).max(Index::start_index());

        if new_next == self.next {
            slog::warn!(logger, "Can't rewind peer log, already at {:?}", self.next);
            return;
        }
        self.next = new_next;

        // The peer lost entries it once acknowledged (e.g. restarted with an in-memory log).
        if self.matched.map(|m| m >= new_next).unwrap_or(false) {
            self.matched = new_next.checked_minus(1);
        }
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat.reset();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        last_log_entry_index: Option<Index>,
    },
    SnapshotChunkAccepted {
        last_included_index: Index,
        next_offset: u64,
        done: bool,
    },
    SnapshotOffsetMismatch {
        last_included_index: Index,
        expected_offset: u64,
    },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::Term;
    use std::time::Duration;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn peer(latest: Option<u64>) -> (PeerState, ActorClient) {
        let (client, _rx) = ActorClient::new(10);
        let heartbeat = HeartbeatTimerHandle::spawn(
            Duration::from_secs(60),
            client.weak(),
            ReplicaId::new("peer"),
            Term::new(1),
        );
        (PeerState::new(heartbeat, latest.map(Index::new)), client)
    }

    fn send(peer: &mut PeerState, update: PeerStateUpdate) {
        let seq_no = peer.next_seq_no();
        peer.handle_reply(&logger(), seq_no, update);
    }

    #[tokio::test]
    async fn success_moves_next_and_matched() {
        let (mut peer, _client) = peer(Some(5));
        assert_eq!(peer.next_and_previous_log_index(), (Index::new(6), Some(Index::new(5))));

        send(
            &mut peer,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 2,
            },
        );
        assert_eq!(peer.matched(), Some(Index::new(7)));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(8));

        // Empty heartbeat with no previous entry changes nothing.
        send(
            &mut peer,
            PeerStateUpdate::Success {
                previous_log_entry: None,
                num_entries_replicated: 0,
            },
        );
        assert_eq!(peer.matched(), Some(Index::new(7)));
    }

    #[tokio::test]
    async fn stale_replies_are_dropped() {
        let (mut peer, _client) = peer(Some(5));
        let first = peer.next_seq_no();
        let second = peer.next_seq_no();
        assert!(peer.has_outstanding_request());

        peer.handle_reply(
            &logger(),
            second,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 3,
            },
        );
        peer.handle_reply(
            &logger(),
            first,
            PeerStateUpdate::PeerLogBehind {
                last_log_entry_index: None,
            },
        );
        assert_eq!(peer.matched(), Some(Index::new(8)));
        assert!(!peer.has_outstanding_request());
    }

    #[tokio::test]
    async fn rewind_uses_peer_hint() {
        let (mut peer, _client) = peer(Some(20));

        send(
            &mut peer,
            PeerStateUpdate::PeerLogBehind {
                last_log_entry_index: Some(Index::new(4)),
            },
        );
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(5));

        // A hint past our own position only steps back by one.
        send(
            &mut peer,
            PeerStateUpdate::PeerLogBehind {
                last_log_entry_index: Some(Index::new(30)),
            },
        );
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(4));

        send(
            &mut peer,
            PeerStateUpdate::PeerLogBehind {
                last_log_entry_index: None,
            },
        );
        assert_eq!(peer.next_and_previous_log_index(), (Index::start_index(), None));
    }

    #[tokio::test]
    async fn snapshot_transfer_progress() {
        let (mut peer, _client) = peer(Some(50));
        let transfer = peer.begin_or_continue_snapshot(Index::new(40));
        assert_eq!(transfer.offset, 0);

        send(
            &mut peer,
            PeerStateUpdate::SnapshotChunkAccepted {
                last_included_index: Index::new(40),
                next_offset: 1024,
                done: false,
            },
        );
        assert_eq!(peer.begin_or_continue_snapshot(Index::new(40)).offset, 1024);

        send(
            &mut peer,
            PeerStateUpdate::SnapshotOffsetMismatch {
                last_included_index: Index::new(40),
                expected_offset: 0,
            },
        );
        assert_eq!(peer.snapshot_transfer().unwrap().offset, 0);

        send(
            &mut peer,
            PeerStateUpdate::SnapshotChunkAccepted {
                last_included_index: Index::new(40),
                next_offset: 2048,
                done: true,
            },
        );
        assert!(peer.snapshot_transfer().is_none());
        assert_eq!(peer.matched(), Some(Index::new(40)));
        assert_eq!(peer.next_and_previous_log_index().0, Index::new(51));
    }

    #[tokio::test]
    async fn newer_snapshot_restarts_transfer() {
        let (mut peer, _client) = peer(Some(50));
        peer.begin_or_continue_snapshot(Index::new(40));
        send(
            &mut peer,
            PeerStateUpdate::SnapshotChunkAccepted {
                last_included_index: Index::new(40),
                next_offset: 512,
                done: false,
            },
        );

        let restarted = peer.begin_or_continue_snapshot(Index::new(48));
        assert_eq!(restarted.offset, 0);
        assert_eq!(restarted.last_included_index, Index::new(48));
    }
}
