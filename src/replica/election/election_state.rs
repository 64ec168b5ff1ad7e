use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, LeaderRedirectInfo, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// Who this replica currently believes is leader.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.actor_client.clone()));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone());
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        latest_log_entry_index: Option<Index>,
    ) {
        let mut tracker = LeaderStateTracker::new(HashMap::with_capacity(peer_ids.len()));
        for peer_id in peer_ids {
            let state = self.new_peer_state(term, peer_id.clone(), latest_log_entry_index);
            tracker.insert(peer_id, state);
        }

        self.state = State::Leader(LeaderState { term, tracker });
        self.notify_new_state();
    }

    /// Brings the leader's peer tracking in line with the latest cluster config. New peers start
    /// from `latest_log_entry_index` and get an immediate heartbeat. No-op unless leader.
    pub(crate) fn sync_leader_peers(&mut self, peer_ids: &HashSet<ReplicaId>, latest_log_entry_index: Option<Index>) {
        let term = match &self.state {
            State::Leader(ls) => ls.term,
            _ => return,
        };

        let mut added = Vec::new();
        if let State::Leader(ls) = &self.state {
            for peer_id in peer_ids {
                if !ls.tracker.contains(peer_id) {
                    added.push(peer_id.clone());
                }
            }
        }
        let added: Vec<(ReplicaId, PeerState)> = added
            .into_iter()
            .map(|peer_id| {
                let state = self.new_peer_state(term, peer_id.clone(), latest_log_entry_index);
                (peer_id, state)
            })
            .collect();

        if let State::Leader(ls) = &mut self.state {
            for stale in ls.tracker.peer_ids().difference(peer_ids) {
                ls.tracker.remove(stale);
            }
            for (peer_id, state) in added {
                ls.tracker.insert(peer_id, state);
            }
        }
    }

    fn new_peer_state(&self, term: Term, peer_id: ReplicaId, latest_log_entry_index: Option<Index>) -> PeerState {
        let heartbeat = HeartbeatTimerHandle::spawn(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            peer_id,
            term,
        );
        PeerState::new(heartbeat, latest_log_entry_index)
    }

    fn current_state_impl(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(_) => ElectionStateSnapshot::Leader,
            State::Candidate(_) => ElectionStateSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => ElectionStateSnapshot::Follower(leader_info.clone()),
        }
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => CurrentLeader::Other(leader_info.clone()),
            _ => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    pub(crate) fn is_follower(&self) -> bool {
        matches!(self.state, State::Follower(_))
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state));
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    term: Term,
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    election_timer: ElectionTimerHandle,
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: ElectionTimerHandle::spawn(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<LeaderRedirectInfo>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        Self {
            leader,
            election_timer: ElectionTimerHandle::spawn(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("a"),
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(120),
            follower_max_timeout: Duration::from_secs(180),
        }
    }

    fn ids(names: &[&str]) -> HashSet<ReplicaId> {
        names.iter().map(|n| ReplicaId::new(*n)).collect()
    }

    #[tokio::test]
    async fn follower_to_candidate_to_leader() {
        let (client, _rx) = ActorClient::new(10);
        let (mut election, mut listener) = ElectionState::new_follower(config(), client.weak());
        assert_eq!(election.current_leader(), CurrentLeader::Unknown);

        election.transition_to_candidate_and_vote_for_self();
        assert!(matches!(listener.next().await, Some(ElectionStateSnapshot::Candidate)));
        // Our own vote counts once.
        assert_eq!(election.add_vote_if_candidate(ReplicaId::new("a")), Some(1));
        assert_eq!(election.add_vote_if_candidate(ReplicaId::new("b")), Some(2));

        election.transition_to_leader(Term::new(3), ids(&["b", "c"]), Some(Index::new(7)));
        assert!(election.is_leader());
        assert_eq!(election.current_leader(), CurrentLeader::Me);
        assert_eq!(election.add_vote_if_candidate(ReplicaId::new("c")), None);
        assert_eq!(election.leader_state().unwrap().peer_ids(), ids(&["b", "c"]));
    }

    #[tokio::test]
    async fn leader_peers_follow_config() {
        let (client, _rx) = ActorClient::new(10);
        let (mut election, _listener) = ElectionState::new_follower(config(), client.weak());

        // Not leader, nothing to sync.
        election.sync_leader_peers(&ids(&["b"]), None);
        assert!(election.leader_state().is_none());

        election.transition_to_leader(Term::new(2), ids(&["b", "c"]), Some(Index::new(4)));
        election.sync_leader_peers(&ids(&["c", "d"]), Some(Index::new(5)));

        let tracker = election.leader_state().unwrap();
        assert_eq!(tracker.peer_ids(), ids(&["c", "d"]));
        let (next, _) = tracker.peer_state(&ReplicaId::new("d")).unwrap().next_and_previous_log_index();
        assert_eq!(next, Index::new(6));
        let (next, _) = tracker.peer_state(&ReplicaId::new("c")).unwrap().next_and_previous_log_index();
        assert_eq!(next, Index::new(5));
    }

    #[tokio::test]
    async fn follower_learns_leader_once() {
        let (client, _rx) = ActorClient::new(10);
        let (mut election, _listener) = ElectionState::new_follower(config(), client.weak());

        let leader = LeaderRedirectInfo {
            replica_id: ReplicaId::new("b"),
            address: "127.0.0.1:7000".into(),
        };
        election.set_leader_if_unknown(&leader);
        election.set_leader_if_unknown(&LeaderRedirectInfo {
            replica_id: ReplicaId::new("c"),
            address: "127.0.0.1:7001".into(),
        });
        assert_eq!(election.current_leader(), CurrentLeader::Other(leader));
    }
}
