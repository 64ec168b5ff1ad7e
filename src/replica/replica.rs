mod append_entries;
mod client_requests;
mod pending;
mod replication;
mod request_vote;
mod snapshot;

use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::replica::election::{CurrentLeader, ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::{ClusterConfig, ClusterTracker, ReplicaId};
use crate::replica::replica::pending::PendingRequests;
use crate::replica::replica::snapshot::IncomingSnapshot;
use crate::replica::{
    EntryKind, LeaderRedirectInfo, Snapshot, SnapshotStore, StateMachine, WriteAheadLog, WriteAheadLogEntry,
};
use crate::server::RpcServerShutdownHandle;
use bytes::Bytes;
use std::io;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptions {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    // Applied entries since the last snapshot before another snapshot is taken.
    pub(crate) snapshot_threshold: u64,
    pub(crate) snapshot_chunk_size: usize,
    pub(crate) max_entries_per_append: usize,
}

pub(crate) struct ReplicaConfig<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) wal: WriteAheadLog<L>,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) snapshot_store: Box<dyn SnapshotStore>,
    // Already restored into `state_machine`.
    pub(crate) current_snapshot: Option<Snapshot>,
    pub(crate) bootstrap: bool,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) options: ReplicaOptions,
    pub(crate) server_shutdown_handle: RpcServerShutdownHandle,
}

pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    wal: WriteAheadLog<L>,
    state_machine: Box<dyn StateMachine>,
    snapshot_store: Box<dyn SnapshotStore>,
    // Latest snapshot, held in memory so it can be streamed to peers that fell behind it.
    current_snapshot: Option<Snapshot>,
    // Chunks of a snapshot the leader is still sending us.
    incoming_snapshot: Option<IncomingSnapshot>,
    pending: PendingRequests,
    actor_client: WeakActorClient,
    // When we last accepted a call from the current leader.
    last_leader_contact: Option<Instant>,
    options: ReplicaOptions,
    // Dropping this stops the raft RPC server.
    _server_shutdown_handle: RpcServerShutdownHandle,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    /// Builds the replica on top of recovered state. Cluster config is rebuilt from the snapshot and
    /// whatever config entries are still in the log.
    pub(crate) fn new(config: ReplicaConfig<L>) -> Result<(Self, ElectionStateChangeListener), io::Error> {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        let (election_state, election_state_change_listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                leader_heartbeat_duration: config.options.leader_heartbeat_duration,
                follower_min_timeout: config.options.follower_min_timeout,
                follower_max_timeout: config.options.follower_max_timeout,
            },
            config.actor_client.clone(),
        );

        let mut replica = Replica {
            logger: config.logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state,
            wal: config.wal,
            state_machine: config.state_machine,
            snapshot_store: config.snapshot_store,
            current_snapshot: config.current_snapshot,
            incoming_snapshot: None,
            pending: PendingRequests::default(),
            actor_client: config.actor_client,
            last_leader_contact: None,
            options: config.options,
            _server_shutdown_handle: config.server_shutdown_handle,
        };

        match &replica.current_snapshot {
            Some(snapshot) => {
                let (index, cluster_config) = (snapshot.meta.last_included_index(), snapshot.meta.config.clone());
                replica.cluster_tracker.reset(Some(index), cluster_config);
            }
            None => replica.cluster_tracker.reset(None, ClusterConfig::default()),
        }
        replica.load_configs_from_log(replica.wal.first_index())?;

        if config.bootstrap && replica.wal.latest_entry().is_none() {
            replica.bootstrap()?;
        }

        Ok((replica, election_state_change_listener))
    }

    fn bootstrap(&mut self) -> Result<(), io::Error> {
        let config = ClusterConfig::single(self.my_replica_id.clone(), self.cluster_tracker.my_address().to_string());
        let index = self.wal.append(WriteAheadLogEntry::config(Term::new(0), config.encode()))?;
        slog::info!(self.logger, "Bootstrapped new cluster with config {:?}", config);
        self.cluster_tracker.set_latest(index, config);
        Ok(())
    }

    /// Puts every config entry at `from` and later into effect, in log order.
    fn load_configs_from_log(&mut self, from: Index) -> Result<(), io::Error> {
        let latest_index = match self.wal.latest_entry() {
            Some((_, index)) => index,
            None => return Ok(()),
        };

        let mut index = from;
        while index <= latest_index {
            if let Some(entry) = self.wal.read(index)? {
                if entry.kind == EntryKind::Config {
                    self.cluster_tracker.set_latest(index, ClusterConfig::decode(&entry.data)?);
                }
            }
            index = index.plus(1);
        }
        Ok(())
    }

    /// Newest config entry still in the log that isn't known committed.
    fn find_latest_config_entry(&self) -> Result<Option<(Index, ClusterConfig)>, io::Error> {
        let mut index = match self.wal.latest_entry() {
            Some((_, index)) => index,
            None => return Ok(None),
        };
        let floor = self
            .cluster_tracker
            .committed_config_index()
            .map(|ci| ci.plus(1))
            .unwrap_or_else(Index::start_index)
            .max(self.wal.first_index());

        while index >= floor {
            if let Some(entry) = self.wal.read(index)? {
                if entry.kind == EntryKind::Config {
                    return Ok(Some((index, ClusterConfig::decode(&entry.data)?)));
                }
            }
            index = match index.checked_minus(1) {
                Some(prev) => prev,
                None => break,
            };
        }
        Ok(None)
    }

    /// Removes `index` and everything after it. Callers waiting on those entries are failed, and an
    /// uncommitted config that was removed stops being in effect.
    fn truncate_log_from(&mut self, index: Index) -> Result<(), io::Error> {
        self.wal.truncate(index)?;
        self.pending.fail_from(index, "Entry was overwritten by a newer leader");

        if matches!(self.cluster_tracker.latest_config_index(), Some(ci) if ci >= index) {
            let replacement = self.find_latest_config_entry()?;
            self.cluster_tracker.revert_latest(replacement);
        }
        Ok(())
    }

    fn leader_redirect(&self) -> Option<LeaderRedirectInfo> {
        match self.election_state.current_leader() {
            CurrentLeader::Other(leader) => Some(leader),
            CurrentLeader::Me | CurrentLeader::Unknown => None,
        }
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    fn observe_term(&mut self, term: Term) -> Result<bool, io::Error> {
        let increased = self.local_state.store_term_if_increased(term)?;
        if increased {
            self.step_down(None);
        }
        Ok(increased)
    }

    fn step_down(&mut self, leader: Option<LeaderRedirectInfo>) {
        if self.election_state.is_leader() {
            self.pending.fail_all("Leadership was lost before the entry committed");
        }
        self.election_state.transition_to_follower(leader);
        slog::info!(self.logger, "Transitioned to follower. Election state: {:?}", self.election_state);
    }

    /// Common handling for calls from a leader whose term is at least ours.
    fn accept_leader(&mut self, leader_term: Term, leader: LeaderRedirectInfo) -> Result<(), io::Error> {
        let increased = self.local_state.store_term_if_increased(leader_term)?;
        if increased || !self.election_state.is_follower() {
            // > If AppendEntries RPC received from new leader: convert to follower
            self.step_down(Some(leader));
        } else {
            self.election_state.set_leader_if_unknown(&leader);
        }

        self.election_state.reset_timeout_if_follower();
        self.last_leader_contact.replace(Instant::now());
        Ok(())
    }

    /// Whether we're leader or recently heard from one. Votes aren't granted while this holds, so a
    /// server that was removed from the cluster can't force elections.
    fn has_live_leader(&self) -> bool {
        if self.election_state.is_leader() {
            return true;
        }
        match self.last_leader_contact {
            Some(at) => self.election_state.is_follower() && at.elapsed() < self.options.follower_min_timeout,
            None => false,
        }
    }

    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    fn apply_committed_entries(&mut self) {
        loop {
            let (index, entry) = match self.wal.next_entry_to_apply() {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry: {:?}", e);
                    break;
                }
            };

            let term = entry.term;
            let result = match entry.kind {
                EntryKind::Command => self.state_machine.apply_committed_entry(Bytes::from(entry.data)),
                EntryKind::Config => {
                    match ClusterConfig::decode(&entry.data) {
                        Ok(config) => self.cluster_tracker.mark_applied(index, config),
                        Err(e) => slog::error!(self.logger, "Committed config at {:?} is corrupt: {:?}", index, e),
                    }
                    Ok(())
                }
                EntryKind::Noop => Ok(()),
            };
            if let Err(e) = &result {
                slog::warn!(self.logger, "State machine rejected entry {:?}: {}", index, e);
            }

            self.wal.mark_applied(index);
            self.pending.complete(index, term, result);
        }

        // > a leader that is removed from the configuration steps down once the Cnew entry is
        // > committed.
        if self.election_state.is_leader()
            && !self.cluster_tracker.am_i_voter()
            && !self.cluster_tracker.has_uncommitted_config()
        {
            slog::info!(self.logger, "No longer a voter. Stepping down.");
            self.step_down(None);
        }

        self.maybe_take_snapshot();
    }

    pub(crate) fn handle_shutdown(&mut self) {
        self.pending.fail_all("Replica shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, ReplicaActor};
    use crate::commitlog::InMemoryLog;
    use crate::fsm::{Command, KvStateMachine};
    use crate::replica::{
        ApplyError, ApplyInput, ChangeMembershipError, ChangeMembershipInput, InMemorySnapshotStore,
        VolatileLocalState,
    };
    use crate::store::{KeyValueStore, StoreError};
    use crate::transport::StreamLayer;
    use std::sync::Arc;

    type Repl = Replica<InMemoryLog<WriteAheadLogEntry>>;

    fn opt_index(v: u64) -> Option<Index> {
        if v == 0 {
            None
        } else {
            Some(Index::new(v))
        }
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();

            let expected = opt_index(expected);

            assert_eq!(expected, Repl::get_cluster_commit_index(matches));
        }

        // Nobody votes
        run(0, vec![]);

        // 1-cluster
        run(0, vec![0]);
        run(9, vec![9]);

        // 3-cluster. The list includes the leader's own last index.
        run(0, vec![0, 0, 9]);
        run(9, vec![0, 9, 9]);
        run(9, vec![8, 9, 9]);
        run(8, vec![7, 8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0, 9]);
        run(0, vec![0, 0, 9, 9]);
        run(8, vec![0, 8, 9, 9]);
        run(8, vec![7, 8, 9, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 9, 9]);
        run(8, vec![0, 0, 8, 9, 9]);
        run(8, vec![0, 7, 8, 9, 9]);
        run(8, vec![6, 7, 8, 9, 9]);

        // Leader isn't a voter (it's removing itself), so it isn't in the list.
        run(5, vec![5, 7]);

        // Ordering doesn't matter
        run(9, vec![9, 8, 9]);
        run(9, vec![7, 9, 8, 9, 9]);
        run(8, vec![7, 9, 8, 9, 6]);
        run(8, vec![6, 0, 9, 8, 9]);
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn options() -> ReplicaOptions {
        ReplicaOptions {
            leader_heartbeat_duration: Duration::from_millis(20),
            follower_min_timeout: Duration::from_millis(50),
            follower_max_timeout: Duration::from_millis(60),
            append_entries_timeout: Duration::from_millis(100),
            snapshot_threshold: 4,
            snapshot_chunk_size: 16,
            max_entries_per_append: 8,
        }
    }

    async fn single_node(bootstrap: bool) -> (ActorClient, Arc<KeyValueStore>, ElectionStateChangeListener) {
        let logger = logger();
        let stream_layer = StreamLayer::bind(
            logger.clone(),
            "127.0.0.1:0".parse().unwrap(),
            &crate::transport::peer_tls(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let address = stream_layer.local_addr().to_string();
        let my_id = ReplicaId::new("solo");
        let store = Arc::new(KeyValueStore::default());

        let (actor_client, receiver) = ActorClient::new(16);
        let (server_shutdown_handle, _signal) = crate::server::shutdown_signal();
        let (replica, listener) = Replica::new(ReplicaConfig {
            logger: logger.clone(),
            cluster_tracker: ClusterTracker::new(
                logger.clone(),
                my_id.clone(),
                address,
                Arc::new(stream_layer),
                Duration::from_secs(1),
            ),
            local_state: Box::new(VolatileLocalState::new(my_id)),
            wal: WriteAheadLog::new(logger.clone(), InMemoryLog::create().unwrap(), None).unwrap(),
            state_machine: Box::new(KvStateMachine::new(logger.clone(), store.clone())),
            snapshot_store: Box::new(InMemorySnapshotStore::default()),
            current_snapshot: None,
            bootstrap,
            actor_client: actor_client.weak(),
            options: options(),
            server_shutdown_handle,
        })
        .unwrap();
        tokio::spawn(ReplicaActor::new(logger, receiver, replica).run_event_loop());

        (actor_client, store, listener)
    }

    async fn wait_for_leader(listener: &mut ElectionStateChangeListener) {
        while !matches!(listener.current(), crate::replica::ElectionStateSnapshot::Leader) {
            tokio::time::timeout(Duration::from_secs(5), listener.next())
                .await
                .expect("no election within 5s");
        }
    }

    fn set(key: &str, value: &str) -> ApplyInput {
        ApplyInput {
            data: Command::Set {
                key: key.into(),
                value: value.into(),
            }
            .encode(),
        }
    }

    #[tokio::test]
    async fn bootstrapped_node_leads_and_applies() {
        let (client, store, mut listener) = single_node(true).await;
        wait_for_leader(&mut listener).await;

        // Enough writes to cross the snapshot threshold.
        for i in 0..6 {
            client.apply(set(&format!("k{}", i), "v")).await.unwrap();
        }
        assert_eq!(store.get("k5").unwrap(), "v");

        let rejected = client
            .apply(ApplyInput {
                data: Bytes::from_static(&[7]),
            })
            .await;
        assert!(matches!(rejected, Err(ApplyError::Rejected(StoreError::InvalidCommand(_)))));

        // Removing an absent server is a no-op.
        let output = client
            .change_membership(ChangeMembershipInput::RemoveServer {
                replica_id: ReplicaId::new("ghost"),
            })
            .await
            .unwrap();
        assert!(output.config_index.is_some());

        let servers = client.get_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].replica_id, ReplicaId::new("solo"));
        assert!(servers[0].is_leader);

        let last_voter = client
            .change_membership(ChangeMembershipInput::RemoveServer {
                replica_id: ReplicaId::new("solo"),
            })
            .await;
        assert!(matches!(last_voter, Err(ChangeMembershipError::Invalid(_))));
    }

    #[tokio::test]
    async fn node_without_config_never_leads() {
        let (client, _store, listener) = single_node(false).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(matches!(
            listener.current(),
            crate::replica::ElectionStateSnapshot::FollowerNoLeader
        ));
        assert!(matches!(client.apply(set("k", "v")).await, Err(ApplyError::NotLeader(None))));
        assert!(client.get_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn calls_fail_after_shutdown() {
        let (client, _store, _listener) = single_node(false).await;

        client.shutdown().await;
        assert!(matches!(client.apply(set("k", "v")).await, Err(ApplyError::ActorExited)));
    }
}
