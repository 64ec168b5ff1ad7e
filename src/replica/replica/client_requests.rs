use crate::actor::Callback;
use crate::commitlog::Log;
use crate::replica::replica::pending::Pending;
use crate::replica::replica::Replica;
use crate::replica::election::CurrentLeader;
use crate::replica::{
    ApplyError, ApplyInput, ApplyOutput, ChangeMembershipError, ChangeMembershipInput, ChangeMembershipOutput,
    ServerInfo, WriteAheadLogEntry,
};

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    /// Appends a command and replies once it's applied. The reply carries the state machine's
    /// verdict on the command.
    pub(crate) fn handle_apply(&mut self, input: ApplyInput, callback: Callback<ApplyOutput, ApplyError>) {
        if !self.election_state.is_leader() {
            callback.send(Err(ApplyError::NotLeader(self.leader_redirect())));
            return;
        }

        let term = self.local_state.current_term();
        let index = match self.wal.append(WriteAheadLogEntry::command(term, input.data.to_vec())) {
            Ok(index) => index,
            Err(e) => {
                slog::error!(self.logger, "Failed to append command: {:?}", e);
                callback.send(Err(ApplyError::LocalIoError(e)));
                return;
            }
        };
        slog::debug!(self.logger, "Appended command at {:?}", index);

        self.pending.insert(index, term, Pending::Command(callback));
        self.after_leader_append();
    }

    /// Adds or removes one server. Only one change may be uncommitted at a time, and a new leader
    /// must commit an entry from its own term first.
    pub(crate) fn handle_change_membership(
        &mut self,
        input: ChangeMembershipInput,
        callback: Callback<ChangeMembershipOutput, ChangeMembershipError>,
    ) {
        if !self.election_state.is_leader() {
            callback.send(Err(ChangeMembershipError::NotLeader(self.leader_redirect())));
            return;
        }

        let latest = self.cluster_tracker.latest_config();
        let new_config = match &input {
            ChangeMembershipInput::AddVoter { replica_id, address } => {
                if latest.address(replica_id) == Some(address.as_str()) {
                    callback.send(Ok(ChangeMembershipOutput {
                        config_index: self.cluster_tracker.latest_config_index(),
                    }));
                    return;
                }
                latest.with_voter(replica_id.clone(), address.clone())
            }
            ChangeMembershipInput::RemoveServer { replica_id } => {
                if !latest.contains(replica_id) {
                    callback.send(Ok(ChangeMembershipOutput {
                        config_index: self.cluster_tracker.latest_config_index(),
                    }));
                    return;
                }
                if latest.len() == 1 {
                    callback.send(Err(ChangeMembershipError::Invalid(format!(
                        "{:?} is the last voter",
                        replica_id
                    ))));
                    return;
                }
                latest.without(replica_id)
            }
        };

        let term = self.local_state.current_term();
        let committed_in_term = match self.wal.has_committed_in_term(term) {
            Ok(committed) => committed,
            Err(e) => {
                callback.send(Err(ChangeMembershipError::LocalIoError(e)));
                return;
            }
        };
        if self.cluster_tracker.has_uncommitted_config() || !committed_in_term {
            callback.send(Err(ChangeMembershipError::ChangeInProgress));
            return;
        }

        let index = match self.wal.append(WriteAheadLogEntry::config(term, new_config.encode())) {
            Ok(index) => index,
            Err(e) => {
                slog::error!(self.logger, "Failed to append config: {:?}", e);
                callback.send(Err(ChangeMembershipError::LocalIoError(e)));
                return;
            }
        };
        slog::info!(self.logger, "Appended config {:?} at {:?} for {:?}", new_config, index, input);

        self.cluster_tracker.set_latest(index, new_config);
        let peer_ids = self.cluster_tracker.peer_ids();
        self.election_state.sync_leader_peers(&peer_ids, Some(index));

        self.pending.insert(index, term, Pending::Membership(callback));
        self.after_leader_append();
    }

    /// Voters in the latest config, including a change that hasn't committed yet.
    pub(crate) fn handle_get_servers(&self) -> Vec<ServerInfo> {
        let leader_id = match self.election_state.current_leader() {
            CurrentLeader::Me => Some(self.cluster_tracker.my_replica_id().clone()),
            CurrentLeader::Other(leader) => Some(leader.replica_id),
            CurrentLeader::Unknown => None,
        };

        self.cluster_tracker
            .latest_config()
            .iter()
            .map(|(replica_id, address)| ServerInfo {
                replica_id: replica_id.clone(),
                address: address.to_string(),
                is_leader: leader_id.as_ref() == Some(replica_id),
            })
            .collect()
    }
}
