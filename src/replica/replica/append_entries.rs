use crate::commitlog::{Index, Log};
use crate::replica::replica::Replica;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, ClusterConfig, EntryKind, LeaderRedirectInfo,
    TermOutOfDateInfo, WriteAheadLogEntry,
};
use std::{cmp, io};

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        let leader = LeaderRedirectInfo {
            replica_id: input.leader_id.clone(),
            address: input.leader_address.clone(),
        };
        self.accept_leader(input.leader_term, leader)
            .map_err(AppendEntriesError::ServerIoError)?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        //
        // Anything covered by our snapshot is committed, so it matches by definition.
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            if !self.wal.is_compacted(leader_prev_entry_index) {
                let my_term = self
                    .wal
                    .term_at(leader_prev_entry_index)
                    .map_err(AppendEntriesError::ServerIoError)?;
                if my_term != Some(leader_prev_entry_term) {
                    let my_last_index = self.wal.latest_entry().map(|(_, index)| index);
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                        last_log_entry_index: cmp::min(my_last_index, leader_prev_entry_index.checked_minus(1)),
                    });
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        for new_entry in input.new_entries {
            let index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);

            if self.wal.is_compacted(index) {
                continue;
            }

            // 3. (if...)
            match self.wal.term_at(index).map_err(AppendEntriesError::ServerIoError)? {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => continue,
                // 3. (delete)
                Some(_) => self
                    .truncate_log_from(index)
                    .map_err(AppendEntriesError::ServerIoError)?,
                None => {}
            }

            // A config takes effect as soon as it's in the log, committed or not.
            let new_config = match new_entry.kind {
                EntryKind::Config => {
                    Some(ClusterConfig::decode(&new_entry.data).map_err(AppendEntriesError::ServerIoError)?)
                }
                EntryKind::Command | EntryKind::Noop => None,
            };

            // 4. (append)
            let appended_index = self
                .wal
                .append(WriteAheadLogEntry {
                    term: new_entry.term,
                    kind: new_entry.kind,
                    data: new_entry.data.to_vec(),
                })
                .map_err(AppendEntriesError::ServerIoError)?;
            if appended_index != index {
                return Err(AppendEntriesError::ServerIoError(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Appended log entry at {:?}, expected {:?}", appended_index, index),
                )));
            }

            if let Some(config) = new_config {
                self.cluster_tracker.set_latest(index, config);
            }
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            self.wal
                .ratchet_fwd_commit_index(cmp::min(leader_commit_index, index_of_last_new_entry));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(AppendEntriesOutput {})
    }
}
