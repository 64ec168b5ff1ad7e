use crate::commitlog::{Index, Log};
use crate::replica::replica::Replica;
use crate::replica::{
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, LeaderRedirectInfo, RestoreError, Snapshot,
    SnapshotMeta, Term, TermOutOfDateInfo, WriteAheadLogEntry,
};
use crate::store::StoreError;
use bytes::{BufMut, BytesMut};
use std::io;

/// A snapshot the leader is still streaming to us.
pub(super) struct IncomingSnapshot {
    last_included_index: Index,
    last_included_term: Term,
    buf: BytesMut,
}

#[derive(Debug, thiserror::Error)]
enum TakeSnapshotError {
    #[error("State machine failed to snapshot: {0}")]
    StateMachine(#[from] StoreError),
    #[error("IO failure: {0}")]
    Io(#[from] io::Error),
    #[error("Nothing was applied yet")]
    NothingApplied,
    #[error("Applied entry {0:?} has no term")]
    MissingTerm(Index),
}

#[derive(Debug, thiserror::Error)]
enum InstallError {
    #[error("State machine failed to restore: {0}")]
    Restore(#[from] RestoreError),
    #[error("IO failure: {0}")]
    Io(#[from] io::Error),
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    /// Snapshots and compacts the log once enough entries were applied since the last snapshot.
    pub(super) fn maybe_take_snapshot(&mut self) {
        if self.wal.applied_since_snapshot() < self.options.snapshot_threshold {
            return;
        }

        match self.take_snapshot() {
            Ok(index) => slog::info!(self.logger, "Took snapshot through {:?}", index),
            Err(e) => slog::error!(self.logger, "Failed to take snapshot: {}", e),
        }
    }

    fn take_snapshot(&mut self) -> Result<Index, TakeSnapshotError> {
        let index = self.wal.last_applied_index().ok_or(TakeSnapshotError::NothingApplied)?;
        let term = self.wal.term_at(index)?.ok_or(TakeSnapshotError::MissingTerm(index))?;

        // Every config up to the applied index is committed, so that's the config to record.
        let snapshot = Snapshot {
            meta: SnapshotMeta::new(term, index, self.cluster_tracker.committed_config().clone()),
            data: self.state_machine.snapshot()?,
        };

        // The snapshot has to be durable before the entries it replaces are dropped.
        self.snapshot_store.save(&snapshot)?;
        self.wal.compact(index, term)?;
        self.current_snapshot.replace(snapshot);
        Ok(index)
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        // > 1. Reply immediately if term < currentTerm
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        let leader = LeaderRedirectInfo {
            replica_id: input.leader_id.clone(),
            address: input.leader_address.clone(),
        };
        self.accept_leader(input.leader_term, leader)
            .map_err(|e| InstallSnapshotError::ServerFault(e.to_string()))?;

        // Nothing to do if we already applied past it. The leader learns we're caught up.
        if matches!(self.wal.last_applied_index(), Some(applied) if applied >= input.last_included_index) {
            slog::debug!(
                self.logger,
                "Ignoring snapshot through {:?}, already applied",
                input.last_included_index
            );
            self.incoming_snapshot = None;
            return Ok(InstallSnapshotOutput {});
        }

        // > 2. Create new snapshot file if first chunk (offset is 0)
        // > 3. Write data into snapshot file at given offset
        if input.offset == 0 {
            self.incoming_snapshot.replace(IncomingSnapshot {
                last_included_index: input.last_included_index,
                last_included_term: input.last_included_term,
                buf: BytesMut::new(),
            });
        }
        let incoming = match &mut self.incoming_snapshot {
            Some(incoming)
                if incoming.last_included_index == input.last_included_index
                    && incoming.last_included_term == input.last_included_term =>
            {
                incoming
            }
            _ => return Err(InstallSnapshotError::UnexpectedOffset { expected: 0 }),
        };
        let buffered = incoming.buf.len() as u64;
        if input.offset != buffered {
            return Err(InstallSnapshotError::UnexpectedOffset { expected: buffered });
        }
        incoming.buf.put(input.data);

        // > 4. Reply and wait for more data chunks if done is false
        if !input.done {
            return Ok(InstallSnapshotOutput {});
        }

        let incoming = match self.incoming_snapshot.take() {
            Some(incoming) => incoming,
            None => return Err(InstallSnapshotError::UnexpectedOffset { expected: 0 }),
        };
        let snapshot = Snapshot {
            meta: SnapshotMeta::new(incoming.last_included_term, incoming.last_included_index, input.config),
            data: incoming.buf.freeze(),
        };
        match self.install_received_snapshot(snapshot) {
            Ok(()) => Ok(InstallSnapshotOutput {}),
            Err(e) => {
                slog::error!(self.logger, "Failed to install snapshot: {}", e);
                Err(InstallSnapshotError::ServerFault(e.to_string()))
            }
        }
    }

    fn install_received_snapshot(&mut self, snapshot: Snapshot) -> Result<(), InstallError> {
        let index = snapshot.meta.last_included_index();
        let term = snapshot.meta.last_included_term;

        // > 5. Save snapshot file, discard any existing or partial snapshot with a smaller index
        self.state_machine.restore(snapshot.data.clone())?;
        self.snapshot_store.save(&snapshot)?;

        // > 6. If existing log entry has same index and term as snapshot’s last included entry,
        // > retain log entries following it and reply
        // > 7. Discard the entire log
        let retain_log = !self.wal.is_compacted(index) && self.wal.term_at(index)? == Some(term);
        if retain_log {
            self.wal.compact_to_received_snapshot(index, term)?;
        } else {
            self.wal.reset_to_snapshot(index, term)?;
        }

        // > 8. Reset state machine using snapshot contents (and load snapshot’s cluster
        // > configuration)
        self.cluster_tracker.reset(Some(index), snapshot.meta.config.clone());
        if retain_log {
            self.load_configs_from_log(index.plus(1))?;
        }

        self.pending.fail_all("Replaced by snapshot from leader");
        slog::info!(
            self.logger,
            "Installed snapshot through {:?}. Retained log: {}",
            index,
            retain_log
        );
        self.current_snapshot.replace(snapshot);

        // Entries we retained past the snapshot may already be committed.
        self.apply_committed_entries();
        Ok(())
    }
}
