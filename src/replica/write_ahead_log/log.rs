use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::WriteAheadLogEntry;
use std::{cmp, io};

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Entries at and below the snapshot base have been compacted away. The base still answers
/// `term_at()` so that consistency checks work across the boundary.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written, or the snapshot base if
    // nothing was written since. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last entry covered by the latest snapshot.
    snapshot_base: Option<(Term, Index)>,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Recovers log state from what's already in `log`, on top of an optional snapshot. Everything
    /// covered by the snapshot is known committed and applied; the rest is neither until a leader
    /// says otherwise.
    pub(crate) fn new(logger: slog::Logger, mut log: L, snapshot_base: Option<(Term, Index)>) -> Result<Self, io::Error> {
        let expected_first_index = snapshot_base
            .map(|(_, index)| index.plus(1))
            .unwrap_or_else(Index::start_index);

        if log.first_index() > expected_first_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Log starts at {:?} but snapshot only covers up to {:?}",
                    log.first_index(),
                    expected_first_index
                ),
            ));
        }
        if let Some((_, base_index)) = snapshot_base {
            if log.first_index() <= base_index {
                // We crashed between saving a snapshot and compacting the log.
                if log.next_index() > base_index {
                    log.compact(base_index)?;
                } else {
                    log.reset(base_index.plus(1))?;
                }
            }
        }

        let mut latest_entry_metadata = snapshot_base;
        if let Some(last_index) = log.next_index().checked_minus(1) {
            if last_index >= log.first_index() {
                if let Some(entry) = log.read(last_index)? {
                    latest_entry_metadata = Some((entry.term, last_index));
                }
            }
        }

        let base_index = snapshot_base.map(|(_, index)| index);
        slog::info!(
            logger,
            "Recovered log. Latest={:?} SnapshotBase={:?}",
            latest_entry_metadata,
            snapshot_base
        );

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_base,
            commit_index: base_index,
            last_applied_index: base_index,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    /// Index of the oldest entry still readable from the log.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    /// Term of the entry at `index`, including the snapshot base. None if the index is past the end
    /// of the log or was compacted away below the base.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((base_term, base_index)) = self.snapshot_base {
            if index == base_index {
                return Ok(Some(base_term));
            }
            if index < base_index {
                return Ok(None);
            }
        }
        Ok(self.read(index)?.map(|entry| entry.term))
    }

    pub(crate) fn is_compacted(&self, index: Index) -> bool {
        matches!(self.snapshot_base, Some((_, base_index)) if index <= base_index)
    }

    /// Remove anything starting at `index` and later. Committed entries are never removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if index <= ci) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Refusing to truncate committed entries. Index={:?} CommitIndex={:?}",
                    index, self.commit_index
                ),
            ));
        }

        let new_latest_entry_metadata = match index.checked_minus(1) {
            None => None,
            Some(new_latest_index) => self
                .term_at(new_latest_index)?
                .map(|term| (term, new_latest_index)),
        };

        // Only update state after log action completes.
        self.log.truncate(index)?;
        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader-side commit. Returns true if the commit index moved.
    ///
    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        match self.term_at(tentative_new_commit_index)? {
            Some(term) if term == current_term => Ok(self.ratchet_fwd_commit_index(tentative_new_commit_index)),
            _ => Ok(false),
        }
    }

    /// Follower-side commit. Never moves backwards and never past the local log. Returns true if
    /// the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> bool {
        let latest_index = match self.latest_entry_metadata {
            Some((_, index)) => index,
            None => return false,
        };
        let new_commit_index = cmp::min(new_commit_index, latest_index);

        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return false;
        }
        self.commit_index.replace(new_commit_index);
        true
    }

    /// Whether the commit index points at an entry of `term`. A new leader can't serve membership
    /// changes until this holds.
    pub(crate) fn has_committed_in_term(&self, term: Term) -> Result<bool, io::Error> {
        match self.commit_index {
            None => Ok(false),
            Some(ci) => Ok(self.term_at(ci)? == Some(term)),
        }
    }

    /// Next committed entry that hasn't been applied, if any. Callers apply it and then call
    /// `mark_applied()`.
    pub(crate) fn next_entry_to_apply(&self) -> Result<Option<(Index, WriteAheadLogEntry)>, io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(None),
        };
        let next_index = self
            .last_applied_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        if next_index > commit_index {
            return Ok(None);
        }

        match self.read(next_index)? {
            Some(entry) => Ok(Some((next_index, entry))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Committed entry {:?} is missing from the log", next_index),
            )),
        }
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        self.last_applied_index.replace(index);
    }

    /// Number of applied entries not yet covered by a snapshot.
    pub(crate) fn applied_since_snapshot(&self) -> u64 {
        let applied = self.last_applied_index.map(|i| i.as_u64()).unwrap_or(0);
        let base = self.snapshot_base.map(|(_, i)| i.as_u64()).unwrap_or(0);
        applied.saturating_sub(base)
    }

    /// Drops every entry up to and including `index`, which a snapshot now covers.
    pub(crate) fn compact(&mut self, index: Index, term: Term) -> Result<(), io::Error> {
        if !matches!(self.last_applied_index, Some(applied) if index <= applied) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Can't compact past applied index. Index={:?}", index),
            ));
        }

        self.log.compact(index)?;
        self.snapshot_base = Some((term, index));
        slog::info!(self.logger, "Compacted log through {:?}", index);
        Ok(())
    }

    /// Drops the whole log in favor of a snapshot received from the leader.
    pub(crate) fn reset_to_snapshot(&mut self, index: Index, term: Term) -> Result<(), io::Error> {
        self.log.reset(index.plus(1))?;
        self.snapshot_base = Some((term, index));
        self.latest_entry_metadata = Some((term, index));
        self.commit_index = Some(index);
        self.last_applied_index = Some(index);
        slog::info!(self.logger, "Reset log onto snapshot at {:?}", index);
        Ok(())
    }

    /// Like `compact()`, but for a snapshot received from the leader that matches our own log. The
    /// entries after it are kept.
    pub(crate) fn compact_to_received_snapshot(&mut self, index: Index, term: Term) -> Result<(), io::Error> {
        self.log.compact(index)?;
        self.snapshot_base = Some((term, index));
        if !matches!(self.commit_index, Some(ci) if ci >= index) {
            self.commit_index = Some(index);
        }
        if !matches!(self.last_applied_index, Some(ai) if ai >= index) {
            self.last_applied_index = Some(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryLog, Log};

    type Wal = WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn wal_with_terms(terms: &[u64]) -> Wal {
        let mut wal = WriteAheadLog::new(logger(), InMemoryLog::create().unwrap(), None).unwrap();
        for term in terms {
            wal.append(WriteAheadLogEntry::command(Term::new(*term), vec![])).unwrap();
        }
        wal
    }

    #[test]
    fn leader_only_commits_own_term() {
        let mut wal = wal_with_terms(&[1, 1, 2]);

        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), None);

        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(3), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), Some(Index::new(3)));
        assert!(wal.has_committed_in_term(Term::new(2)).unwrap());

        // Backwards is a no-op.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(3), Term::new(2)).unwrap());
        assert!(!wal.ratchet_fwd_commit_index(Index::new(1)));
        assert_eq!(wal.commit_index(), Some(Index::new(3)));
    }

    #[test]
    fn follower_commit_is_capped_by_local_log() {
        let mut wal = wal_with_terms(&[1, 1]);
        assert!(wal.ratchet_fwd_commit_index(Index::new(10)));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn apply_in_order() {
        let mut wal = wal_with_terms(&[1, 1, 1]);
        assert!(wal.next_entry_to_apply().unwrap().is_none());

        wal.ratchet_fwd_commit_index(Index::new(2));
        let (index, _) = wal.next_entry_to_apply().unwrap().unwrap();
        assert_eq!(index, Index::new(1));
        wal.mark_applied(index);
        let (index, _) = wal.next_entry_to_apply().unwrap().unwrap();
        assert_eq!(index, Index::new(2));
        wal.mark_applied(index);
        assert!(wal.next_entry_to_apply().unwrap().is_none());
        assert_eq!(wal.applied_since_snapshot(), 2);
    }

    #[test]
    fn truncate_restores_latest_and_protects_commits() {
        let mut wal = wal_with_terms(&[1, 2, 3]);
        wal.ratchet_fwd_commit_index(Index::new(1));

        wal.truncate(Index::new(2)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(1))));
        assert!(wal.truncate(Index::new(1)).is_err());
    }

    #[test]
    fn compaction_keeps_base_term() {
        let mut wal = wal_with_terms(&[1, 2, 2, 3]);
        wal.ratchet_fwd_commit_index(Index::new(3));
        for i in 1..=3 {
            wal.mark_applied(Index::new(i));
        }

        wal.compact(Index::new(3), Term::new(2)).unwrap();
        assert_eq!(wal.first_index(), Index::new(4));
        assert_eq!(wal.term_at(Index::new(3)).unwrap(), Some(Term::new(2)));
        assert_eq!(wal.term_at(Index::new(2)).unwrap(), None);
        assert!(wal.is_compacted(Index::new(2)));
        assert!(!wal.is_compacted(Index::new(4)));
        assert_eq!(wal.term_at(Index::new(4)).unwrap(), Some(Term::new(3)));
        assert_eq!(wal.applied_since_snapshot(), 0);

        // Truncating down to the base leaves the base as latest.
        wal.truncate(Index::new(4)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(3))));
    }

    #[test]
    fn cannot_compact_unapplied() {
        let mut wal = wal_with_terms(&[1, 1]);
        assert!(wal.compact(Index::new(1), Term::new(1)).is_err());
    }

    #[test]
    fn reset_to_snapshot() {
        let mut wal = wal_with_terms(&[1, 1]);
        wal.reset_to_snapshot(Index::new(10), Term::new(4)).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(4), Index::new(10))));
        assert_eq!(wal.commit_index(), Some(Index::new(10)));
        assert_eq!(wal.last_applied_index(), Some(Index::new(10)));
        assert!(wal.next_entry_to_apply().unwrap().is_none());

        let index = wal.append(WriteAheadLogEntry::noop(Term::new(5))).unwrap();
        assert_eq!(index, Index::new(11));
    }

    #[test]
    fn recovers_from_existing_log() {
        let mut log = InMemoryLog::create().unwrap();
        log.reset(Index::new(6)).unwrap();
        log.append(WriteAheadLogEntry::command(Term::new(3), vec![])).unwrap();
        log.append(WriteAheadLogEntry::command(Term::new(4), vec![])).unwrap();

        let wal = WriteAheadLog::new(logger(), log, Some((Term::new(2), Index::new(5)))).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(4), Index::new(7))));
        assert_eq!(wal.commit_index(), Some(Index::new(5)));
    }

    #[test]
    fn recovery_compacts_entries_under_snapshot() {
        let mut log = InMemoryLog::create().unwrap();
        for term in &[1, 1, 2] {
            log.append(WriteAheadLogEntry::command(Term::new(*term), vec![])).unwrap();
        }

        let wal = WriteAheadLog::new(logger(), log, Some((Term::new(1), Index::new(2)))).unwrap();
        assert_eq!(wal.first_index(), Index::new(3));
        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(3))));
    }

    #[test]
    fn recovery_rejects_gap_before_log() {
        let mut log = InMemoryLog::create().unwrap();
        log.reset(Index::new(9)).unwrap();
        assert!(WriteAheadLog::new(logger(), log, Some((Term::new(1), Index::new(2)))).is_err());
    }
}
