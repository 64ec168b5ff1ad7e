use crate::replica::peers::ReplicaId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::fmt;

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the raft spec requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. State must
/// be durable before a method returns `Ok`.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<&ReplicaId>);
}

/// VolatileLocalState keeps term and vote in memory only. Used when a node has no data directory.
#[derive(Clone)]
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<ReplicaId>,
    my_replica_id: ReplicaId,
}

impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id,
        }
    }

    fn store_term_if_increased_impl(&mut self, new_term: Term) -> bool {
        if new_term <= self.current_term {
            false
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            true
        }
    }

    fn store_vote_impl(&mut self, expected_current_term: Term, vote: ReplicaId) -> bool {
        if self.current_term != expected_current_term || self.voted_for_this_term.is_some() {
            false
        } else {
            self.voted_for_this_term.replace(vote);
            true
        }
    }

    fn increment_term_and_vote_for_self_impl(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());
        self.current_term
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        Ok(self.store_term_if_increased_impl(new_term))
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        Ok(self.store_vote_impl(expected_current_term, vote))
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        Ok(self.increment_term_and_vote_for_self_impl())
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<&ReplicaId>) {
        (self.current_term, self.voted_for_this_term.as_ref())
    }
}

const STABLE_STATE_FILE_NAME: &str = "stable";
const TEMP_STABLE_STATE_FILE_NAME: &str = "stable.tmp";

#[derive(Serialize, Deserialize)]
struct StableState {
    current_term: Term,
    voted_for: Option<ReplicaId>,
}

/// FileLocalState persists term and vote with bincode. Every mutation is staged on a copy, written
/// to a temp file, fsync'd, and renamed over the previous state before it becomes visible.
pub(crate) struct FileLocalState {
    directory: PathBuf,
    state: VolatileLocalState,
}

impl FileLocalState {
    pub(crate) fn open<P: AsRef<Path>>(directory: P, my_replica_id: ReplicaId) -> Result<Self, io::Error> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let mut state = VolatileLocalState::new(my_replica_id);
        let path = directory.join(STABLE_STATE_FILE_NAME);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let stable: StableState =
                bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            state.current_term = stable.current_term;
            state.voted_for_this_term = stable.voted_for;
        }

        Ok(FileLocalState { directory, state })
    }

    fn persist(&mut self, next: VolatileLocalState) -> Result<(), io::Error> {
        let stable = StableState {
            current_term: next.current_term,
            voted_for: next.voted_for_this_term.clone(),
        };
        let bytes = bincode::serialize(&stable).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let temp_path = self.directory.join(TEMP_STABLE_STATE_FILE_NAME);
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.directory.join(STABLE_STATE_FILE_NAME))?;

        self.state = next;
        Ok(())
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        let mut next = self.state.clone();
        if !next.store_term_if_increased_impl(new_term) {
            return Ok(false);
        }
        self.persist(next)?;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        let mut next = self.state.clone();
        if !next.store_vote_impl(expected_current_term, vote) {
            return Ok(false);
        }
        self.persist(next)?;
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        let mut next = self.state.clone();
        let term = next.increment_term_and_vote_for_self_impl();
        self.persist(next)?;
        Ok(term)
    }

    fn current_term(&self) -> Term {
        self.state.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<&ReplicaId>) {
        self.state.voted_for_current_term()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_cas() {
        let mut state = VolatileLocalState::new(ReplicaId::new("me"));
        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());

        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(2), ReplicaId::new("a"))
            .unwrap());
        assert!(state
            .store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("a"))
            .unwrap());
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("b"))
            .unwrap());
        assert_eq!(state.voted_for_current_term(), (Term::new(3), Some(&ReplicaId::new("a"))));

        // New term clears the vote.
        assert!(state.store_term_if_increased(Term::new(4)).unwrap());
        assert_eq!(state.voted_for_current_term(), (Term::new(4), None));

        assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(5));
        assert_eq!(state.voted_for_current_term(), (Term::new(5), Some(&ReplicaId::new("me"))));
    }

    #[test]
    fn file_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = FileLocalState::open(dir.path(), ReplicaId::new("me")).unwrap();
            assert_eq!(state.current_term(), Term::new(0));
            state.store_term_if_increased(Term::new(7)).unwrap();
            state
                .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("other"))
                .unwrap();
        }

        let mut state = FileLocalState::open(dir.path(), ReplicaId::new("me")).unwrap();
        assert_eq!(
            state.voted_for_current_term(),
            (Term::new(7), Some(&ReplicaId::new("other")))
        );
        // The recovered vote still blocks a second vote in the same term.
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("me"))
            .unwrap());

        assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(8));
        drop(state);

        let state = FileLocalState::open(dir.path(), ReplicaId::new("me")).unwrap();
        assert_eq!(state.voted_for_current_term(), (Term::new(8), Some(&ReplicaId::new("me"))));
    }
}
