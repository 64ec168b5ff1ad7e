use crate::actor::Callback;
use crate::commitlog::Index;
use crate::replica::{ApplyError, ApplyOutput, ChangeMembershipError, ChangeMembershipOutput, Term};
use crate::store::StoreError;
use std::collections::BTreeMap;

/// A caller waiting on a log entry that this replica appended as leader.
pub(super) enum Pending {
    Command(Callback<ApplyOutput, ApplyError>),
    Membership(Callback<ChangeMembershipOutput, ChangeMembershipError>),
}

impl Pending {
    fn succeed(self, index: Index, result: Result<(), StoreError>) {
        match self {
            Pending::Command(callback) => callback.send(
                result
                    .map(|_| ApplyOutput { index })
                    .map_err(ApplyError::Rejected),
            ),
            Pending::Membership(callback) => callback.send(
                result
                    .map(|_| ChangeMembershipOutput {
                        config_index: Some(index),
                    })
                    .map_err(|e| ChangeMembershipError::NotCommitted(e.to_string())),
            ),
        }
    }

    fn fail(self, reason: &str) {
        match self {
            Pending::Command(callback) => callback.send(Err(ApplyError::NotCommitted(reason.to_string()))),
            Pending::Membership(callback) => {
                callback.send(Err(ChangeMembershipError::NotCommitted(reason.to_string())))
            }
        }
    }
}

/// PendingRequests maps log index to the caller waiting for that entry. An entry is only reported
/// as applied if the applied entry has the same term it was appended with; otherwise another
/// leader overwrote it.
#[derive(Default)]
pub(super) struct PendingRequests {
    by_index: BTreeMap<Index, (Term, Pending)>,
}

impl PendingRequests {
    pub(super) fn insert(&mut self, index: Index, term: Term, pending: Pending) {
        if let Some((_, replaced)) = self.by_index.insert(index, (term, pending)) {
            replaced.fail("Entry was overwritten before it committed");
        }
    }

    /// Entry at `index` with `term` was applied with `result`.
    pub(super) fn complete(&mut self, index: Index, term: Term, result: Result<(), StoreError>) {
        // Anything older was skipped over, so it was never going to be applied.
        let newer = self.by_index.split_off(&index);
        let older = std::mem::replace(&mut self.by_index, newer);
        for (_, (_, pending)) in older {
            pending.fail("Entry was skipped");
        }

        if let Some((pending_term, pending)) = self.by_index.remove(&index) {
            if pending_term == term {
                pending.succeed(index, result);
            } else {
                pending.fail("Entry was overwritten by a newer leader");
            }
        }
    }

    /// Fails everything at `index` and later, whose entries were truncated from the log.
    pub(super) fn fail_from(&mut self, index: Index, reason: &str) {
        for (_, (_, pending)) in self.by_index.split_off(&index) {
            pending.fail(reason);
        }
    }

    pub(super) fn fail_all(&mut self, reason: &str) {
        for (_, (_, pending)) in std::mem::take(&mut self.by_index) {
            pending.fail(reason);
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.by_index.len()
    }
}
