use crate::membership::{Member, MemberEvent, MemberStatus};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    member: Member,
    suspected_at: Option<Instant>,
}

struct Broadcast {
    member: Member,
    transmits_left: u32,
}

/// MemberList is this node's view of the pool, and the queue of updates still to be gossiped.
///
/// An update about another member wins if it has a higher incarnation. At the same incarnation,
/// Suspect overrides Alive, and Failed or Left override either. Updates about ourselves are never
/// applied: a Suspect or Failed claim is refuted by gossiping Alive at a higher incarnation.
pub(super) struct MemberList {
    local: Member,
    // Everyone but ourselves, tombstones included.
    members: HashMap<String, Entry>,
    broadcasts: Vec<Broadcast>,
    retransmit_multiplier: u32,
}

impl MemberList {
    pub(super) fn new(local: Member, retransmit_multiplier: u32) -> Self {
        MemberList {
            local,
            members: HashMap::new(),
            broadcasts: Vec::new(),
            retransmit_multiplier,
        }
    }

    pub(super) fn local(&self) -> &Member {
        &self.local
    }

    /// Every member we know of, ourselves and tombstones included.
    pub(super) fn members(&self) -> Vec<Member> {
        std::iter::once(&self.local)
            .chain(self.members.values().map(|entry| &entry.member))
            .cloned()
            .collect()
    }

    /// Up to `k` random active members other than ourselves and `exclude`.
    pub(super) fn random_active(&self, k: usize, exclude: &[&str]) -> Vec<Member> {
        let mut candidates: Vec<&Member> = self
            .members
            .values()
            .map(|entry| &entry.member)
            .filter(|member| member.status.is_active() && !exclude.contains(&member.name.as_str()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().take(k).cloned().collect()
    }

    pub(super) fn apply(&mut self, update: Member, now: Instant) -> Option<MemberEvent> {
        if update.name == self.local.name {
            self.refute(&update);
            return None;
        }

        let event = match self.members.get_mut(&update.name) {
            None => {
                let event = if update.status.is_active() {
                    Some(MemberEvent::Join(vec![update.clone()]))
                } else {
                    // Tombstone, so stale gossip can't bring it back.
                    None
                };
                self.members.insert(
                    update.name.clone(),
                    Entry {
                        member: update.clone(),
                        suspected_at: suspected_at(&update, None, now),
                    },
                );
                event
            }
            Some(entry) => {
                if !supersedes(&update, &entry.member) {
                    return None;
                }
                let event = match (entry.member.status.is_active(), update.status) {
                    (false, MemberStatus::Alive) | (false, MemberStatus::Suspect) => {
                        Some(MemberEvent::Join(vec![update.clone()]))
                    }
                    (true, MemberStatus::Failed) => Some(MemberEvent::Failed(vec![update.clone()])),
                    (true, MemberStatus::Left) => Some(MemberEvent::Leave(vec![update.clone()])),
                    _ => None,
                };
                entry.suspected_at = suspected_at(&update, entry.suspected_at, now);
                entry.member = update.clone();
                event
            }
        };

        self.queue(update);
        event
    }

    fn refute(&mut self, update: &Member) {
        let me = &mut self.local;
        if me.status == MemberStatus::Left || update.incarnation < me.incarnation {
            return;
        }
        if update.status == MemberStatus::Alive {
            return;
        }

        me.incarnation = update.incarnation + 1;
        me.status = MemberStatus::Alive;
        let refutation = me.clone();
        self.queue(refutation);
    }

    /// Marks `name` Suspect after a failed probe, unless it has since moved on.
    pub(super) fn suspect(&mut self, name: &str, incarnation: u64, now: Instant) -> bool {
        let entry = match self.members.get_mut(name) {
            Some(entry) => entry,
            None => return false,
        };
        if entry.member.status != MemberStatus::Alive || entry.member.incarnation != incarnation {
            return false;
        }

        entry.member.status = MemberStatus::Suspect;
        entry.suspected_at = Some(now);
        let update = entry.member.clone();
        self.queue(update);
        true
    }

    /// Declares Failed every member that stayed Suspect for longer than `timeout`.
    pub(super) fn expire_suspects(&mut self, timeout: Duration, now: Instant) -> Option<MemberEvent> {
        let mut failed = Vec::new();
        for entry in self.members.values_mut() {
            let expired = entry
                .suspected_at
                .map(|since| now.saturating_duration_since(since) >= timeout)
                .unwrap_or(false);
            if expired && entry.member.status == MemberStatus::Suspect {
                entry.member.status = MemberStatus::Failed;
                entry.suspected_at = None;
                failed.push(entry.member.clone());
            }
        }

        if failed.is_empty() {
            return None;
        }
        for member in &failed {
            self.queue(member.clone());
        }
        Some(MemberEvent::Failed(failed))
    }

    /// Marks ourselves Left. The returned record is what the rest of the pool needs to hear.
    pub(super) fn leave(&mut self) -> Member {
        let me = &mut self.local;
        me.incarnation += 1;
        me.status = MemberStatus::Left;
        let update = me.clone();
        self.queue(update.clone());
        update
    }

    /// Updates to piggyback on the next message. Each is handed out a bounded number of times.
    pub(super) fn take_gossip(&mut self, max: usize) -> Vec<Member> {
        let mut out = Vec::with_capacity(max.min(self.broadcasts.len()));
        for broadcast in self.broadcasts.iter_mut().take(max) {
            broadcast.transmits_left = broadcast.transmits_left.saturating_sub(1);
            out.push(broadcast.member.clone());
        }
        self.broadcasts.retain(|broadcast| broadcast.transmits_left > 0);
        // Least transmitted first.
        self.broadcasts
            .sort_by(|a, b| b.transmits_left.cmp(&a.transmits_left));
        out
    }

    fn queue(&mut self, member: Member) {
        let transmits_left = self.retransmit_limit();
        self.broadcasts.retain(|broadcast| broadcast.member.name != member.name);
        self.broadcasts.insert(0, Broadcast { member, transmits_left });
    }

    fn retransmit_limit(&self) -> u32 {
        let n = (self.members.len() + 1) as f64;
        let scale = (n + 1.0).log10().ceil().max(1.0) as u32;
        self.retransmit_multiplier * scale
    }
}

fn supersedes(update: &Member, current: &Member) -> bool {
    if update.incarnation != current.incarnation {
        return update.incarnation > current.incarnation;
    }
    match update.status {
        MemberStatus::Alive => false,
        MemberStatus::Suspect => current.status == MemberStatus::Alive,
        MemberStatus::Failed | MemberStatus::Left => current.status.is_active(),
    }
}

fn suspected_at(update: &Member, previous: Option<Instant>, now: Instant) -> Option<Instant> {
    match update.status {
        MemberStatus::Suspect => Some(previous.unwrap_or(now)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn member(name: &str, status: MemberStatus, incarnation: u64) -> Member {
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:9000".parse().unwrap(),
            tags: HashMap::new(),
            status,
            incarnation,
        }
    }

    fn list() -> MemberList {
        MemberList::new(member("me", MemberStatus::Alive, 0), 2)
    }

    #[test]
    fn new_member_joins_once() {
        let mut list = list();
        let now = Instant::now();

        let event = list.apply(member("a", MemberStatus::Alive, 0), now);
        assert_eq!(event, Some(MemberEvent::Join(vec![member("a", MemberStatus::Alive, 0)])));
        assert_eq!(list.apply(member("a", MemberStatus::Alive, 0), now), None);
    }

    #[test]
    fn left_member_stays_left_under_stale_gossip() {
        let mut list = list();
        let now = Instant::now();
        list.apply(member("a", MemberStatus::Alive, 0), now);

        let event = list.apply(member("a", MemberStatus::Left, 1), now);
        assert!(matches!(event, Some(MemberEvent::Leave(_))));
        assert_eq!(list.apply(member("a", MemberStatus::Alive, 0), now), None);
        assert_eq!(list.apply(member("a", MemberStatus::Left, 1), now), None);

        // Rejoin at a higher incarnation.
        let event = list.apply(member("a", MemberStatus::Alive, 2), now);
        assert!(matches!(event, Some(MemberEvent::Join(_))));
    }

    #[test]
    fn tombstone_for_unknown_member_is_silent() {
        let mut list = list();
        assert_eq!(list.apply(member("a", MemberStatus::Failed, 4), Instant::now()), None);
        assert!(list.random_active(10, &[]).is_empty());
    }

    #[test]
    fn suspicion_expires_into_failure() {
        let mut list = list();
        let start = Instant::now();
        list.apply(member("a", MemberStatus::Alive, 0), start);

        assert!(list.suspect("a", 0, start));
        assert!(!list.suspect("a", 0, start));
        assert_eq!(list.expire_suspects(Duration::from_secs(1), start), None);

        let later = start + Duration::from_secs(2);
        let event = list.expire_suspects(Duration::from_secs(1), later);
        assert_eq!(event, Some(MemberEvent::Failed(vec![member("a", MemberStatus::Failed, 0)])));
    }

    #[test]
    fn refutation_clears_suspicion() {
        let mut list = list();
        let start = Instant::now();
        list.apply(member("a", MemberStatus::Alive, 0), start);
        list.suspect("a", 0, start);

        assert_eq!(list.apply(member("a", MemberStatus::Alive, 1), start), None);
        let later = start + Duration::from_secs(5);
        assert_eq!(list.expire_suspects(Duration::from_secs(1), later), None);
    }

    #[test]
    fn suspicion_of_self_is_refuted() {
        let mut list = list();
        list.apply(member("me", MemberStatus::Suspect, 0), Instant::now());

        assert_eq!(list.local().status, MemberStatus::Alive);
        assert_eq!(list.local().incarnation, 1);
        let gossip = list.take_gossip(10);
        assert_eq!(gossip, vec![member("me", MemberStatus::Alive, 1)]);
    }

    #[test]
    fn gossip_is_retransmitted_a_bounded_number_of_times() {
        let mut list = list();
        list.apply(member("a", MemberStatus::Alive, 0), Instant::now());

        // Two members, multiplier 2: log10(3) rounds up to 1.
        assert_eq!(list.take_gossip(10).len(), 1);
        assert_eq!(list.take_gossip(10).len(), 1);
        assert!(list.take_gossip(10).is_empty());
    }

    #[test]
    fn leave_bumps_incarnation() {
        let mut list = list();
        let update = list.leave();
        assert_eq!(update.status, MemberStatus::Left);
        assert_eq!(update.incarnation, 1);

        // Suspicion of a departed node is not refuted.
        list.apply(member("me", MemberStatus::Suspect, 1), Instant::now());
        assert_eq!(list.local().status, MemberStatus::Left);
    }
}
