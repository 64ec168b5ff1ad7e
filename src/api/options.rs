use crate::replica::ReplicaOptions;
use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// How long a write waits to be applied before failing with `NotCommitted`.
    pub apply_timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    /// Applied entries since the last snapshot that trigger a new snapshot.
    pub snapshot_threshold: Option<u64>,
    pub snapshot_chunk_size: Option<usize>,
    pub max_entries_per_append: Option<usize>,
    /// Whether `join`/`leave` on a follower are forwarded to the leader.
    pub forward_membership_changes: Option<bool>,
}

#[derive(Clone, Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub apply_timeout: Duration,
    pub dial_timeout: Duration,
    pub snapshot_threshold: u64,
    pub snapshot_chunk_size: usize,
    pub max_entries_per_append: usize,
    pub forward_membership_changes: bool,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.snapshot_threshold == 0 {
            return Err("Snapshot threshold must be at least 1");
        }
        if self.snapshot_chunk_size == 0 {
            return Err("Snapshot chunk size must be at least 1 byte");
        }
        if self.max_entries_per_append == 0 {
            return Err("AppendEntries must be allowed to carry at least 1 entry");
        }

        Ok(())
    }

    pub(super) fn replica_options(&self) -> ReplicaOptions {
        ReplicaOptions {
            leader_heartbeat_duration: self.leader_heartbeat_duration,
            follower_min_timeout: self.follower_min_timeout,
            follower_max_timeout: self.follower_max_timeout,
            append_entries_timeout: self.leader_append_entries_timeout,
            snapshot_threshold: self.snapshot_threshold,
            snapshot_chunk_size: self.snapshot_chunk_size,
            max_entries_per_append: self.max_entries_per_append,
        }
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            apply_timeout: options.apply_timeout.unwrap_or(Duration::from_secs(10)),
            dial_timeout: options.dial_timeout.unwrap_or(Duration::from_secs(10)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(1024),
            snapshot_chunk_size: options.snapshot_chunk_size.unwrap_or(64 * 1024),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            forward_membership_changes: options.forward_membership_changes.unwrap_or(true),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(options.leader_heartbeat_duration, Duration::from_millis(100));
        assert_eq!(options.apply_timeout, Duration::from_secs(10));
        assert_eq!(options.snapshot_threshold, 1024);
        assert!(options.forward_membership_changes);
        assert_eq!(options.replica_options().snapshot_chunk_size, 64 * 1024);
    }

    #[test]
    fn heartbeat_must_beat_follower_timeout() {
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_snapshot_threshold() {
        let options = RaftOptions {
            snapshot_threshold: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }
}
