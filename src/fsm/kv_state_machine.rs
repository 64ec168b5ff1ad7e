use crate::fsm::Command;
use crate::replica::{RestoreError, StateMachine};
use crate::snapshot::RecordDecoder;
use crate::store::{KeyValueStore, StoreError};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// KvStateMachine replays committed commands onto a shared `KeyValueStore`. Reads go straight to
/// the store and never pass through here.
pub(crate) struct KvStateMachine {
    logger: slog::Logger,
    store: Arc<KeyValueStore>,
}

impl KvStateMachine {
    pub(crate) fn new(logger: slog::Logger, store: Arc<KeyValueStore>) -> Self {
        KvStateMachine { logger, store }
    }
}

impl StateMachine for KvStateMachine {
    fn apply_committed_entry(&mut self, entry: Bytes) -> Result<(), StoreError> {
        match Command::decode(&entry)? {
            Command::Set { key, value } => self.store.set(key, value),
            Command::Delete { key } => self.store.delete(&key),
        }
    }

    fn snapshot(&mut self) -> Result<Bytes, StoreError> {
        if self.store.is_degraded() {
            return Err(StoreError::Unavailable(String::from(
                "Can't snapshot a store that failed to restore",
            )));
        }
        self.store
            .snapshot()
            .try_into_bytes()
            .map_err(|e| StoreError::Unavailable(format!("Failed to frame snapshot: {}", e)))
    }

    fn restore(&mut self, snapshot: Bytes) -> Result<(), RestoreError> {
        // Readers see Unavailable instead of a half-built map. If any record fails, the store stays
        // that way until a later restore succeeds.
        self.store.mark_degraded();
        self.store.reset()?;

        let mut restored = 0usize;
        for record in RecordDecoder::new(BytesMut::from(&snapshot[..])) {
            let record = record?;
            self.store.set(record.key, record.value)?;
            restored += 1;
        }

        self.store.mark_healthy();
        slog::info!(self.logger, "Restored {} keys from snapshot", restored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreLimits;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn machine() -> (KvStateMachine, Arc<KeyValueStore>) {
        let store = Arc::new(KeyValueStore::default());
        (KvStateMachine::new(logger(), store.clone()), store)
    }

    fn set(key: &str, value: &str) -> Bytes {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
        .encode()
    }

    fn delete(key: &str) -> Bytes {
        Command::Delete { key: key.into() }.encode()
    }

    #[test]
    fn same_entries_same_state() {
        let entries = vec![set("foo", "bar"), set("john", "doe"), delete("foo"), set("john", "smith")];

        let (mut a, store_a) = machine();
        let (mut b, store_b) = machine();
        for entry in &entries {
            a.apply_committed_entry(entry.clone()).unwrap();
            b.apply_committed_entry(entry.clone()).unwrap();
        }

        assert!(matches!(store_a.get("foo"), Err(StoreError::NotFound)));
        assert_eq!(store_a.get("john").unwrap(), "smith");
        assert_eq!(store_b.get("john").unwrap(), "smith");
        assert_eq!(store_a.len(), store_b.len());
    }

    #[test]
    fn delete_is_idempotent() {
        let (mut fsm, store) = machine();
        fsm.apply_committed_entry(set("foo", "bar")).unwrap();
        fsm.apply_committed_entry(delete("foo")).unwrap();
        fsm.apply_committed_entry(delete("foo")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn garbage_entry_is_rejected() {
        let (mut fsm, _) = machine();
        assert!(matches!(
            fsm.apply_committed_entry(Bytes::from_static(&[9, 1, 2])),
            Err(StoreError::InvalidCommand(_))
        ));
        assert!(fsm.apply_committed_entry(Bytes::new()).is_err());
    }

    #[test]
    fn snapshot_then_restore() {
        let (mut source, _) = machine();
        source.apply_committed_entry(set("foo", "bar")).unwrap();
        source.apply_committed_entry(set("john", "doe")).unwrap();
        let image = source.snapshot().unwrap();

        // Later writes don't leak into the frozen image.
        source.apply_committed_entry(set("late", "write")).unwrap();

        let (mut target, store) = machine();
        target.apply_committed_entry(set("stale", "key")).unwrap();
        target.restore(image).unwrap();

        assert_eq!(store.get("foo").unwrap(), "bar");
        assert_eq!(store.get("john").unwrap(), "doe");
        assert!(matches!(store.get("stale"), Err(StoreError::NotFound)));
        assert!(matches!(store.get("late"), Err(StoreError::NotFound)));
        assert!(!store.is_degraded());
    }

    #[test]
    fn corrupt_restore_leaves_store_unavailable() {
        let (mut source, _) = machine();
        source.apply_committed_entry(set("foo", "bar")).unwrap();
        source.apply_committed_entry(set("john", "doe")).unwrap();
        let image = source.snapshot().unwrap();
        let truncated = image.slice(..image.len() - 1);

        let (mut target, store) = machine();
        assert!(matches!(target.restore(truncated), Err(RestoreError::Corrupt(_))));
        assert!(matches!(store.get("foo"), Err(StoreError::Unavailable(_))));
        assert!(target.snapshot().is_err());

        // A good restore recovers.
        target.restore(image).unwrap();
        assert_eq!(store.get("foo").unwrap(), "bar");
    }

    #[test]
    fn restore_rejects_oversized_record() {
        let roomy = Arc::new(KeyValueStore::new(logger(), StoreLimits {
            max_key_len: 64,
            max_value_len: 64,
        }));
        let mut source = KvStateMachine::new(logger(), roomy);
        source.apply_committed_entry(set(&"k".repeat(40), "v")).unwrap();
        let image = source.snapshot().unwrap();

        let (mut target, store) = machine();
        assert!(matches!(target.restore(image), Err(RestoreError::Rejected(_))));
        assert!(store.is_degraded());
    }
}
