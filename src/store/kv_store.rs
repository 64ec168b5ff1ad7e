use crate::snapshot::SnapshotStream;
use crate::store::{KeyValueDb, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Size bounds on keys and values, in bytes. Checked before anything is appended to the log so
/// that log entries and snapshot frames stay small.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreLimits {
    pub max_key_len: usize,
    pub max_value_len: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        StoreLimits {
            max_key_len: 15,
            max_value_len: 15,
        }
    }
}

impl StoreLimits {
    pub fn validate(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        if key.len() > self.max_key_len {
            return Err(StoreError::Validation {
                field: "Key",
                len: key.len(),
                max: self.max_key_len,
            });
        }
        if let Some(value) = value {
            if value.len() > self.max_value_len {
                return Err(StoreError::Validation {
                    field: "Value",
                    len: value.len(),
                    max: self.max_value_len,
                });
            }
        }

        Ok(())
    }
}

/// KeyValueStore is the in-memory map that committed commands are replayed onto. It has no
/// durability or ordering of its own.
///
/// The map is sharded, so readers and writers only ever contend on a single shard. Snapshot
/// streams take each shard lock only long enough to copy one key or value.
pub struct KeyValueStore {
    logger: slog::Logger,
    data: DashMap<String, String>,
    limits: StoreLimits,
    // Set while a restore is running, and left set if it fails part way.
    degraded: AtomicBool,
}

impl KeyValueStore {
    pub fn new(logger: slog::Logger, limits: StoreLimits) -> Self {
        KeyValueStore {
            logger,
            data: DashMap::new(),
            limits,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.check_available()?;
        self.data
            .get(key)
            .map(|value| value.value().clone())
            .ok_or(StoreError::NotFound)
    }

    pub fn set(&self, key: String, value: String) -> Result<(), StoreError> {
        self.limits.validate(&key, Some(&value))?;
        self.data.insert(key, value);
        Ok(())
    }

    /// Deleting a missing key is not an error.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.remove(key);
        Ok(())
    }

    pub fn snapshot(&self) -> SnapshotStream<'_> {
        SnapshotStream::new(self.logger.clone(), &self.data)
    }

    pub fn reset(&self) -> Result<(), StoreError> {
        self.data.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_healthy(&self) {
        self.degraded.store(false, Ordering::SeqCst);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.is_degraded() {
            Err(StoreError::Unavailable(String::from(
                "Store is restoring or failed to restore a snapshot",
            )))
        } else {
            Ok(())
        }
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new(slog::Logger::root(slog::Discard, slog::o!()), StoreLimits::default())
    }
}

#[async_trait]
impl KeyValueDb for KeyValueStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        KeyValueStore::get(self, key)
    }

    async fn set(&self, key: String, value: String) -> Result<(), StoreError> {
        KeyValueStore::set(self, key, value)
    }

    async fn delete(&self, key: String) -> Result<(), StoreError> {
        KeyValueStore::delete(self, &key)
    }

    fn read_all(&self) -> SnapshotStream<'_> {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Record, RecordDecoder};
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn set_get_delete_reset() {
        let store = KeyValueStore::default();

        store.set("foo".into(), "bar".into()).unwrap();
        store.set("john".into(), "doe".into()).unwrap();
        assert_eq!(store.get("foo").unwrap(), "bar");

        store.delete("foo").unwrap();
        assert!(matches!(store.get("foo"), Err(StoreError::NotFound)));
        assert_eq!(store.get("john").unwrap(), "doe");

        store.reset().unwrap();
        assert!(matches!(store.get("john"), Err(StoreError::NotFound)));
        assert!(store.is_empty());
    }

    #[test]
    fn delete_missing_key_is_ok() {
        let store = KeyValueStore::default();
        store.delete("nope").unwrap();
        store.delete("nope").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn set_overwrites() {
        let store = KeyValueStore::default();
        store.set("k".into(), "v1".into()).unwrap();
        store.set("k".into(), "v2".into()).unwrap();
        assert_eq!(store.get("k").unwrap(), "v2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn size_limits() {
        let store = KeyValueStore::default();

        store.set("a".repeat(15), "b".repeat(15)).unwrap();

        match store.set("a".repeat(16), "v".into()) {
            Err(StoreError::Validation { field, len, max }) => {
                assert_eq!((field, len, max), ("Key", 16, 15));
            }
            other => panic!("Unexpected {:?}", other),
        }
        assert!(matches!(
            store.set("k".into(), "b".repeat(16)),
            Err(StoreError::Validation { field: "Value", .. })
        ));
        assert!(matches!(store.get("k"), Err(StoreError::NotFound)));

        let roomy = KeyValueStore::new(slog::Logger::root(slog::Discard, slog::o!()), StoreLimits {
            max_key_len: 64,
            max_value_len: 1024,
        });
        roomy.set("a".repeat(64), "b".repeat(1024)).unwrap();
    }

    #[test]
    fn snapshot_contains_every_pair() {
        let store = KeyValueStore::default();
        store.set("foo".into(), "bar".into()).unwrap();
        store.set("john".into(), "doe".into()).unwrap();

        let frames: Vec<_> = store.snapshot().collect();
        assert_eq!(frames.len(), 2);

        let bytes = store.snapshot().into_bytes();
        let records: HashSet<Record> = RecordDecoder::from(&bytes[..]).map(|r| r.unwrap()).collect();
        let expected: HashSet<Record> = vec![Record::new("foo", "bar"), Record::new("john", "doe")]
            .into_iter()
            .collect();
        assert_eq!(records, expected);
    }

    #[test]
    fn frozen_snapshot_is_decoupled_from_later_writes() {
        let store = KeyValueStore::default();
        store.set("foo".into(), "bar".into()).unwrap();
        let frozen = store.snapshot().into_bytes();

        store.set("foo".into(), "baz".into()).unwrap();
        store.set("new".into(), "key".into()).unwrap();

        let records: Vec<Record> = RecordDecoder::from(&frozen[..]).map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![Record::new("foo", "bar")]);
    }

    #[test]
    fn paused_stream_does_not_block_writers() {
        let store = Arc::new(KeyValueStore::default());
        for i in 0..200 {
            store.set(format!("k{}", i), String::from("old")).unwrap();
        }

        let mut stream = store.snapshot();
        let first = stream.next().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.set(format!("k{}", i), String::from("new")).unwrap();
                }
                done_tx.send(()).unwrap();
            })
        };
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        writer.join().unwrap();

        // The rest of the stream reads values as it goes.
        let mut keys = HashSet::new();
        for frame in std::iter::once(first).chain(stream) {
            let record = RecordDecoder::from(&frame[..]).next().unwrap().unwrap();
            keys.insert(record.key);
        }
        assert_eq!(keys.len(), 200);
    }

    #[test]
    fn stream_skips_keys_deleted_after_it_started() {
        let store = KeyValueStore::default();
        store.set("foo".into(), "bar".into()).unwrap();
        store.set("john".into(), "doe".into()).unwrap();

        let stream = store.snapshot();
        store.delete("john").unwrap();
        store.set("late".into(), "key".into()).unwrap();

        let bytes = stream.try_into_bytes().unwrap();
        let records: Vec<Record> = RecordDecoder::from(&bytes[..]).map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![Record::new("foo", "bar")]);
    }

    #[test]
    fn degraded_store_rejects_reads() {
        let store = KeyValueStore::default();
        store.set("foo".into(), "bar".into()).unwrap();

        store.mark_degraded();
        assert!(matches!(store.get("foo"), Err(StoreError::Unavailable(_))));

        store.mark_healthy();
        assert_eq!(store.get("foo").unwrap(), "bar");
    }

    #[test]
    fn concurrent_writers_and_snapshots() {
        let store = Arc::new(KeyValueStore::default());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("t{}-{}", t, i % 20);
                        store.set(key.clone(), i.to_string()).unwrap();
                        if i % 3 == 0 {
                            store.delete(&key).unwrap();
                        }
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            let bytes = store.snapshot().into_bytes();
            for record in RecordDecoder::from(&bytes[..]) {
                record.unwrap();
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert!(store.len() <= 80);
    }

    #[tokio::test]
    async fn usable_through_trait_object() {
        let db: Box<dyn KeyValueDb> = Box::new(KeyValueStore::default());
        db.set("foo".into(), "bar".into()).await.unwrap();
        assert_eq!(db.get("foo").await.unwrap(), "bar");
        db.delete("foo".into()).await.unwrap();
        assert!(matches!(db.get("foo").await, Err(StoreError::NotFound)));
        assert_eq!(db.read_all().count(), 0);
    }
}
