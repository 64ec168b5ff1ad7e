use crate::snapshot::SnapshotStream;
use crate::store::StoreError;
use async_trait::async_trait;

/// KeyValueDb is anything that can serve the key-value API. Front-ends are written against this,
/// so they work the same over a single local store or a replicated one.
#[async_trait]
pub trait KeyValueDb: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    async fn set(&self, key: String, value: String) -> Result<(), StoreError>;

    async fn delete(&self, key: String) -> Result<(), StoreError>;

    /// Full-state export, framed the same way as snapshots.
    fn read_all(&self) -> SnapshotStream<'_>;
}
