use crate::commitlog::Index;
use crate::replica::{ClusterConfig, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// SnapshotMeta describes the log prefix a snapshot replaces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SnapshotMeta {
    pub(crate) last_included_term: Term,
    last_included_index: u64,
    pub(crate) config: ClusterConfig,
}

impl SnapshotMeta {
    pub(crate) fn new(last_included_term: Term, last_included_index: Index, config: ClusterConfig) -> Self {
        SnapshotMeta {
            last_included_term,
            last_included_index: last_included_index.as_u64(),
            config,
        }
    }

    pub(crate) fn last_included_index(&self) -> Index {
        Index::new(self.last_included_index)
    }
}

/// Snapshot is a state machine image plus its metadata. `data` is the store's framed records.
#[derive(Clone, Debug)]
pub(crate) struct Snapshot {
    pub(crate) meta: SnapshotMeta,
    pub(crate) data: Bytes,
}

/// SnapshotStore keeps the most recent snapshot durable. Older snapshots are pruned on save.
pub(crate) trait SnapshotStore: Send {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), io::Error>;
    fn load_latest(&self) -> Result<Option<Snapshot>, io::Error>;
}

#[derive(Default)]
pub(crate) struct InMemorySnapshotStore {
    latest: Option<Snapshot>,
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), io::Error> {
        self.latest.replace(snapshot.clone());
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<Snapshot>, io::Error> {
        Ok(self.latest.clone())
    }
}

const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".snap";
const TEMP_FILE_NAME: &str = "snapshot.tmp";

/// FileSnapshotStore writes one file per snapshot:
///
/// ```text
/// +----------------+---------------------+-------------+------------------+
/// | MetaLen u32 BE | Meta (bincode)      | CRC32 u32 BE| Data             |
/// +----------------+---------------------+-------------+------------------+
/// ```
///
/// The CRC covers `Data`. Files are named by term and index, zero padded so that lexical order is
/// snapshot order. Writes go to a temp file that is renamed into place.
pub(crate) struct FileSnapshotStore {
    logger: slog::Logger,
    directory: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    pub(crate) fn open<P: AsRef<Path>>(logger: slog::Logger, directory: P, retain: usize) -> Result<Self, io::Error> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        Ok(FileSnapshotStore {
            logger,
            directory,
            retain: retain.max(1),
        })
    }

    fn file_name(meta: &SnapshotMeta) -> String {
        format!(
            "{}{:020}-{:020}{}",
            FILE_PREFIX,
            meta.last_included_term.as_u64(),
            meta.last_included_index,
            FILE_SUFFIX
        )
    }

    fn list(&self) -> Result<Vec<PathBuf>, io::Error> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
                .unwrap_or(false);
            if is_snapshot {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn encode(snapshot: &Snapshot) -> Result<BytesMut, io::Error> {
        let meta = bincode::serialize(&snapshot.meta).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut buf = BytesMut::with_capacity(4 + meta.len() + 4 + snapshot.data.len());
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put_u32(crc32fast::hash(&snapshot.data));
        buf.put_slice(&snapshot.data);
        Ok(buf)
    }

    fn decode(bytes: Vec<u8>) -> Result<Snapshot, io::Error> {
        let corrupt = |reason: &str| io::Error::new(io::ErrorKind::InvalidData, format!("Corrupt snapshot file: {}", reason));

        let mut buf = Bytes::from(bytes);
        if buf.remaining() < 4 {
            return Err(corrupt("missing metadata length"));
        }
        let meta_len = buf.get_u32() as usize;
        if buf.remaining() < meta_len + 4 {
            return Err(corrupt("truncated metadata"));
        }
        let meta: SnapshotMeta =
            bincode::deserialize(&buf.split_to(meta_len)).map_err(|e| corrupt(&e.to_string()))?;
        if meta.last_included_index == 0 {
            return Err(corrupt("index 0"));
        }

        let expected_crc = buf.get_u32();
        if crc32fast::hash(&buf) != expected_crc {
            return Err(corrupt("checksum mismatch"));
        }

        Ok(Snapshot { meta, data: buf })
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), io::Error> {
        let bytes = Self::encode(snapshot)?;

        let temp_path = self.directory.join(TEMP_FILE_NAME);
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.directory.join(Self::file_name(&snapshot.meta)))?;

        let paths = self.list()?;
        if paths.len() > self.retain {
            for stale in &paths[..paths.len() - self.retain] {
                if let Err(e) = fs::remove_file(stale) {
                    slog::warn!(self.logger, "Failed to prune snapshot {:?}: {}", stale, e);
                }
            }
        }

        slog::info!(
            self.logger,
            "Saved snapshot through {:?} ({} bytes)",
            snapshot.meta.last_included_index(),
            snapshot.data.len()
        );
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<Snapshot>, io::Error> {
        // Newest first. Fall back to an older one if the newest is unreadable.
        for path in self.list()?.iter().rev() {
            match fs::read(path).and_then(Self::decode) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => slog::warn!(self.logger, "Skipping unreadable snapshot {:?}: {}", path, e),
            }
        }
        Ok(None)
    }
}
