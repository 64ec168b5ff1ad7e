use crate::snapshot::{Record, RecordCodec};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::io;
use std::vec;
use tokio_util::codec::Encoder;

/// SnapshotStream is a single pass over a store's contents, yielding one encoded frame per
/// key/value pair. Frames are produced lazily, so the full image is never materialized unless the
/// caller asks for it with `into_bytes()`.
///
/// The key set is copied when the stream is created, and each value is read as its frame is
/// produced. No lock on the store is held between calls to `next()`, so a paused stream never
/// blocks writers. Keys deleted after the stream was created are skipped, and keys added after it
/// are not included.
pub struct SnapshotStream<'a> {
    logger: slog::Logger,
    data: &'a DashMap<String, String>,
    keys: vec::IntoIter<String>,
    codec: RecordCodec,
    buf: BytesMut,
    error: Option<io::Error>,
}

impl<'a> SnapshotStream<'a> {
    pub(crate) fn new(logger: slog::Logger, data: &'a DashMap<String, String>) -> Self {
        let keys: Vec<String> = data.iter().map(|entry| entry.key().clone()).collect();
        SnapshotStream {
            logger,
            data,
            keys: keys.into_iter(),
            codec: RecordCodec::new(),
            buf: BytesMut::new(),
            error: None,
        }
    }

    /// Drains the stream into one contiguous, owned buffer. The result is decoupled from the store.
    pub fn into_bytes(self) -> Bytes {
        let mut out = BytesMut::new();
        for frame in self {
            out.extend_from_slice(&frame);
        }
        out.freeze()
    }

    /// Like `into_bytes()`, but fails instead of returning a truncated image if a record couldn't
    /// be framed.
    pub(crate) fn try_into_bytes(mut self) -> Result<Bytes, io::Error> {
        let mut out = BytesMut::new();
        while let Some(frame) = self.next() {
            out.extend_from_slice(&frame);
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(out.freeze()),
        }
    }
}

impl<'a> Iterator for SnapshotStream<'a> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.error.is_some() {
            return None;
        }

        loop {
            let key = self.keys.next()?;
            // The shard guard is dropped before encoding.
            let value = match self.data.get(&key).map(|entry| entry.value().clone()) {
                Some(value) => value,
                None => continue,
            };

            return match self.codec.encode(Record::new(key, value), &mut self.buf) {
                Ok(()) => Some(self.buf.split().freeze()),
                Err(e) => {
                    slog::error!(self.logger, "Failed to frame snapshot record, ending stream: {}", e);
                    self.error = Some(e);
                    None
                }
            };
        }
    }
}
