use crate::snapshot::Record;
use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

// Frame layout, repeated until end of stream:
//
// ```text
// +-----------------------+------------------------+
// | Length (u32 BE)       | Record (protobuf)      |
// +-----------------------+------------------------+
// ```
//
// There is no terminator. This format is shared by raft snapshots and full-state exports, so it
// must not change.
const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CorruptSnapshot {
    #[error("Snapshot frame declares {declared} bytes but only {available} remain")]
    TruncatedFrame { declared: usize, available: usize },

    #[error("Snapshot ends inside a length prefix ({0} of 4 bytes)")]
    TruncatedLength(usize),

    #[error("Snapshot frame is not a valid record: {0}")]
    InvalidRecord(#[from] prost::DecodeError),

    #[error("I/O error while reading snapshot: {0}")]
    Io(#[from] io::Error),
}

/// RecordCodec frames records for snapshots. It can be plugged into `tokio_util::codec::Framed*`
/// to stream records over any async reader or writer.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn new() -> Self {
        RecordCodec
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, record: Record, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = record.encoded_len();
        if len > u32::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Record too large to frame"));
        }

        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_u32(len as u32);
        record
            .encode(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = CorruptSnapshot;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        // Peek, so a partial frame stays in the buffer until the rest arrives.
        let declared = (&src[..LENGTH_PREFIX_LEN]).get_u32() as usize;
        let frame_len = LENGTH_PREFIX_LEN + declared;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(declared).freeze();
        Ok(Some(Record::decode(payload)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }

        // Anything left over is a frame that can never complete.
        match src.len() {
            0 => Ok(None),
            n if n < LENGTH_PREFIX_LEN => Err(CorruptSnapshot::TruncatedLength(n)),
            n => Err(CorruptSnapshot::TruncatedFrame {
                declared: (&src[..LENGTH_PREFIX_LEN]).get_u32() as usize,
                available: n - LENGTH_PREFIX_LEN,
            }),
        }
    }
}

/// RecordDecoder is a forward-only scan over a complete snapshot. It yields records until the end
/// of the stream, or a single `CorruptSnapshot` error after which it yields nothing.
pub struct RecordDecoder {
    codec: RecordCodec,
    buf: BytesMut,
    done: bool,
}

impl RecordDecoder {
    pub fn new(buf: BytesMut) -> Self {
        RecordDecoder {
            codec: RecordCodec::new(),
            buf,
            done: false,
        }
    }
}

impl From<&[u8]> for RecordDecoder {
    fn from(bytes: &[u8]) -> Self {
        Self::new(BytesMut::from(bytes))
    }
}

impl Iterator for RecordDecoder {
    type Item = Result<Record, CorruptSnapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.codec.decode_eof(&mut self.buf) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
