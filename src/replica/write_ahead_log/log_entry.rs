use crate::commitlog;
use crate::grpc::ProtoLogEntryKind;
use crate::replica::Term;
use std::convert::TryFrom;
use std::io;

/// Byte representation:
///
/// ```text
/// |                                         1                               |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | 6 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|       Term (8 bytes)          |Knd|   Data (variable size)      ... |
/// +---+-------------------------------+---+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created, little endian
/// * `Knd` - what the data payload is, see [`EntryKind`]
/// * `Data` - payload; a KV command, an encoded cluster config, or nothing
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum EntryKind {
    Command,
    Config,
    /// Appended by every new leader so that it has an entry of its own term to commit.
    Noop,
}

impl EntryKind {
    fn to_byte(self) -> u8 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Config => 1,
            EntryKind::Noop => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EntryKind::Command),
            1 => Some(EntryKind::Config),
            2 => Some(EntryKind::Noop),
            _ => None,
        }
    }

    pub(crate) fn to_proto(self) -> i32 {
        let kind = match self {
            EntryKind::Command => ProtoLogEntryKind::Command,
            EntryKind::Config => ProtoLogEntryKind::Config,
            EntryKind::Noop => ProtoLogEntryKind::Noop,
        };
        kind as i32
    }

    pub(crate) fn from_proto(kind: i32) -> Option<Self> {
        match ProtoLogEntryKind::from_i32(kind)? {
            ProtoLogEntryKind::Command => Some(EntryKind::Command),
            ProtoLogEntryKind::Config => Some(EntryKind::Config),
            ProtoLogEntryKind::Noop => Some(EntryKind::Noop),
        }
    }
}

const FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 8 + 1;

impl WriteAheadLogEntry {
    pub(crate) fn command(term: Term, data: Vec<u8>) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::Command,
            data,
        }
    }

    pub(crate) fn config(term: Term, data: Vec<u8>) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::Config,
            data,
        }
    }

    pub(crate) fn noop(term: Term) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::Noop,
            data: Vec::new(),
        }
    }
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(mut bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid_data(format!("Log entry is {} bytes, shorter than its header", bytes.len())));
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(invalid_data(format!("Unknown log entry format version {}", bytes[0])));
        }

        let mut term_bytes = [0u8; 8];
        term_bytes.copy_from_slice(&bytes[1..9]);
        let kind = EntryKind::from_byte(bytes[9])
            .ok_or_else(|| invalid_data(format!("Unknown log entry kind {}", bytes[9])))?;

        Ok(WriteAheadLogEntry {
            term: Term::new(u64::from_le_bytes(term_bytes)),
            kind,
            data: bytes.split_off(HEADER_LEN),
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + entry.data.len());
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        bytes.push(entry.kind.to_byte());
        bytes.extend_from_slice(&entry.data);
        bytes
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
