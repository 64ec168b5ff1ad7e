use crate::commitlog::{Entry, Index, Log};
use bytes::{Buf, BufMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

// File layout:
//
// ```text
// +-------+-----+---------------------+
// | Magic | Vrs | First index (u64 BE) |   header, written once per file
// +-------+-----+---------------------+
// | CRC32 (u32 BE) | Size (u32 BE) | Data ... |   one record per entry, repeated
// +----------------+---------------+----------+
// ```
//
// Compaction and reset rewrite the whole file into a temp file and rename it over the old one, so
// the first index in the header always agrees with the records that follow it. A torn write at
// the tail (short record or CRC mismatch) is cut off when the log is reopened.
const MAGIC: &[u8; 4] = b"RKVL";
const FILE_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 8;
const RECORD_HEADER_LEN: usize = 4 + 4;

const LOG_FILE_NAME: &str = "log";
const TEMP_LOG_FILE_NAME: &str = "log.tmp";

/// FileLog is a durable log backed by a single append-only file. Entries are also kept in memory,
/// since a compacted raft log is expected to stay small.
pub struct FileLog<E: Entry> {
    directory: PathBuf,
    file: File,
    first_index: Index,
    entries: Vec<Vec<u8>>,
    // File offset where each entry's record starts. Same length as `entries`.
    offsets: Vec<u64>,
    _pd: PhantomData<E>,
}

impl<E: Entry> FileLog<E> {
    /// Opens the log in `directory`, creating an empty one if none exists.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self, io::Error> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let path = directory.join(LOG_FILE_NAME);
        if !path.exists() {
            write_log_file(&directory, Index::start_index(), &[])?;
        }

        let contents = fs::read(&path)?;
        let (first_index, entries, offsets, valid_len) = parse_log_file(&contents)?;

        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        if valid_len < contents.len() as u64 {
            // Torn tail from a crash mid-append.
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(FileLog {
            directory,
            file,
            first_index,
            entries,
            offsets,
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }

    fn end_offset(&self) -> u64 {
        match (self.offsets.last(), self.entries.last()) {
            (Some(offset), Some(data)) => offset + (RECORD_HEADER_LEN + data.len()) as u64,
            _ => HEADER_LEN as u64,
        }
    }

    fn rewrite(&mut self, first_index: Index, entries: Vec<Vec<u8>>) -> Result<(), io::Error> {
        let offsets = write_log_file(&self.directory, first_index, &entries)?;
        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.directory.join(LOG_FILE_NAME))?;
        self.first_index = first_index;
        self.entries = entries;
        self.offsets = offsets;

        Ok(())
    }
}

impl<E: Entry> Log<E> for FileLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        let data: Vec<u8> = entry.into();
        let offset = self.end_offset();

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
        encode_record(&mut record, &data);
        self.file.write_all(&record)?;
        self.file.sync_data()?;

        self.entries.push(data);
        self.offsets.push(offset);

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.entries.get(i)) {
            None => Ok(None),
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = self.vec_index(index).unwrap_or(0);
        if vec_index >= self.entries.len() {
            return Ok(());
        }

        self.file.set_len(self.offsets[vec_index])?;
        self.file.sync_all()?;
        self.entries.truncate(vec_index);
        self.offsets.truncate(vec_index);

        Ok(())
    }

    fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        if index < self.first_index {
            return Ok(());
        }

        let num_to_drop = ((index.as_u64() - self.first_index.as_u64() + 1) as usize).min(self.entries.len());
        let remaining = self.entries.split_off(num_to_drop);
        self.rewrite(index.plus(1), remaining)
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.rewrite(next_index, Vec::new())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.entries.len() as u64)
    }
}

fn encode_record(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32(crc32fast::hash(data));
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Writes a complete log file to a temp path and atomically renames it into place. Returns the
/// record offsets of `entries`.
fn write_log_file(directory: &Path, first_index: Index, entries: &[Vec<u8>]) -> Result<Vec<u64>, io::Error> {
    let mut contents = Vec::with_capacity(HEADER_LEN);
    contents.put_slice(MAGIC);
    contents.put_u8(FILE_FORMAT_VERSION);
    contents.put_u64(first_index.as_u64());

    let mut offsets = Vec::with_capacity(entries.len());
    for data in entries {
        offsets.push(contents.len() as u64);
        encode_record(&mut contents, data);
    }

    let temp_path = directory.join(TEMP_LOG_FILE_NAME);
    let mut temp_file = File::create(&temp_path)?;
    temp_file.write_all(&contents)?;
    temp_file.sync_all()?;
    fs::rename(&temp_path, directory.join(LOG_FILE_NAME))?;

    Ok(offsets)
}

/// Returns (first index, entries, offsets, length of the valid prefix of the file).
fn parse_log_file(contents: &[u8]) -> Result<(Index, Vec<Vec<u8>>, Vec<u64>, u64), io::Error> {
    let mut buf = contents;
    if buf.remaining() < HEADER_LEN || &buf[..4] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Log file has an invalid header"));
    }
    buf.advance(4);

    let version = buf.get_u8();
    if version != FILE_FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported log file version {}", version),
        ));
    }

    let first_index = Index::from_u64(buf.get_u64())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Log file has first index 0"))?;

    let mut entries = Vec::new();
    let mut offsets = Vec::new();
    let mut offset = HEADER_LEN as u64;
    while buf.remaining() >= RECORD_HEADER_LEN {
        let crc = buf.get_u32();
        let size = buf.get_u32() as usize;
        if buf.remaining() < size {
            break;
        }

        let data = &buf[..size];
        if crc32fast::hash(data) != crc {
            break;
        }

        entries.push(data.to_vec());
        offsets.push(offset);
        buf.advance(size);
        offset += (RECORD_HEADER_LEN + size) as u64;
    }

    Ok((first_index, entries, offsets, offset))
}
