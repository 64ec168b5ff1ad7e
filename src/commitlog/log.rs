use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Returns None for 0, which is how the wire format encodes "no index".
    pub fn from_u64(index: u64) -> Option<Self> {
        if index == 0 {
            None
        } else {
            Some(Self::new(index))
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64()
            .checked_sub(delta)
            .and_then(Index::from_u64)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. Once a prefix of the log has been compacted, the log starts at
/// `first_index()` instead, and reads below it return `None`.
pub trait Log<E: Entry>: Send {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes everything up to and including `index`. The next `first_index()` is `index + 1`.
    fn compact(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes every entry and restarts the log so that the next append lands on `next_index`.
    fn reset(&mut self, next_index: Index) -> Result<(), io::Error>;

    /// first_index returns the index of the oldest entry that's still readable (or would be, once
    /// something is appended).
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

// Choice of Vec<u8> vs Bytes will depend on whats easier for disk to use.
pub trait Entry: Clone + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = io::Error> + Send {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let index = Index::new(5);
        assert_eq!(index.plus(2), Index::new(7));
        assert_eq!(index.checked_minus(4), Some(Index::new(1)));
        assert_eq!(index.checked_minus(5), None);
        assert_eq!(index.checked_minus(9), None);
        assert_eq!(Index::from_u64(0), None);
        assert_eq!(Index::from_u64(3), Some(Index::new(3)));
    }

    #[test]
    #[should_panic]
    fn index_zero_is_illegal() {
        Index::new(0);
    }
}
