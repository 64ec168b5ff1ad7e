use crate::commitlog::{Entry, Index, Log};
use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog is a volatile log, used when a node runs without a data directory.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: VecDeque<Vec<u8>>,
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: VecDeque::new(),
            first_index: Index::start_index(),
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
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push_back(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.vec_index(index).and_then(|i| self.log.get(i)) {
            None => Ok(None),
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        match self.vec_index(index) {
            Some(vec_index) => self.log.truncate(vec_index),
            None => self.log.clear(),
        }

        Ok(())
    }

    fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        if index < self.first_index {
            return Ok(());
        }

        let num_to_drop = (index.as_u64() - self.first_index.as_u64() + 1) as usize;
        self.log.drain(..num_to_drop.min(self.log.len()));
        self.first_index = index.plus(1);

        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.log.clear();
        self.first_index = next_index;

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}
