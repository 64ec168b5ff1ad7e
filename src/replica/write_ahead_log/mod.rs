//! This module is a raft-specific commit log that wraps the generic commit log. It knows about
//! terms, entry kinds, commit and apply progress, and where the latest snapshot left off.

mod log;
mod log_entry;

pub(crate) use log::WriteAheadLog;
pub(crate) use log_entry::EntryKind;
pub(crate) use log_entry::WriteAheadLogEntry;
