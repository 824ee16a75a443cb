//! Derived index over a tree of raw NDJSON log files.
//!
//! The raw files are the source of truth. [`IndexStore`] maintains the
//! relational view (entries plus extracted scalar fields) and
//! [`Indexer`] keeps it current with restartable incremental passes.

pub mod error;
pub mod indexer;
pub mod normalize;
pub mod store;
pub mod types;

pub use error::{IndexError, Result};
pub use indexer::Indexer;
pub use store::IndexStore;
pub use types::{
    now_iso, to_iso, AggregateBucket, CursorMap, EntryFilter, FileCursor, GroupBy, IndexMode,
    IndexReport, LogEntry, NewEntry, PageCursor, PruneReport, QueryPage, StoreStats, UpsertOutcome,
};
