//! Core types shared by the index store and the incremental indexer.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One indexed log record, as returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub event: String,
    pub message: String,
    pub is_audit: bool,
    /// The full original JSON object, serialized.
    pub data_json: String,
    /// Path relative to the logs root, forward-slash normalized.
    pub source_file: String,
    /// 1-based line number within the source file.
    pub line_number: i64,
    pub indexed_at: String,
}

/// Input for `upsert_entry`. `(source_file, line_number)` is the
/// idempotency key; a duplicate pair returns the existing row.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub timestamp: String,
    pub level: String,
    pub event: String,
    pub message: String,
    pub is_audit: bool,
    pub data_json: String,
    pub source_file: String,
    pub line_number: i64,
}

/// Result of an entry upsert.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub entry_id: i64,
    pub inserted: bool,
}

/// Filter over entries. All predicates are conjunctive; at most one
/// field predicate is supported.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Inclusive ISO lower bound on `timestamp`.
    pub from: Option<String>,
    /// Inclusive ISO upper bound on `timestamp`.
    pub to: Option<String>,
    /// Exact level match; normalized to upper case before comparison.
    pub level: Option<String>,
    pub audit: Option<bool>,
    /// Exact `key = value` match against extracted fields.
    pub field: Option<(String, String)>,
}

impl EntryFilter {
    pub fn is_empty(&self) -> bool {
        self.from.is_none()
            && self.to.is_none()
            && self.level.is_none()
            && self.audit.is_none()
            && self.field.is_none()
    }
}

/// Keyset cursor for `(timestamp DESC, id DESC)` pagination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCursor {
    pub id: i64,
    pub timestamp: String,
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub entries: Vec<LogEntry>,
    pub has_more: bool,
    /// The limit actually applied after clamping.
    pub limit: i64,
}

/// Grouping dimension for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Level,
    Event,
    /// Group by an extracted field; requires a group field name.
    Field,
    /// Group by `correlationId`, falling back to `requestId`.
    Correlation,
}

impl GroupBy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "level" => Some(Self::Level),
            "event" => Some(Self::Event),
            "field" => Some(Self::Field),
            "correlation" => Some(Self::Correlation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Event => "event",
            Self::Field => "field",
            Self::Correlation => "correlation",
        }
    }
}

/// One aggregation bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateBucket {
    pub key: String,
    pub count: i64,
}

/// Outcome of a retention prune.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub entries_deleted: u64,
    pub fields_deleted: u64,
}

/// Storage statistics for the health report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub entry_count: i64,
    pub field_count: i64,
    pub page_count: i64,
    pub page_size: i64,
    pub approx_size_bytes: i64,
}

/// Indexing mode for a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Full,
    Incremental,
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Report for one indexing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub files_scanned: u64,
    pub lines_scanned: u64,
    pub records_inserted: u64,
    /// Duplicate `(source_file, line_number)` pairs.
    pub records_skipped: u64,
    pub parse_errors: u64,
    pub started_at: String,
    pub finished_at: String,
    pub mode: IndexMode,
}

/// Per-file checkpoint for incremental passes. In-memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCursor {
    /// End of the last fully-consumed line.
    pub byte_offset: u64,
    pub file_size: u64,
    pub last_line_number: i64,
    /// File mtime in milliseconds at the checkpoint.
    pub mtime_ms: i64,
}

/// Cursor map keyed by absolute file path.
pub type CursorMap = HashMap<PathBuf, FileCursor>;

/// Current wall-clock time as the canonical ISO string used everywhere
/// in the index: RFC 3339 UTC with millisecond precision, so that
/// lexicographic comparison matches chronological order.
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

/// Canonical ISO rendering for any UTC instant.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
