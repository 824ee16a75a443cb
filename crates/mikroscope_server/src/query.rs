//! Thin query layer over the index store.
//!
//! Clamps limits, encodes and decodes the opaque pagination cursor, and
//! validates grouping arguments before delegating.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use mikroscope_index::{
    AggregateBucket, EntryFilter, GroupBy, IndexStore, LogEntry, PageCursor, QueryPage,
};

use crate::error::{AppError, AppResult};

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const DEFAULT_AGGREGATE_LIMIT: i64 = 25;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct QueryService {
    store: IndexStore,
}

impl QueryService {
    pub fn new(store: IndexStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// One page plus the encoded cursor for the next one, if any.
    /// Malformed cursors are treated as absent.
    pub async fn query_page(
        &self,
        filter: &EntryFilter,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<(QueryPage, Option<String>)> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_LIMIT);
        let decoded = cursor.and_then(decode_cursor);
        let page = self.store.query_page(filter, decoded.as_ref(), limit).await?;
        let next = if page.has_more {
            page.entries.last().map(encode_cursor)
        } else {
            None
        };
        Ok((page, next))
    }

    pub async fn aggregate(
        &self,
        filter: &EntryFilter,
        group_by: GroupBy,
        group_field: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<Vec<AggregateBucket>> {
        if group_by == GroupBy::Field && group_field.map_or(true, str::is_empty) {
            return Err(AppError::bad_request(
                "groupBy=field requires a non-empty groupField",
            ));
        }
        let limit = limit.unwrap_or(DEFAULT_AGGREGATE_LIMIT).clamp(1, MAX_LIMIT);
        Ok(self
            .store
            .aggregate(filter, group_by, group_field, limit)
            .await?)
    }

    pub async fn count(&self, filter: &EntryFilter) -> AppResult<i64> {
        Ok(self.store.count(filter).await?)
    }
}

/// base64url (no padding) of `{"id": …, "timestamp": …}`.
pub fn encode_cursor(entry: &LogEntry) -> String {
    let cursor = PageCursor {
        id: entry.id,
        timestamp: entry.timestamp.clone(),
    };
    let json = serde_json::to_vec(&cursor).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode an opaque cursor; any malformation yields `None` so the
/// caller falls back to the first page.
pub fn decode_cursor(raw: &str) -> Option<PageCursor> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}
