//! SQLite index over raw NDJSON logs.
//!
//! The raw files stay the source of truth; every row here is derived and
//! can be rebuilt with a full reindex. Two tables: `log_entries` holds
//! one row per parsed line, `log_fields` holds one row per extracted
//! top-level scalar for filtering and grouping.

use std::path::Path;

use mikroscope_db::{create_pool, DbConfig, DbPool, DbRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::types::{
    now_iso, AggregateBucket, EntryFilter, GroupBy, LogEntry, NewEntry, PageCursor, PruneReport,
    QueryPage, StoreStats, UpsertOutcome,
};

/// Entries are unique per `(source_file, line_number)`; reindexing the
/// same tree is a no-op. Fields cascade with their entry.
const SCHEMA_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    event TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    is_audit INTEGER NOT NULL DEFAULT 0,
    data_json TEXT NOT NULL,
    source_file TEXT NOT NULL,
    line_number INTEGER NOT NULL,
    indexed_at TEXT NOT NULL,
    UNIQUE(source_file, line_number)
);

CREATE TABLE IF NOT EXISTS log_fields (
    entry_id INTEGER NOT NULL REFERENCES log_entries(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value_text TEXT NOT NULL,
    UNIQUE(entry_id, key, value_text)
);
"#;

/// Index creation runs after the `is_audit` migration so legacy tables
/// can be indexed on the added column.
const SCHEMA_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON log_entries(timestamp);
CREATE INDEX IF NOT EXISTS idx_entries_level_ts ON log_entries(level, timestamp);
CREATE INDEX IF NOT EXISTS idx_entries_event_ts ON log_entries(event, timestamp);
CREATE INDEX IF NOT EXISTS idx_entries_audit_ts ON log_entries(is_audit, timestamp);
CREATE INDEX IF NOT EXISTS idx_fields_key_value ON log_fields(key, value_text);
CREATE INDEX IF NOT EXISTS idx_fields_entry_key ON log_fields(entry_id, key);
"#;

/// Hard bounds the store enforces regardless of what callers clamp.
const MIN_LIMIT: i64 = 1;
const MAX_LIMIT: i64 = 1000;

/// Index store over a shared SQLite pool.
#[derive(Clone)]
pub struct IndexStore {
    pool: DbPool,
}

impl IndexStore {
    /// Open or create the index database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = create_pool(DbConfig::sqlite(path)?).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = create_pool(DbConfig::sqlite_memory()).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying schema and migrations.
    pub async fn from_pool(pool: DbPool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA_TABLES_SQL).execute(&pool).await?;
        migrate_is_audit(&pool).await?;
        sqlx::raw_sql(SCHEMA_INDEXES_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Close the underlying pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert an entry, or return the existing row id if the
    /// `(source_file, line_number)` pair is already indexed.
    pub async fn upsert_entry(&self, entry: &NewEntry) -> Result<UpsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO log_entries
                (timestamp, level, event, message, is_audit, data_json, source_file, line_number, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_file, line_number) DO NOTHING
            "#,
        )
        .bind(&entry.timestamp)
        .bind(&entry.level)
        .bind(&entry.event)
        .bind(&entry.message)
        .bind(entry.is_audit as i64)
        .bind(&entry.data_json)
        .bind(&entry.source_file)
        .bind(entry.line_number)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(UpsertOutcome {
                entry_id: result.last_insert_rowid(),
                inserted: true,
            });
        }

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM log_entries WHERE source_file = ? AND line_number = ?",
        )
        .bind(&entry.source_file)
        .bind(entry.line_number)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            entry_id: id,
            inserted: false,
        })
    }

    /// Idempotent field insert.
    pub async fn upsert_field(&self, entry_id: i64, key: &str, value_text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO log_fields (entry_id, key, value_text)
            VALUES (?, ?, ?)
            ON CONFLICT(entry_id, key, value_text) DO NOTHING
            "#,
        )
        .bind(entry_id)
        .bind(key)
        .bind(value_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Purge every row derived from one source file. Used when the
    /// indexer detects an in-place rewrite. One transaction.
    pub async fn delete_entries_for_source_file(&self, source_file: &str) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;

        let fields = sqlx::query(
            "DELETE FROM log_fields WHERE entry_id IN (SELECT id FROM log_entries WHERE source_file = ?)",
        )
        .bind(source_file)
        .execute(&mut *tx)
        .await?;

        let entries = sqlx::query("DELETE FROM log_entries WHERE source_file = ?")
            .bind(source_file)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((entries.rows_affected(), fields.rows_affected()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// One page, ordered `(timestamp DESC, id DESC)`. Fetches `limit + 1`
    /// rows to detect whether a further page exists.
    pub async fn query_page(
        &self,
        filter: &EntryFilter,
        cursor: Option<&PageCursor>,
        limit: i64,
    ) -> Result<QueryPage> {
        let limit = limit.clamp(MIN_LIMIT, MAX_LIMIT);

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT e.id, e.timestamp, e.level, e.event, e.message, e.is_audit, \
             e.data_json, e.source_file, e.line_number, e.indexed_at FROM log_entries e",
        );
        push_filter_join(&mut qb, filter);
        qb.push(" WHERE 1=1");
        push_filter_where(&mut qb, filter);

        if let Some(cursor) = cursor {
            qb.push(" AND (e.timestamp < ");
            qb.push_bind(&cursor.timestamp);
            qb.push(" OR (e.timestamp = ");
            qb.push_bind(&cursor.timestamp);
            qb.push(" AND e.id < ");
            qb.push_bind(cursor.id);
            qb.push("))");
        }

        qb.push(" ORDER BY e.timestamp DESC, e.id DESC LIMIT ");
        qb.push_bind(limit + 1);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut entries = rows
            .iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>>>()?;

        let has_more = entries.len() as i64 > limit;
        if has_more {
            entries.truncate(limit as usize);
        }

        Ok(QueryPage {
            entries,
            has_more,
            limit,
        })
    }

    /// Count entries matching a filter.
    pub async fn count(&self, filter: &EntryFilter) -> Result<i64> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(DISTINCT e.id) FROM log_entries e");
        push_filter_join(&mut qb, filter);
        qb.push(" WHERE 1=1");
        push_filter_where(&mut qb, filter);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Grouped counts ordered `count DESC, key ASC`.
    ///
    /// `group_field` is required for [`GroupBy::Field`]; entries missing
    /// the field land in the `"(missing)"` bucket.
    pub async fn aggregate(
        &self,
        filter: &EntryFilter,
        group_by: GroupBy,
        group_field: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AggregateBucket>> {
        let limit = limit.clamp(MIN_LIMIT, MAX_LIMIT);

        let key_expr = match group_by {
            GroupBy::Level => "e.level",
            GroupBy::Event => "e.event",
            GroupBy::Field => "COALESCE(gf.value_text, '(missing)')",
            GroupBy::Correlation => "COALESCE(gc.value_text, gr.value_text, '(missing)')",
        };

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {key_expr} AS bucket_key, COUNT(DISTINCT e.id) AS bucket_count FROM log_entries e"
        ));
        push_filter_join(&mut qb, filter);

        match group_by {
            GroupBy::Field => {
                let field = group_field
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| {
                        IndexError::InvalidQuery(
                            "groupBy=field requires a non-empty groupField".to_string(),
                        )
                    })?;
                qb.push(" LEFT JOIN log_fields gf ON gf.entry_id = e.id AND gf.key = ");
                qb.push_bind(field.to_string());
            }
            GroupBy::Correlation => {
                qb.push(
                    " LEFT JOIN log_fields gc ON gc.entry_id = e.id AND gc.key = 'correlationId'",
                );
                qb.push(
                    " LEFT JOIN log_fields gr ON gr.entry_id = e.id AND gr.key = 'requestId'",
                );
            }
            GroupBy::Level | GroupBy::Event => {}
        }

        qb.push(" WHERE 1=1");
        push_filter_where(&mut qb, filter);
        qb.push(" GROUP BY bucket_key ORDER BY bucket_count DESC, bucket_key ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(AggregateBucket {
                    key: row.try_get("bucket_key")?,
                    count: row.try_get("bucket_count")?,
                })
            })
            .collect()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Delete rows past their retention horizon. Field rows go first so
    /// the entry deletes don't fan out through the cascade. `None`
    /// disables that horizon.
    pub async fn prune_by_retention(
        &self,
        normal_cutoff_iso: Option<&str>,
        audit_cutoff_iso: Option<&str>,
    ) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let mut tx = self.pool.begin().await?;

        for (cutoff, is_audit) in [(normal_cutoff_iso, 0i64), (audit_cutoff_iso, 1i64)] {
            let Some(cutoff) = cutoff else { continue };

            let fields = sqlx::query(
                "DELETE FROM log_fields WHERE entry_id IN \
                 (SELECT id FROM log_entries WHERE is_audit = ? AND timestamp < ?)",
            )
            .bind(is_audit)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

            let entries =
                sqlx::query("DELETE FROM log_entries WHERE is_audit = ? AND timestamp < ?")
                    .bind(is_audit)
                    .bind(cutoff)
                    .execute(&mut *tx)
                    .await?;

            report.fields_deleted += fields.rows_affected();
            report.entries_deleted += entries.rows_affected();
        }

        tx.commit().await?;

        if report.entries_deleted > 0 {
            debug!(
                entries = report.entries_deleted,
                fields = report.fields_deleted,
                "pruned expired index rows"
            );
        }
        Ok(report)
    }

    /// Compact the database file. Callers trigger this only after rows
    /// or raw files were actually removed.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Full wipe, used by manual reindex.
    pub async fn reset(&self) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let fields = sqlx::query("DELETE FROM log_fields")
            .execute(&mut *tx)
            .await?;
        let entries = sqlx::query("DELETE FROM log_entries")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((entries.rows_affected(), fields.rows_affected()))
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let entry_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_entries")
            .fetch_one(&self.pool)
            .await?;
        let field_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_fields")
            .fetch_one(&self.pool)
            .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            entry_count,
            field_count,
            page_count,
            page_size,
            approx_size_bytes: page_count.saturating_mul(page_size),
        })
    }
}

/// Append the field-predicate join, if the filter has one.
fn push_filter_join(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EntryFilter) {
    if let Some((key, value)) = &filter.field {
        qb.push(" JOIN log_fields ff ON ff.entry_id = e.id AND ff.key = ");
        qb.push_bind(key.clone());
        qb.push(" AND ff.value_text = ");
        qb.push_bind(value.clone());
    }
}

/// Append the scalar WHERE predicates. Callers have already emitted
/// `WHERE 1=1`.
fn push_filter_where(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EntryFilter) {
    if let Some(from) = &filter.from {
        qb.push(" AND e.timestamp >= ");
        qb.push_bind(from.clone());
    }
    if let Some(to) = &filter.to {
        qb.push(" AND e.timestamp <= ");
        qb.push_bind(to.clone());
    }
    if let Some(level) = &filter.level {
        qb.push(" AND e.level = ");
        qb.push_bind(level.to_uppercase());
    }
    if let Some(audit) = filter.audit {
        qb.push(" AND e.is_audit = ");
        qb.push_bind(audit as i64);
    }
}

fn row_to_entry(row: &DbRow) -> Result<LogEntry> {
    Ok(LogEntry {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        level: row.try_get("level")?,
        event: row.try_get("event")?,
        message: row.try_get("message")?,
        is_audit: row.try_get::<i64, _>("is_audit")? != 0,
        data_json: row.try_get("data_json")?,
        source_file: row.try_get("source_file")?,
        line_number: row.try_get("line_number")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

/// Older databases predate the audit flag; add it defaulted to 0 so
/// existing rows stay queryable. Subsequent inserts set the real value.
async fn migrate_is_audit(pool: &DbPool) -> Result<()> {
    let columns = sqlx::query("PRAGMA table_info(log_entries)")
        .fetch_all(pool)
        .await?;
    let has_is_audit = columns
        .iter()
        .any(|row| row.try_get::<String, _>("name").map(|n| n == "is_audit").unwrap_or(false));
    if !has_is_audit {
        sqlx::query("ALTER TABLE log_entries ADD COLUMN is_audit INTEGER NOT NULL DEFAULT 0")
            .execute(pool)
            .await?;
        debug!("migrated log_entries: added is_audit column");
    }
    Ok(())
}
