//! Restartable NDJSON tailer.
//!
//! Walks the logs root for `.ndjson` files and feeds parsed lines into
//! the index store. Incremental passes resume each file at its previous
//! byte checkpoint; a file that shrank, or whose size held steady while
//! its mtime moved, is treated as rewritten in place and has its rows
//! replaced.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::UNIX_EPOCH;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::normalize::{normalize_line, LineOutcome};
use crate::store::IndexStore;
use crate::types::{now_iso, CursorMap, FileCursor, IndexMode, IndexReport};

/// Incremental indexer with an in-memory cursor map.
///
/// The cursor map's mutex doubles as the single in-flight flag: passes
/// triggered while another is running short-circuit to `None`.
pub struct Indexer {
    store: IndexStore,
    logs_root: PathBuf,
    cursors: Mutex<CursorMap>,
    last_error: StdMutex<Option<String>>,
}

impl Indexer {
    pub fn new(store: IndexStore, logs_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            logs_root: logs_root.into(),
            cursors: Mutex::new(CursorMap::new()),
            last_error: StdMutex::new(None),
        }
    }

    pub fn logs_root(&self) -> &Path {
        &self.logs_root
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Last per-file error observed, for the health report.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    /// Run one pass. Returns `None` when another pass is in flight.
    pub async fn run(&self, mode: IndexMode) -> Result<Option<IndexReport>> {
        let Ok(mut cursors) = self.cursors.try_lock() else {
            debug!("index pass already running, skipping");
            return Ok(None);
        };

        let started_at = now_iso();
        let files = collect_ndjson_files(&self.logs_root);

        let mut report = IndexReport {
            files_scanned: 0,
            lines_scanned: 0,
            records_inserted: 0,
            records_skipped: 0,
            parse_errors: 0,
            started_at,
            finished_at: String::new(),
            mode,
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        for path in &files {
            report.files_scanned += 1;
            seen.insert(path.clone());
            if let Err(err) = self.process_file(path, mode, &mut cursors, &mut report).await {
                warn!(file = %path.display(), error = %err, "failed to index file");
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(format!("{}: {err}", path.display()));
                }
            }
        }

        if mode == IndexMode::Incremental {
            cursors.retain(|path, _| seen.contains(path));
        }

        report.finished_at = now_iso();
        debug!(
            mode = mode.as_str(),
            files = report.files_scanned,
            lines = report.lines_scanned,
            inserted = report.records_inserted,
            skipped = report.records_skipped,
            parse_errors = report.parse_errors,
            "index pass complete"
        );
        Ok(Some(report))
    }

    /// Drop every checkpoint. The next incremental pass rescans from
    /// offset zero.
    pub async fn reset_incremental_state(&self) {
        self.cursors.lock().await.clear();
    }

    async fn process_file(
        &self,
        path: &Path,
        mode: IndexMode,
        cursors: &mut CursorMap,
        report: &mut IndexReport,
    ) -> Result<()> {
        let metadata = std::fs::metadata(path)?;
        let size = metadata.len();
        let mtime_ms = mtime_millis(&metadata);
        let source_file = relative_source(&self.logs_root, path);

        let (start_offset, start_line) = match mode {
            IndexMode::Full => (0, 0),
            IndexMode::Incremental => match cursors.get(path) {
                None => (0, 0),
                Some(cursor) => {
                    let rewritten = size < cursor.byte_offset
                        || (size == cursor.byte_offset && mtime_ms != cursor.mtime_ms);
                    if rewritten {
                        debug!(file = %source_file, "rewrite detected, replacing indexed rows");
                        self.store
                            .delete_entries_for_source_file(&source_file)
                            .await?;
                        (0, 0)
                    } else {
                        (cursor.byte_offset, cursor.last_line_number)
                    }
                }
            },
        };

        let mut file = File::open(path)?;
        if start_offset > 0 {
            file.seek(SeekFrom::Start(start_offset))?;
        }
        let mut reader = BufReader::new(file);

        let mut offset = start_offset;
        let mut line_number = start_line;
        let mut buf = String::new();
        loop {
            buf.clear();
            let bytes = reader.read_line(&mut buf)?;
            if bytes == 0 {
                break;
            }
            offset += bytes as u64;
            line_number += 1;
            report.lines_scanned += 1;

            match normalize_line(&buf, &source_file, line_number) {
                LineOutcome::Blank => {}
                LineOutcome::ParseError => report.parse_errors += 1,
                LineOutcome::Record { entry, fields } => {
                    let outcome = self.store.upsert_entry(&entry).await?;
                    if outcome.inserted {
                        report.records_inserted += 1;
                        for (key, value_text) in &fields {
                            self.store
                                .upsert_field(outcome.entry_id, key, value_text)
                                .await?;
                        }
                    } else {
                        report.records_skipped += 1;
                    }
                }
            }
        }

        if mode == IndexMode::Incremental {
            let final_meta = std::fs::metadata(path).unwrap_or(metadata);
            cursors.insert(
                path.to_path_buf(),
                FileCursor {
                    byte_offset: offset,
                    file_size: final_meta.len(),
                    last_line_number: line_number,
                    mtime_ms: mtime_millis(&final_meta),
                },
            );
        }
        Ok(())
    }
}

/// Collect `.ndjson` files under the root, sorted by path. A missing
/// root yields an empty pass, not an error.
fn collect_ndjson_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase() == "ndjson")
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Path relative to the logs root, forward-slash normalized.
fn relative_source(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryFilter;
    use filetime::FileTime;
    use std::fs;
    use tempfile::TempDir;

    async fn indexer(root: &TempDir) -> Indexer {
        let store = IndexStore::open_in_memory().await.expect("store");
        Indexer::new(store, root.path())
    }

    fn write(root: &TempDir, rel: &str, content: &str) -> PathBuf {
        let path = root.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(&path, content).expect("write");
        path
    }

    #[tokio::test]
    async fn missing_root_reports_zero_files() {
        let dir = TempDir::new().expect("tempdir");
        let store = IndexStore::open_in_memory().await.expect("store");
        let indexer = Indexer::new(store, dir.path().join("nope"));
        let report = indexer
            .run(IndexMode::Full)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(report.files_scanned, 0);
        assert_eq!(report.lines_scanned, 0);
    }

    #[tokio::test]
    async fn full_pass_indexes_and_counts_parse_errors() {
        let dir = TempDir::new().expect("tempdir");
        write(
            &dir,
            "a.ndjson",
            "{\"event\":\"one\",\"level\":\"ERROR\"}\n{\"event\":\"two\"}\n",
        );
        write(&dir, "b.ndjson", "{\"event\":\"three\"}\nnot json at all\n");

        let indexer = indexer(&dir).await;
        let report = indexer
            .run(IndexMode::Full)
            .await
            .expect("run")
            .expect("report");

        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.lines_scanned, 4);
        assert_eq!(report.records_inserted, 3);
        assert_eq!(report.parse_errors, 1);

        let filter = EntryFilter {
            level: Some("ERROR".to_string()),
            ..Default::default()
        };
        let page = indexer
            .store()
            .query_page(&filter, None, 10)
            .await
            .expect("page");
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].event, "one");
    }

    #[tokio::test]
    async fn second_full_pass_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        write(
            &dir,
            "a.ndjson",
            "{\"event\":\"one\"}\n\n{\"event\":\"two\"}\nbroken\n",
        );

        let indexer = indexer(&dir).await;
        let first = indexer
            .run(IndexMode::Full)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(first.records_inserted, 2);
        assert_eq!(first.parse_errors, 1);

        let second = indexer
            .run(IndexMode::Full)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(second.records_inserted, 0);
        // Everything parseable is a duplicate the second time around.
        assert_eq!(
            second.records_skipped,
            second.lines_scanned - second.parse_errors - 1 // one blank line
        );
    }

    #[tokio::test]
    async fn incremental_pass_resumes_at_checkpoint() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "a.ndjson", "{\"event\":\"one\"}\n");

        let indexer = indexer(&dir).await;
        let first = indexer
            .run(IndexMode::Incremental)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(first.records_inserted, 1);

        let mut content = fs::read_to_string(&path).expect("read");
        content.push_str("{\"event\":\"two\"}\n");
        fs::write(&path, content).expect("append");

        let second = indexer
            .run(IndexMode::Incremental)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(second.lines_scanned, 1);
        assert_eq!(second.records_inserted, 1);

        let third = indexer
            .run(IndexMode::Incremental)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(third.lines_scanned, 0);
        assert_eq!(third.records_inserted, 0);
    }

    #[tokio::test]
    async fn line_numbers_continue_across_passes() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "a.ndjson", "{\"event\":\"one\"}\n");

        let indexer = indexer(&dir).await;
        indexer.run(IndexMode::Incremental).await.expect("run");

        let mut content = fs::read_to_string(&path).expect("read");
        content.push_str("{\"event\":\"two\"}\n");
        fs::write(&path, content).expect("append");
        indexer.run(IndexMode::Incremental).await.expect("run");

        let page = indexer
            .store()
            .query_page(&EntryFilter::default(), None, 10)
            .await
            .expect("page");
        let mut lines: Vec<i64> = page.entries.iter().map(|e| e.line_number).collect();
        lines.sort();
        assert_eq!(lines, vec![1, 2]);
    }

    #[tokio::test]
    async fn shrunken_file_is_reindexed_from_scratch() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(
            &dir,
            "a.ndjson",
            "{\"event\":\"one\",\"extra\":\"padding-padding\"}\n",
        );

        let indexer = indexer(&dir).await;
        indexer.run(IndexMode::Incremental).await.expect("run");

        fs::write(&path, "{\"event\":\"new\"}\n").expect("rewrite");
        let report = indexer
            .run(IndexMode::Incremental)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(report.records_inserted, 1);
        assert_eq!(report.records_skipped, 0);

        let page = indexer
            .store()
            .query_page(&EntryFilter::default(), None, 10)
            .await
            .expect("page");
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].event, "new");
        assert_eq!(page.entries[0].line_number, 1);
    }

    #[tokio::test]
    async fn same_size_rewrite_is_detected_by_mtime() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "a.ndjson", "{\"event\":\"aaa\"}\n");

        let indexer = indexer(&dir).await;
        indexer.run(IndexMode::Incremental).await.expect("run");

        // Same byte length, different content and a forced mtime bump.
        fs::write(&path, "{\"event\":\"bbb\"}\n").expect("rewrite");
        filetime::set_file_mtime(&path, FileTime::from_unix_time(2_000_000_000, 0))
            .expect("set mtime");

        let report = indexer
            .run(IndexMode::Incremental)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(report.records_inserted, 1);

        let page = indexer
            .store()
            .query_page(&EntryFilter::default(), None, 10)
            .await
            .expect("page");
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].event, "bbb");
    }

    #[tokio::test]
    async fn vanished_files_drop_their_cursor() {
        let dir = TempDir::new().expect("tempdir");
        let path = write(&dir, "a.ndjson", "{\"event\":\"one\"}\n");

        let indexer = indexer(&dir).await;
        indexer.run(IndexMode::Incremental).await.expect("run");
        assert_eq!(indexer.cursors.lock().await.len(), 1);

        fs::remove_file(&path).expect("remove");
        indexer.run(IndexMode::Incremental).await.expect("run");
        assert!(indexer.cursors.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_cursors() {
        let dir = TempDir::new().expect("tempdir");
        write(&dir, "a.ndjson", "{\"event\":\"one\"}\n");

        let indexer = indexer(&dir).await;
        indexer.run(IndexMode::Incremental).await.expect("run");
        indexer.reset_incremental_state().await;
        assert!(indexer.cursors.lock().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_pass_short_circuits() {
        let dir = TempDir::new().expect("tempdir");
        write(&dir, "a.ndjson", "{\"event\":\"one\"}\n");

        let indexer = indexer(&dir).await;
        let guard = indexer.cursors.lock().await;
        let result = indexer.run(IndexMode::Incremental).await.expect("run");
        assert!(result.is_none(), "pass must skip while another holds the lock");
        drop(guard);

        let report = indexer
            .run(IndexMode::Incremental)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(report.records_inserted, 1);
    }

    #[tokio::test]
    async fn non_ndjson_files_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        write(&dir, "a.ndjson", "{\"event\":\"one\"}\n");
        write(&dir, "notes.txt", "{\"event\":\"two\"}\n");
        write(&dir, "nested/b.NDJSON", "{\"event\":\"three\"}\n");

        let indexer = indexer(&dir).await;
        let report = indexer
            .run(IndexMode::Full)
            .await
            .expect("run")
            .expect("report");
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.records_inserted, 2);
    }

    #[tokio::test]
    async fn audit_paths_flag_entries() {
        let dir = TempDir::new().expect("tempdir");
        write(&dir, "audit/security.ndjson", "{\"event\":\"login\"}\n");
        write(&dir, "app.ndjson", "{\"event\":\"boot\"}\n");

        let indexer = indexer(&dir).await;
        indexer.run(IndexMode::Full).await.expect("run");

        let audit_only = EntryFilter {
            audit: Some(true),
            ..Default::default()
        };
        let page = indexer
            .store()
            .query_page(&audit_only, None, 10)
            .await
            .expect("page");
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].source_file, "audit/security.ndjson");
    }
}
