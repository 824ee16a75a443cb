//! Retention maintenance.
//!
//! One pass walks the raw tree deleting files past their horizon
//! (backing up audit files first when configured), prunes the index by
//! the database horizons, and compacts storage when anything was
//! actually removed. Audit and normal data age out independently.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime};

use chrono::Utc;
use mikroscope_index::normalize::path_is_audit;
use mikroscope_index::{now_iso, to_iso, IndexStore};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Retention knobs for one loop instance. Day values of `0` disable
/// that horizon.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub logs_root: PathBuf,
    pub log_retention_days: u32,
    pub log_audit_retention_days: u32,
    pub db_retention_days: u32,
    pub db_audit_retention_days: u32,
    pub audit_backup_directory: Option<PathBuf>,
}

/// Maintenance state surfaced through `/health`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceStats {
    pub runs: u64,
    pub files_deleted: u64,
    pub files_backed_up: u64,
    pub entries_pruned: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct MaintenanceInner {
    store: IndexStore,
    config: RetentionConfig,
    running: AtomicBool,
    stats: StdMutex<MaintenanceStats>,
}

#[derive(Clone)]
pub struct MaintenanceLoop {
    inner: Arc<MaintenanceInner>,
}

impl MaintenanceLoop {
    pub fn new(store: IndexStore, config: RetentionConfig) -> Self {
        Self {
            inner: Arc::new(MaintenanceInner {
                store,
                config,
                running: AtomicBool::new(false),
                stats: StdMutex::new(MaintenanceStats::default()),
            }),
        }
    }

    pub fn stats(&self) -> MaintenanceStats {
        self.inner
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// One maintenance pass. Overlapping invocations are no-ops;
    /// errors are recorded, never raised.
    pub async fn run_once(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("maintenance already running, skipping");
            return;
        }
        let started = Instant::now();
        let result = self.sweep().await;

        if let Ok(mut stats) = self.inner.stats.lock() {
            stats.runs += 1;
            stats.last_run_at = Some(now_iso());
            stats.last_duration_ms = Some(started.elapsed().as_millis() as u64);
            match result {
                Ok((files_deleted, files_backed_up, entries_pruned)) => {
                    stats.files_deleted += files_deleted;
                    stats.files_backed_up += files_backed_up;
                    stats.entries_pruned += entries_pruned;
                }
                Err(err) => stats.last_error = Some(err),
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    async fn sweep(&self) -> Result<(u64, u64, u64), String> {
        let config = &self.inner.config;
        let now = SystemTime::now();

        let mut files_deleted = 0u64;
        let mut files_backed_up = 0u64;
        if config.logs_root.exists() {
            for entry in WalkDir::new(&config.logs_root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                let path = entry.path();
                let is_ndjson = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.to_lowercase() == "ndjson")
                    .unwrap_or(false);
                if !is_ndjson {
                    continue;
                }

                let relative = relative_forward_slash(&config.logs_root, path);
                let is_audit = path_is_audit(&relative);
                let horizon_days = if is_audit {
                    config.log_audit_retention_days
                } else {
                    config.log_retention_days
                };
                if horizon_days == 0 {
                    continue;
                }

                let expired = file_mtime(path)
                    .map(|mtime| {
                        now.duration_since(mtime)
                            .map(|age| age.as_secs() > u64::from(horizon_days) * 86_400)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                if !expired {
                    continue;
                }

                if is_audit {
                    if let Some(backup_root) = &config.audit_backup_directory {
                        match backup_file(path, backup_root, &relative) {
                            Ok(()) => files_backed_up += 1,
                            Err(err) => {
                                warn!(file = %relative, error = %err, "audit backup failed, keeping file");
                                continue;
                            }
                        }
                    }
                }

                match std::fs::remove_file(path) {
                    Ok(()) => {
                        files_deleted += 1;
                        debug!(file = %relative, audit = is_audit, "expired log file deleted");
                    }
                    Err(err) => warn!(file = %relative, error = %err, "failed to delete expired file"),
                }
            }
        }

        let normal_cutoff = cutoff_iso(config.db_retention_days);
        let audit_cutoff = cutoff_iso(config.db_audit_retention_days);
        let prune = self
            .inner
            .store
            .prune_by_retention(normal_cutoff.as_deref(), audit_cutoff.as_deref())
            .await
            .map_err(|err| format!("prune failed: {err}"))?;

        if files_deleted > 0 || prune.entries_deleted > 0 {
            self.inner
                .store
                .vacuum()
                .await
                .map_err(|err| format!("vacuum failed: {err}"))?;
            info!(
                files_deleted,
                entries_pruned = prune.entries_deleted,
                "maintenance pass compacted storage"
            );
        }

        Ok((files_deleted, files_backed_up, prune.entries_deleted))
    }
}

/// `now - days`, rendered in the canonical ISO format. `0` disables.
fn cutoff_iso(days: u32) -> Option<String> {
    if days == 0 {
        return None;
    }
    Some(to_iso(Utc::now() - chrono::Duration::days(i64::from(days))))
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn relative_forward_slash(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Copy an expiring audit file into the backup tree, mirroring its
/// relative path.
fn backup_file(path: &Path, backup_root: &Path, relative: &str) -> std::io::Result<()> {
    let target = backup_root.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(path, &target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use mikroscope_index::{EntryFilter, NewEntry};
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    fn write_aged(root: &Path, rel: &str, age_days: u64) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "{\"event\":\"x\"}\n").expect("write");
        let stamp = SystemTime::now() - std::time::Duration::from_secs(age_days * 86_400);
        let seconds = stamp
            .duration_since(UNIX_EPOCH)
            .expect("after epoch")
            .as_secs();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(seconds as i64, 0))
            .expect("set mtime");
        path
    }

    fn retention(root: &Path) -> RetentionConfig {
        RetentionConfig {
            logs_root: root.to_path_buf(),
            log_retention_days: 1,
            log_audit_retention_days: 365,
            db_retention_days: 0,
            db_audit_retention_days: 0,
            audit_backup_directory: None,
        }
    }

    #[tokio::test]
    async fn normal_and_audit_files_age_out_separately() {
        let dir = TempDir::new().expect("tempdir");
        let old_normal = write_aged(dir.path(), "app.ndjson", 5);
        let old_audit = write_aged(dir.path(), "audit/security.ndjson", 5);
        let fresh = write_aged(dir.path(), "fresh.ndjson", 0);

        let store = IndexStore::open_in_memory().await.expect("store");
        let maintenance = MaintenanceLoop::new(store, retention(dir.path()));
        maintenance.run_once().await;

        assert!(!old_normal.exists(), "expired normal file deleted");
        assert!(old_audit.exists(), "audit horizon not reached");
        assert!(fresh.exists());

        let stats = maintenance.stats();
        assert_eq!(stats.files_deleted, 1);
        assert!(stats.last_error.is_none());
    }

    #[tokio::test]
    async fn audit_files_are_backed_up_before_delete() {
        let dir = TempDir::new().expect("tempdir");
        let backup = TempDir::new().expect("backup dir");
        write_aged(dir.path(), "audit/security.ndjson", 10);

        let store = IndexStore::open_in_memory().await.expect("store");
        let mut config = retention(dir.path());
        config.log_audit_retention_days = 1;
        config.audit_backup_directory = Some(backup.path().to_path_buf());
        let maintenance = MaintenanceLoop::new(store, config);
        maintenance.run_once().await;

        assert!(!dir.path().join("audit/security.ndjson").exists());
        assert!(backup.path().join("audit/security.ndjson").exists());
        let stats = maintenance.stats();
        assert_eq!(stats.files_backed_up, 1);
        assert_eq!(stats.files_deleted, 1);
    }

    #[tokio::test]
    async fn zero_days_disables_a_class() {
        let dir = TempDir::new().expect("tempdir");
        let old_normal = write_aged(dir.path(), "app.ndjson", 400);

        let store = IndexStore::open_in_memory().await.expect("store");
        let mut config = retention(dir.path());
        config.log_retention_days = 0;
        let maintenance = MaintenanceLoop::new(store, config);
        maintenance.run_once().await;

        assert!(old_normal.exists(), "disabled horizon never deletes");
    }

    #[tokio::test]
    async fn db_horizons_prune_index_rows() {
        let dir = TempDir::new().expect("tempdir");
        let store = IndexStore::open_in_memory().await.expect("store");
        store
            .upsert_entry(&NewEntry {
                timestamp: "2020-01-01T00:00:00.000Z".to_string(),
                level: "INFO".to_string(),
                event: "ancient".to_string(),
                message: String::new(),
                is_audit: false,
                data_json: "{}".to_string(),
                source_file: "old.ndjson".to_string(),
                line_number: 1,
            })
            .await
            .expect("insert");

        let mut config = retention(dir.path());
        config.db_retention_days = 30;
        let maintenance = MaintenanceLoop::new(store.clone(), config);
        maintenance.run_once().await;

        assert_eq!(store.count(&EntryFilter::default()).await.expect("count"), 0);
        assert_eq!(maintenance.stats().entries_pruned, 1);
    }
}
