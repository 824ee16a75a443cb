//! Shared request state.
//!
//! Three long-lived objects (store, alert manager, ingest pipeline)
//! plus the indexer and bookkeeping, injected into every handler
//! through axum state rather than ambient globals.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use mikroscope_index::{IndexError, IndexMode, IndexReport, Indexer, IndexStore};
use serde::Serialize;
use tracing::debug;

use crate::config::ServerConfig;
use crate::ingest::IngestPipeline;
use crate::maintenance::MaintenanceLoop;
use crate::query::QueryService;
use mikroscope_alerts::AlertManager;

/// Outcome bookkeeping for indexing passes, shared by the auto-ingest
/// ticker, post-ingest passes, and the manual reindex endpoint.
#[derive(Clone, Default)]
pub struct IndexStatus {
    inner: Arc<StdMutex<IndexStatusInner>>,
}

#[derive(Default)]
struct IndexStatusInner {
    last_report: Option<IndexReport>,
    last_run_at: Option<String>,
}

/// Snapshot for the health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatusSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<IndexReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
}

impl IndexStatus {
    pub fn record(&self, report: &IndexReport) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_run_at = Some(report.finished_at.clone());
            inner.last_report = Some(report.clone());
        }
    }

    pub fn snapshot(&self) -> IndexStatusSnapshot {
        match self.inner.lock() {
            Ok(inner) => IndexStatusSnapshot {
                last_report: inner.last_report.clone(),
                last_run_at: inner.last_run_at.clone(),
            },
            Err(_) => IndexStatusSnapshot {
                last_report: None,
                last_run_at: None,
            },
        }
    }
}

/// Run one indexing pass and record its report. Returns `None` when a
/// pass was already in flight.
pub async fn run_index_pass(
    indexer: &Indexer,
    status: &IndexStatus,
    mode: IndexMode,
) -> Result<Option<IndexReport>, IndexError> {
    let report = indexer.run(mode).await?;
    match &report {
        Some(report) => status.record(report),
        None => debug!("index pass skipped, another is in flight"),
    }
    Ok(report)
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: IndexStore,
    pub indexer: Arc<Indexer>,
    pub query: QueryService,
    pub alerts: AlertManager,
    pub ingest: IngestPipeline,
    pub maintenance: MaintenanceLoop,
    pub index_status: IndexStatus,
    pub started_at: Instant,
    pub service_url: Arc<StdMutex<String>>,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn service_url(&self) -> String {
        self.service_url
            .lock()
            .map(|url| url.clone())
            .unwrap_or_default()
    }

    pub fn set_service_url(&self, url: impl Into<String>) {
        let url = url.into();
        if let Ok(mut guard) = self.service_url.lock() {
            *guard = url.clone();
        }
        self.alerts.set_service_url(url);
    }
}
