//! `GET /health`: composite, unauthenticated status report.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::preflight::free_bytes;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    let store_stats = state.store.get_stats().await.unwrap_or_default();
    let index_status = state.index_status.snapshot();

    let db_dir = config
        .db_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let ingest_enabled =
        !config.ingest_producers.is_empty() || config.basic_auth_configured();

    Json(json!({
        "ok": true,
        "service": "mikroscope",
        "uptimeSec": state.uptime_secs(),
        "ingest": {
            "autoIngestEnabled": !config.disable_auto_ingest,
            "intervalMs": config.ingest_interval_ms,
            "lastRunAt": index_status.last_run_at,
            "lastReport": index_status.last_report,
            "lastError": state.indexer.last_error(),
        },
        "auth": {
            "apiTokenEnabled": config.api_token.is_some(),
            "basicEnabled": config.basic_auth_configured(),
        },
        "ingestPolicy": {
            "asyncQueue": config.ingest_async_queue,
            "flushMs": config.ingest_queue_flush_ms,
        },
        "ingestEndpoint": {
            "enabled": ingest_enabled,
            "maxBodyBytes": config.ingest_max_body_bytes,
            "producerCount": config.ingest_producers.len(),
            "queue": state.ingest.queue_stats(),
        },
        "alerting": state.alerts.state_snapshot(),
        "alertPolicy": state.alerts.masked_policy(),
        "maintenance": state.maintenance.stats(),
        "retentionDays": {
            "db": config.db_retention_days,
            "dbAudit": config.db_audit_retention_days,
            "logs": config.log_retention_days,
            "logsAudit": config.log_audit_retention_days,
        },
        "backup": {
            "auditDirectory": config
                .audit_backup_directory
                .as_ref()
                .map(|dir| dir.display().to_string()),
        },
        "storage": {
            "dbApproximateSizeBytes": store_stats.approx_size_bytes,
            "dbDirectoryFreeBytes": free_bytes(&db_dir),
            "logsDirectoryFreeBytes": free_bytes(&config.logs_path),
            "minFreeBytes": config.min_free_bytes,
        },
    }))
}
