//! `POST /api/reindex`: wipe the index and rebuild from the raw tree.

use axum::extract::State;
use axum::Json;
use mikroscope_index::IndexMode;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::state::{run_index_pass, AppState};

pub async fn reindex(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let (entries_deleted, fields_deleted) = state.store.reset().await.map_err(AppError::from)?;
    state.indexer.reset_incremental_state().await;

    let report = run_index_pass(&state.indexer, &state.index_status, IndexMode::Full)
        .await?
        .ok_or_else(|| AppError::internal("another indexing pass is running"))?;

    info!(
        entries_deleted,
        inserted = report.records_inserted,
        "manual reindex complete"
    );
    Ok(Json(json!({
        "report": report,
        "reset": {
            "entriesDeleted": entries_deleted,
            "fieldsDeleted": fields_deleted,
        },
    })))
}
