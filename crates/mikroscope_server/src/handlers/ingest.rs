//! `POST /api/ingest`.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;

use crate::auth::{resolve_producer, ProducerResolution};
use crate::error::{AppError, AppResult};
use crate::ingest::parse_payload;
use crate::state::AppState;

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<Response> {
    let producer_id = match resolve_producer(&state.config, &headers) {
        ProducerResolution::Disabled => {
            return Err(AppError::not_found("ingest is not configured"))
        }
        ProducerResolution::Unauthorized => return Err(AppError::unauthorized("Unauthorized")),
        ProducerResolution::Producer(producer_id) => producer_id,
    };

    let bytes = read_body_limited(body, state.config.ingest_max_body_bytes).await?;
    let records = parse_payload(&bytes)?;
    let outcome = state.ingest.submit(&producer_id, records).await?;

    let status = if outcome.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)).into_response())
}

/// Stream the body up to the configured cap; anything past it is a
/// `413` before buffering more.
async fn read_body_limited(body: Body, max_bytes: usize) -> AppResult<Vec<u8>> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| AppError::bad_request(format!("failed to read body: {err}")))?;
        if buffer.len() + chunk.len() > max_bytes {
            return Err(AppError::too_large(format!(
                "request body exceeds {max_bytes} bytes"
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}
