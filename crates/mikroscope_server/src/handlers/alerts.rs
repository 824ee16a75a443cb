//! Alert configuration and manual webhook test endpoints.

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use mikroscope_alerts::{AlertError, PolicyPatch, POLICY_KEYS};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "configPath": state.alerts.config_path().display().to_string(),
        "policy": state.alerts.policy(),
    }))
}

pub async fn put_config(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| AppError::bad_request("expected a JSON object"))?;
    for key in object.keys() {
        if !POLICY_KEYS.contains(&key.as_str()) {
            return Err(AppError::bad_request(format!("unknown field: {key}")));
        }
    }

    let patch: PolicyPatch = serde_json::from_value(value.clone())
        .map_err(|err| AppError::bad_request(format!("invalid policy patch: {err}")))?;
    let policy = state.alerts.update_policy(&patch)?;

    Ok(Json(json!({
        "configPath": state.alerts.config_path().display().to_string(),
        "policy": policy,
    })))
}

pub async fn test_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let override_url = parse_test_webhook_body(&body)?;
    match state.alerts.send_test_webhook(override_url).await {
        Ok((sent_at, target_url)) => Ok(Json(json!({
            "ok": true,
            "sentAt": sent_at,
            "targetUrl": target_url,
        }))),
        // Delivery failures surface as 400 with the error string.
        Err(AlertError::Webhook(message)) => Err(AppError::bad_request(message)),
        Err(other) => Err(other.into()),
    }
}

/// Accepts `{}`, `{webhookUrl: string}`, or `{webhookUrl: null}`. An
/// empty body counts as `{}`, and so does an empty JSON array (a quirk
/// preserved from the original intake).
fn parse_test_webhook_body(body: &[u8]) -> AppResult<Option<String>> {
    if body.iter().all(|byte| byte.is_ascii_whitespace()) {
        return Ok(None);
    }
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))?;
    if matches!(&value, Value::Array(items) if items.is_empty()) {
        value = json!({});
    }
    let object = value
        .as_object()
        .ok_or_else(|| AppError::bad_request("expected a JSON object"))?;
    for key in object.keys() {
        if key != "webhookUrl" {
            return Err(AppError::bad_request(format!("unknown field: {key}")));
        }
    }
    match object.get("webhookUrl") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(url)) => Ok(Some(url.clone())),
        Some(_) => Err(AppError::bad_request("webhookUrl must be a string or null")),
    }
}
