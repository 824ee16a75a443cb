//! `/api/logs` and `/api/logs/aggregate`.

use axum::extract::{Query, State};
use axum::Json;
use mikroscope_index::{EntryFilter, GroupBy};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub level: Option<String>,
    pub audit: Option<String>,
    pub field: Option<String>,
    pub value: Option<String>,
    pub limit: Option<String>,
    pub cursor: Option<String>,
    #[serde(rename = "groupBy")]
    pub group_by: Option<String>,
    #[serde(rename = "groupField")]
    pub group_field: Option<String>,
}

impl LogsParams {
    fn filter(&self) -> AppResult<EntryFilter> {
        let audit = match self.audit.as_deref() {
            None => None,
            Some("true") | Some("1") => Some(true),
            Some("false") | Some("0") => Some(false),
            Some(other) => {
                return Err(AppError::bad_request(format!(
                    "invalid audit value '{other}', expected true|false|1|0"
                )))
            }
        };

        let field = match (&self.field, &self.value) {
            (None, None) => None,
            (Some(field), Some(value)) if !field.is_empty() => {
                Some((field.clone(), value.clone()))
            }
            _ => {
                return Err(AppError::bad_request(
                    "field and value must be provided together",
                ))
            }
        };

        Ok(EntryFilter {
            from: self.from.clone(),
            to: self.to.clone(),
            level: self.level.clone(),
            audit,
            field,
        })
    }

    fn limit(&self) -> AppResult<Option<i64>> {
        match self.limit.as_deref() {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| AppError::bad_request(format!("invalid limit '{raw}'"))),
        }
    }
}

fn entry_json(entry: &mikroscope_index::LogEntry) -> Value {
    let data: Value = serde_json::from_str(&entry.data_json).unwrap_or(Value::Null);
    json!({
        "id": entry.id,
        "timestamp": entry.timestamp,
        "level": entry.level,
        "event": entry.event,
        "message": entry.message,
        "data": data,
        "sourceFile": entry.source_file,
        "lineNumber": entry.line_number,
    })
}

pub async fn query_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> AppResult<Json<Value>> {
    let filter = params.filter()?;
    let limit = params.limit()?;
    let (page, next_cursor) = state
        .query
        .query_page(&filter, params.cursor.as_deref(), limit)
        .await?;

    let mut body = json!({
        "entries": page.entries.iter().map(entry_json).collect::<Vec<_>>(),
        "hasMore": page.has_more,
        "limit": page.limit,
    });
    if let (Some(cursor), Some(object)) = (next_cursor, body.as_object_mut()) {
        object.insert("nextCursor".to_string(), json!(cursor));
    }
    Ok(Json(body))
}

pub async fn aggregate_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> AppResult<Json<Value>> {
    let group_by = params
        .group_by
        .as_deref()
        .and_then(GroupBy::parse)
        .ok_or_else(|| {
            AppError::bad_request("invalid groupBy, expected level|event|field|correlation")
        })?;
    let filter = params.filter()?;
    let limit = params.limit()?;
    let buckets = state
        .query
        .aggregate(&filter, group_by, params.group_field.as_deref(), limit)
        .await?;

    let mut body = json!({
        "buckets": buckets,
        "groupBy": group_by.as_str(),
    });
    if let (Some(field), Some(object)) = (&params.group_field, body.as_object_mut()) {
        object.insert("groupField".to_string(), json!(field));
    }
    Ok(Json(body))
}
