//! NDJSON line normalization.
//!
//! One parsed line becomes one entry plus one field row per top-level
//! scalar. Objects and arrays stay inside `data_json` only.

use chrono::DateTime;
use serde_json::Value;

use crate::types::{now_iso, to_iso, NewEntry};

/// Outcome of processing one raw line.
#[derive(Debug)]
pub enum LineOutcome {
    /// Whitespace-only line; skipped without counting as an error.
    Blank,
    /// Not JSON, or JSON that is not an object.
    ParseError,
    Record {
        entry: NewEntry,
        fields: Vec<(String, String)>,
    },
}

/// Normalize one raw line into an entry and its extracted fields.
///
/// `source_file` is the path relative to the logs root with forward
/// slashes; it feeds both the idempotency key and the audit heuristic.
pub fn normalize_line(raw: &str, source_file: &str, line_number: i64) -> LineOutcome {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return LineOutcome::Blank;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return LineOutcome::ParseError,
    };
    let Some(object) = value.as_object() else {
        return LineOutcome::ParseError;
    };

    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| to_iso(ts.into()))
        .unwrap_or_else(now_iso);

    let level = object
        .get("level")
        .and_then(Value::as_str)
        .filter(|level| !level.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_else(|| "INFO".to_string());

    let message = match object.get("message") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(message)) => message.clone(),
        // Non-string messages keep their JSON rendering.
        Some(other) => other.to_string(),
    };

    let event = object
        .get("event")
        .and_then(Value::as_str)
        .filter(|event| !event.is_empty())
        .map(str::to_string)
        .or_else(|| {
            object
                .get("message")
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "log.event".to_string());

    let is_audit = explicit_audit_flag(object).unwrap_or_else(|| path_is_audit(source_file));

    let fields = object
        .iter()
        .filter_map(|(key, value)| scalar_text(value).map(|text| (key.clone(), text)))
        .collect();

    LineOutcome::Record {
        entry: NewEntry {
            timestamp,
            level,
            event,
            message,
            is_audit,
            data_json: value.to_string(),
            source_file: source_file.to_string(),
            line_number,
        },
        fields,
    }
}

/// Explicit audit flag in the record wins over the path heuristic.
/// Accepts booleans and stringified booleans under either key spelling.
fn explicit_audit_flag(object: &serde_json::Map<String, Value>) -> Option<bool> {
    let value = object.get("isAudit").or_else(|| object.get("is_audit"))?;
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(raw) => match raw.to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// A path segment (including the basename) containing `audit`,
/// case-insensitive, classifies the file as audit.
pub fn path_is_audit(source_file: &str) -> bool {
    source_file
        .split('/')
        .any(|segment| segment.to_lowercase().contains("audit"))
}

/// String form of a top-level scalar, or `None` for objects/arrays.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Object(_) | Value::Array(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(raw: &str) -> (NewEntry, Vec<(String, String)>) {
        match normalize_line(raw, "app/service.ndjson", 1) {
            LineOutcome::Record { entry, fields } => (entry, fields),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn blank_and_garbage_lines_are_classified() {
        assert!(matches!(
            normalize_line("   \t ", "a.ndjson", 1),
            LineOutcome::Blank
        ));
        assert!(matches!(
            normalize_line("not json", "a.ndjson", 1),
            LineOutcome::ParseError
        ));
        assert!(matches!(
            normalize_line("[1, 2, 3]", "a.ndjson", 1),
            LineOutcome::ParseError
        ));
    }

    #[test]
    fn defaults_fill_missing_attributes() {
        let (entry, _) = record(r#"{"event": "user.login"}"#);
        assert_eq!(entry.level, "INFO");
        assert_eq!(entry.message, "");
        assert_eq!(entry.event, "user.login");
        assert!(!entry.timestamp.is_empty());
    }

    #[test]
    fn level_is_uppercased() {
        let (entry, _) = record(r#"{"level": "warn", "event": "x"}"#);
        assert_eq!(entry.level, "WARN");
    }

    #[test]
    fn event_falls_back_to_message_then_literal() {
        let (entry, _) = record(r#"{"message": "something happened"}"#);
        assert_eq!(entry.event, "something happened");

        let (entry, _) = record(r#"{"level": "INFO"}"#);
        assert_eq!(entry.event, "log.event");
    }

    #[test]
    fn non_string_message_is_json_stringified() {
        let (entry, _) = record(r#"{"event": "x", "message": {"code": 7}}"#);
        assert_eq!(entry.message, r#"{"code":7}"#);

        let (entry, _) = record(r#"{"event": "x", "message": 42}"#);
        assert_eq!(entry.message, "42");
    }

    #[test]
    fn invalid_timestamp_falls_back_to_wall_clock() {
        let (entry, _) = record(r#"{"event": "x", "timestamp": "yesterday-ish"}"#);
        assert!(entry.timestamp.ends_with('Z'));
    }

    #[test]
    fn valid_timestamp_is_normalized_to_utc_millis() {
        let (entry, _) = record(r#"{"event": "x", "timestamp": "2026-03-01T10:00:00+02:00"}"#);
        assert_eq!(entry.timestamp, "2026-03-01T08:00:00.000Z");
    }

    #[test]
    fn explicit_audit_flag_beats_path() {
        let (entry, _) = record(r#"{"event": "x", "isAudit": true}"#);
        assert!(entry.is_audit);

        match normalize_line(r#"{"event": "x", "isAudit": "false"}"#, "audit/a.ndjson", 1) {
            LineOutcome::Record { entry, .. } => assert!(!entry.is_audit),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn audit_path_segments_classify() {
        assert!(path_is_audit("audit/app.ndjson"));
        assert!(path_is_audit("ingest/api/AUDIT-2026.ndjson"));
        assert!(path_is_audit("security-audits/app.ndjson"));
        assert!(!path_is_audit("ingest/api/app.ndjson"));
    }

    #[test]
    fn only_top_level_scalars_become_fields() {
        let (_, fields) = record(
            r#"{"event": "x", "count": 3, "ok": true, "ref": null, "meta": {"a": 1}, "tags": [1]}"#,
        );
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"event"));
        assert!(keys.contains(&"count"));
        assert!(keys.contains(&"ok"));
        assert!(keys.contains(&"ref"));
        assert!(!keys.contains(&"meta"));
        assert!(!keys.contains(&"tags"));

        let count = fields.iter().find(|(k, _)| k == "count").unwrap();
        assert_eq!(count.1, "3");
        let null_ref = fields.iter().find(|(k, _)| k == "ref").unwrap();
        assert_eq!(null_ref.1, "null");
    }
}
