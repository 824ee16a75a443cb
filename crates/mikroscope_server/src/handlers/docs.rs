//! Static API documentation: OpenAPI documents and a small HTML page.

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::AppError;

pub async fn openapi_json() -> Json<Value> {
    Json(openapi_document())
}

pub async fn openapi_yaml() -> Result<Response, AppError> {
    let yaml = serde_yaml::to_string(&openapi_document())
        .map_err(|err| AppError::internal(format!("failed to render YAML document: {err}")))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/yaml")],
        yaml,
    )
        .into_response())
}

pub async fn docs_page() -> Html<&'static str> {
    Html(DOCS_HTML)
}

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>mikroscope API</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 3rem auto; max-width: 40rem; }
    code { background: #f4f4f4; padding: 0.1rem 0.3rem; border-radius: 3px; }
  </style>
</head>
<body>
  <h1>mikroscope</h1>
  <p>Log sidecar: NDJSON ingest, queryable index, retention, webhook alerting.</p>
  <p>The machine-readable API description is available as
    <a href="/openapi.json"><code>/openapi.json</code></a> or
    <a href="/openapi.yaml"><code>/openapi.yaml</code></a>.</p>
  <p>Health report: <a href="/health"><code>/health</code></a>.</p>
</body>
</html>
"#;

/// OpenAPI 3 description of the HTTP surface. Generated once from the
/// routing table rather than maintained as a separate artifact.
fn openapi_document() -> Value {
    let error_response = json!({
        "description": "Error",
        "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Error"}}}
    });

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": "mikroscope",
            "description": "Log sidecar: durable NDJSON ingest, queryable index, retention maintenance, webhook alerting.",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/health": {
                "get": {
                    "summary": "Composite health report",
                    "responses": {"200": {"description": "Health report"}}
                }
            },
            "/api/ingest": {
                "post": {
                    "summary": "Push a batch of NDJSON records",
                    "description": "Accepts a JSON array of objects or an object with a `logs` array. The producer id is resolved from credentials and cannot be forged.",
                    "security": [{"bearer": []}, {"basic": []}],
                    "responses": {
                        "200": {"description": "Accepted synchronously"},
                        "202": {"description": "Queued"},
                        "400": error_response.clone(),
                        "401": error_response.clone(),
                        "404": {"description": "Ingest not configured"},
                        "413": {"description": "Body too large"}
                    }
                }
            },
            "/api/logs": {
                "get": {
                    "summary": "Query indexed entries",
                    "parameters": [
                        {"name": "from", "in": "query", "schema": {"type": "string"}},
                        {"name": "to", "in": "query", "schema": {"type": "string"}},
                        {"name": "level", "in": "query", "schema": {"type": "string"}},
                        {"name": "audit", "in": "query", "schema": {"type": "string", "enum": ["true", "false", "1", "0"]}},
                        {"name": "field", "in": "query", "schema": {"type": "string"}},
                        {"name": "value", "in": "query", "schema": {"type": "string"}},
                        {"name": "limit", "in": "query", "schema": {"type": "integer", "maximum": 1000}},
                        {"name": "cursor", "in": "query", "schema": {"type": "string"}}
                    ],
                    "responses": {
                        "200": {"description": "One page of entries"},
                        "400": error_response.clone(),
                        "401": error_response.clone()
                    }
                }
            },
            "/api/logs/aggregate": {
                "get": {
                    "summary": "Grouped counts",
                    "parameters": [
                        {"name": "groupBy", "in": "query", "required": true,
                         "schema": {"type": "string", "enum": ["level", "event", "field", "correlation"]}},
                        {"name": "groupField", "in": "query", "schema": {"type": "string"}},
                        {"name": "limit", "in": "query", "schema": {"type": "integer", "maximum": 1000}}
                    ],
                    "responses": {
                        "200": {"description": "Buckets ordered by count"},
                        "400": error_response.clone(),
                        "401": error_response.clone()
                    }
                }
            },
            "/api/reindex": {
                "post": {
                    "summary": "Wipe the index and rebuild from raw files",
                    "responses": {
                        "200": {"description": "Reindex report"},
                        "401": error_response.clone()
                    }
                }
            },
            "/api/alerts/config": {
                "get": {
                    "summary": "Current alert policy",
                    "responses": {"200": {"description": "Config path and raw policy"}}
                },
                "put": {
                    "summary": "Update the alert policy",
                    "responses": {
                        "200": {"description": "Merged policy"},
                        "400": error_response.clone()
                    }
                }
            },
            "/api/alerts/test-webhook": {
                "post": {
                    "summary": "Send a manual test webhook",
                    "responses": {
                        "200": {"description": "Delivery succeeded"},
                        "400": error_response
                    }
                }
            }
        },
        "components": {
            "schemas": {
                "Error": {
                    "type": "object",
                    "properties": {"error": {"type": "string"}},
                    "required": ["error"]
                }
            },
            "securitySchemes": {
                "bearer": {"type": "http", "scheme": "bearer"},
                "basic": {"type": "http", "scheme": "basic"}
            }
        }
    })
}
