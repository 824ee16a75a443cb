//! Webhook delivery with bounded retries.
//!
//! Timeouts, connection failures, and 408/429/5xx responses are
//! retryable with exponential backoff; any other non-2xx status is
//! terminal and consumes no further attempts.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AlertError, Result};

/// Payload POSTed to the webhook target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub source: &'static str,
    pub rule: String,
    pub severity: String,
    pub triggered_at: String,
    pub service_url: String,
    pub details: Value,
}

/// Retry knobs, lifted from the active policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub attempts: u32,
    pub timeout_ms: u64,
    pub backoff_ms: u64,
}

/// POST `payload` to `url`, honoring the retry budget. Returns the
/// number of attempts made on success.
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    payload: &WebhookPayload,
    retry: RetryConfig,
) -> Result<u32> {
    let attempts = retry.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if attempt > 1 {
            let backoff = retry.backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 2));
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        let outcome = client
            .post(url)
            .timeout(Duration::from_millis(retry.timeout_ms))
            .json(payload)
            .send()
            .await;

        match outcome {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(rule = %payload.rule, attempt, "webhook delivered");
                    return Ok(attempt);
                }
                if is_retryable_status(status.as_u16()) {
                    last_error = format!("webhook returned {status} (attempt {attempt})");
                    warn!(rule = %payload.rule, %status, attempt, "retryable webhook status");
                } else {
                    return Err(AlertError::Webhook(format!(
                        "webhook returned terminal status {status}"
                    )));
                }
            }
            Err(err) => {
                // Timeouts and connect errors are retryable by policy.
                last_error = format!("webhook request failed: {err} (attempt {attempt})");
                warn!(rule = %payload.rule, error = %err, attempt, "webhook attempt failed");
            }
        }
    }

    Err(AlertError::Webhook(format!(
        "exhausted {attempts} attempts: {last_error}"
    )))
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn payload() -> WebhookPayload {
        WebhookPayload {
            source: "mikroscope",
            rule: "manual_test".to_string(),
            severity: "warning".to_string(),
            triggered_at: "2026-01-01T00:00:00.000Z".to_string(),
            service_url: "http://127.0.0.1:0".to_string(),
            details: json!({"message": "test"}),
        }
    }

    /// Bind a throwaway server whose handler pops status codes off a
    /// script, counting the calls it receives.
    async fn hook_server(script: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let state = (Arc::clone(&hits), Arc::new(script));

        async fn handler(
            State((hits, script)): State<(Arc<AtomicU32>, Arc<Vec<u16>>)>,
        ) -> StatusCode {
            let call = hits.fetch_add(1, Ordering::SeqCst) as usize;
            let code = script.get(call).copied().unwrap_or(204);
            StatusCode::from_u16(code).unwrap_or(StatusCode::NO_CONTENT)
        }

        let app = Router::new().route("/hook", post(handler)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}/hook"), hits)
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            attempts,
            timeout_ms: 1000,
            backoff_ms: 25,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_on_2xx() {
        let (url, hits) = hook_server(vec![200]).await;
        let client = reqwest::Client::new();
        let attempts = deliver(&client, &url, &payload(), fast_retry(3))
            .await
            .expect("delivered");
        assert_eq!(attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_through_5xx_then_succeeds() {
        let (url, hits) = hook_server(vec![500, 500, 204]).await;
        let client = reqwest::Client::new();
        let attempts = deliver(&client, &url, &payload(), fast_retry(3))
            .await
            .expect("delivered");
        assert_eq!(attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_budget_is_a_hard_cap() {
        let (url, hits) = hook_server(vec![500, 500, 500, 500]).await;
        let client = reqwest::Client::new();
        let err = deliver(&client, &url, &payload(), fast_retry(3))
            .await
            .expect_err("exhausted");
        assert!(matches!(err, AlertError::Webhook(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_status_makes_exactly_one_attempt() {
        let (url, hits) = hook_server(vec![400]).await;
        let client = reqwest::Client::new();
        let err = deliver(&client, &url, &payload(), fast_retry(3))
            .await
            .expect_err("terminal");
        assert!(err.to_string().contains("terminal"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_failure_is_retried() {
        // Nothing listens on this port; every attempt errors.
        let client = reqwest::Client::new();
        let err = deliver(
            &client,
            "http://127.0.0.1:9/hook",
            &payload(),
            fast_retry(2),
        )
        .await
        .expect_err("unreachable");
        assert!(err.to_string().contains("exhausted 2 attempts"));
    }
}
