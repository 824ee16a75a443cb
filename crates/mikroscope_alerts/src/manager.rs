//! Periodic alert evaluation.
//!
//! The manager owns the cached policy and the process-local alert
//! state. A timer task runs one cycle immediately on start and then at
//! `intervalMs`; overlapping cycles short-circuit on the running flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mikroscope_index::{to_iso, EntryFilter, IndexStore};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AlertError, Result};
use crate::policy::{load_policy_patch, save_policy, AlertPolicy, PolicyPatch};
use crate::webhook::{deliver, RetryConfig, WebhookPayload};

pub const RULE_ERROR_THRESHOLD: &str = "error_threshold";
pub const RULE_NO_LOGS: &str = "no_logs";
pub const RULE_MANUAL_TEST: &str = "manual_test";

/// Process-local counters, surfaced through `/health`.
#[derive(Debug, Default)]
struct AlertState {
    runs: u64,
    sent: u64,
    suppressed: u64,
    last_trigger_at_by_rule: HashMap<String, DateTime<Utc>>,
    last_error: Option<String>,
    last_cycle_at: Option<String>,
    last_cycle_duration_ms: Option<u64>,
}

/// Read-only view of the alert state for the health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStateSnapshot {
    pub enabled: bool,
    pub runs: u64,
    pub sent: u64,
    pub suppressed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_duration_ms: Option<u64>,
    pub last_trigger_at_by_rule: HashMap<String, String>,
}

struct ManagerInner {
    store: IndexStore,
    config_path: PathBuf,
    client: reqwest::Client,
    policy: StdMutex<AlertPolicy>,
    state: StdMutex<AlertState>,
    running: AtomicBool,
    service_url: StdMutex<String>,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

/// Alerting manager. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<ManagerInner>,
}

impl AlertManager {
    /// Build the manager: load the persisted policy if present and
    /// overlay it onto the seed. A corrupt file logs a warning and
    /// falls back to the seed.
    pub fn new(store: IndexStore, config_path: impl Into<PathBuf>, seed: AlertPolicy) -> Self {
        let config_path = config_path.into();
        let mut policy = seed.clone();
        match load_policy_patch(&config_path) {
            Ok(Some(patch)) => {
                policy.apply(&patch);
                if let Err(err) = policy.validate() {
                    warn!(path = %config_path.display(), error = %err,
                        "persisted alert policy invalid, using seed");
                    policy = seed;
                } else {
                    info!(path = %config_path.display(), "loaded persisted alert policy");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(path = %config_path.display(), error = %err,
                    "failed to read alert policy, using seed");
            }
        }

        Self {
            inner: Arc::new(ManagerInner {
                store,
                config_path,
                client: reqwest::Client::new(),
                policy: StdMutex::new(policy),
                state: StdMutex::new(AlertState::default()),
                running: AtomicBool::new(false),
                service_url: StdMutex::new(String::new()),
                timer: StdMutex::new(None),
            }),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    pub fn set_service_url(&self, url: impl Into<String>) {
        if let Ok(mut guard) = self.inner.service_url.lock() {
            *guard = url.into();
        }
    }

    fn service_url(&self) -> String {
        self.inner
            .service_url
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn policy(&self) -> AlertPolicy {
        self.inner
            .policy
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn masked_policy(&self) -> Value {
        self.policy().masked()
    }

    pub fn state_snapshot(&self) -> AlertStateSnapshot {
        let policy = self.policy();
        let state = self.inner.state.lock();
        match state {
            Ok(state) => AlertStateSnapshot {
                enabled: policy.enabled && policy.webhook_url.is_some(),
                runs: state.runs,
                sent: state.sent,
                suppressed: state.suppressed,
                last_error: state.last_error.clone(),
                last_cycle_at: state.last_cycle_at.clone(),
                last_cycle_duration_ms: state.last_cycle_duration_ms,
                last_trigger_at_by_rule: state
                    .last_trigger_at_by_rule
                    .iter()
                    .map(|(rule, at)| (rule.clone(), to_iso(*at)))
                    .collect(),
            },
            Err(_) => AlertStateSnapshot {
                enabled: false,
                runs: 0,
                sent: 0,
                suppressed: 0,
                last_error: Some("alert state lock poisoned".to_string()),
                last_cycle_at: None,
                last_cycle_duration_ms: None,
                last_trigger_at_by_rule: HashMap::new(),
            },
        }
    }

    /// Start the evaluation timer if the policy is enabled. The first
    /// cycle runs immediately.
    pub fn start(&self) {
        let policy = self.policy();
        if !policy.enabled || policy.webhook_url.is_none() {
            debug!("alerting disabled, timer not started");
            return;
        }
        let manager = self.clone();
        let interval_ms = policy.interval_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1000)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.run_cycle().await;
            }
        });
        if let Ok(mut timer) = self.inner.timer.lock() {
            if let Some(previous) = timer.replace(handle) {
                previous.abort();
            }
        }
        info!(interval_ms, "alerting timer started");
    }

    /// Stop the evaluation timer. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut timer) = self.inner.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    /// Merge a patch, validate, persist, and reschedule the timer.
    pub fn update_policy(&self, patch: &PolicyPatch) -> Result<AlertPolicy> {
        let mut merged = self.policy();
        merged.apply(patch);
        merged.validate()?;
        save_policy(&self.inner.config_path, &merged)?;
        if let Ok(mut guard) = self.inner.policy.lock() {
            *guard = merged.clone();
        }
        self.stop();
        self.start();
        Ok(merged)
    }

    /// One evaluation cycle. Overlapping invocations are skipped.
    pub async fn run_cycle(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("alert cycle already running, skipping");
            return;
        }
        let started = Instant::now();
        let result = self.evaluate().await;

        if let Ok(mut state) = self.inner.state.lock() {
            state.runs += 1;
            state.last_cycle_at = Some(to_iso(Utc::now()));
            state.last_cycle_duration_ms = Some(started.elapsed().as_millis() as u64);
            if let Err(err) = &result {
                state.last_error = Some(err.to_string());
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    async fn evaluate(&self) -> Result<()> {
        let policy = self.policy();
        if !policy.enabled || policy.webhook_url.is_none() {
            return Ok(());
        }
        let now = Utc::now();

        // error_threshold rule
        let window_start = to_iso(now - chrono::Duration::minutes(policy.window_minutes as i64));
        let error_count = self
            .inner
            .store
            .count(&EntryFilter {
                from: Some(window_start.clone()),
                level: Some("ERROR".to_string()),
                ..Default::default()
            })
            .await?;
        if error_count >= policy.error_threshold as i64 {
            let total_window_count = self
                .inner
                .store
                .count(&EntryFilter {
                    from: Some(window_start),
                    ..Default::default()
                })
                .await?;
            self.trigger(
                RULE_ERROR_THRESHOLD,
                "critical",
                json!({
                    "errorCount": error_count,
                    "threshold": policy.error_threshold,
                    "totalWindowCount": total_window_count,
                    "windowMinutes": policy.window_minutes,
                }),
                &policy,
                now,
            )
            .await;
        }

        // no_logs rule, only when armed
        if policy.no_logs_threshold_minutes > 0 {
            let recent_start =
                to_iso(now - chrono::Duration::minutes(policy.no_logs_threshold_minutes as i64));
            let total_recent = self
                .inner
                .store
                .count(&EntryFilter {
                    from: Some(recent_start),
                    ..Default::default()
                })
                .await?;
            if total_recent == 0 {
                self.trigger(
                    RULE_NO_LOGS,
                    "warning",
                    json!({
                        "thresholdMinutes": policy.no_logs_threshold_minutes,
                    }),
                    &policy,
                    now,
                )
                .await;
            }
        }

        Ok(())
    }

    /// Deliver one rule trigger, honoring the per-rule cooldown.
    async fn trigger(
        &self,
        rule: &str,
        severity: &str,
        details: Value,
        policy: &AlertPolicy,
        now: DateTime<Utc>,
    ) {
        let suppressed = self
            .inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.last_trigger_at_by_rule.get(rule).copied())
            .map(|last| {
                let elapsed = now.signed_duration_since(last).num_milliseconds();
                elapsed >= 0 && (elapsed as u64) < policy.cooldown_ms
            })
            .unwrap_or(false);

        if suppressed {
            debug!(rule, "alert suppressed by cooldown");
            if let Ok(mut state) = self.inner.state.lock() {
                state.suppressed += 1;
            }
            return;
        }

        let Some(url) = policy.webhook_url.clone() else {
            return;
        };
        let payload = WebhookPayload {
            source: "mikroscope",
            rule: rule.to_string(),
            severity: severity.to_string(),
            triggered_at: to_iso(now),
            service_url: self.service_url(),
            details,
        };
        let retry = RetryConfig {
            attempts: policy.webhook_retry_attempts,
            timeout_ms: policy.webhook_timeout_ms,
            backoff_ms: policy.webhook_backoff_ms,
        };

        match deliver(&self.inner.client, &url, &payload, retry).await {
            Ok(attempts) => {
                info!(rule, attempts, "alert webhook sent");
                if let Ok(mut state) = self.inner.state.lock() {
                    state.sent += 1;
                    state.last_trigger_at_by_rule.insert(rule.to_string(), now);
                }
            }
            Err(err) => {
                warn!(rule, error = %err, "alert webhook failed");
                if let Ok(mut state) = self.inner.state.lock() {
                    state.last_error = Some(err.to_string());
                }
            }
        }
    }

    /// Manual webhook test: optional URL override, full retry
    /// machinery. Returns `(sent_at, target_url)`.
    pub async fn send_test_webhook(
        &self,
        override_url: Option<String>,
    ) -> Result<(String, String)> {
        let policy = self.policy();
        let target = override_url
            .or_else(|| policy.webhook_url.clone())
            .ok_or(AlertError::NoWebhookUrl)?;

        let sent_at = to_iso(Utc::now());
        let payload = WebhookPayload {
            source: "mikroscope",
            rule: RULE_MANUAL_TEST.to_string(),
            severity: "warning".to_string(),
            triggered_at: sent_at.clone(),
            service_url: self.service_url(),
            details: json!({
                "message": "Manual webhook test triggered from mikroscope",
            }),
        };
        let retry = RetryConfig {
            attempts: policy.webhook_retry_attempts,
            timeout_ms: policy.webhook_timeout_ms,
            backoff_ms: policy.webhook_backoff_ms,
        };
        deliver(&self.inner.client, &target, &payload, retry).await?;
        Ok((sent_at, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use mikroscope_index::NewEntry;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    async fn hook_server() -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        async fn handler(State(hits): State<Arc<AtomicU32>>) -> StatusCode {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::NO_CONTENT
        }
        let app = Router::new()
            .route("/hook", post(handler))
            .with_state(Arc::clone(&hits));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}/hook"), hits)
    }

    async fn seed_errors(store: &IndexStore, count: usize) {
        let now = to_iso(Utc::now());
        for line in 0..count {
            store
                .upsert_entry(&NewEntry {
                    timestamp: now.clone(),
                    level: "ERROR".to_string(),
                    event: "boom".to_string(),
                    message: String::new(),
                    is_audit: false,
                    data_json: "{}".to_string(),
                    source_file: "app.ndjson".to_string(),
                    line_number: line as i64 + 1,
                })
                .await
                .expect("seed");
        }
    }

    fn policy_with(url: &str) -> AlertPolicy {
        AlertPolicy {
            enabled: true,
            webhook_url: Some(url.to_string()),
            error_threshold: 1,
            window_minutes: 60,
            cooldown_ms: 300_000,
            webhook_backoff_ms: 25,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn threshold_breach_sends_once_then_cooldown_suppresses() {
        let (url, hits) = hook_server().await;
        let store = IndexStore::open_in_memory().await.expect("store");
        seed_errors(&store, 2).await;

        let dir = TempDir::new().expect("tempdir");
        let manager = AlertManager::new(
            store,
            dir.path().join("alert-config.json"),
            policy_with(&url),
        );

        manager.run_cycle().await;
        manager.run_cycle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1, "second trigger suppressed");
        let snapshot = manager.state_snapshot();
        assert_eq!(snapshot.runs, 2);
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.suppressed, 1);
        assert!(snapshot
            .last_trigger_at_by_rule
            .contains_key(RULE_ERROR_THRESHOLD));
    }

    #[tokio::test]
    async fn below_threshold_sends_nothing() {
        let (url, hits) = hook_server().await;
        let store = IndexStore::open_in_memory().await.expect("store");
        seed_errors(&store, 2).await;

        let dir = TempDir::new().expect("tempdir");
        let mut policy = policy_with(&url);
        policy.error_threshold = 10;
        let manager = AlertManager::new(store, dir.path().join("alert-config.json"), policy);

        manager.run_cycle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_logs_rule_fires_only_when_armed() {
        let (url, hits) = hook_server().await;
        let store = IndexStore::open_in_memory().await.expect("store");

        let dir = TempDir::new().expect("tempdir");
        let mut policy = policy_with(&url);
        policy.error_threshold = 100;
        policy.no_logs_threshold_minutes = 5;
        let manager = AlertManager::new(store, dir.path().join("alert-config.json"), policy);

        manager.run_cycle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let snapshot = manager.state_snapshot();
        assert!(snapshot.last_trigger_at_by_rule.contains_key(RULE_NO_LOGS));
    }

    #[tokio::test]
    async fn update_policy_persists_and_reloads() {
        let store = IndexStore::open_in_memory().await.expect("store");
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("alert-config.json");

        let manager = AlertManager::new(store.clone(), &path, AlertPolicy::default());
        let patch: PolicyPatch = serde_json::from_str(
            r#"{"enabled": true, "webhookUrl": "https://hooks.example/x", "errorThreshold": 9}"#,
        )
        .expect("patch");
        let merged = manager.update_policy(&patch).expect("update");
        assert_eq!(merged.error_threshold, 9);

        // A fresh manager with a plain seed sees the persisted values.
        let reloaded = AlertManager::new(store, &path, AlertPolicy::default());
        let policy = reloaded.policy();
        assert!(policy.enabled);
        assert_eq!(policy.error_threshold, 9);
        assert_eq!(
            policy.webhook_url.as_deref(),
            Some("https://hooks.example/x")
        );
    }

    #[tokio::test]
    async fn update_policy_rejects_invalid_patch() {
        let store = IndexStore::open_in_memory().await.expect("store");
        let dir = TempDir::new().expect("tempdir");
        let manager = AlertManager::new(
            store,
            dir.path().join("alert-config.json"),
            AlertPolicy::default(),
        );

        let patch: PolicyPatch = serde_json::from_str(r#"{"enabled": true}"#).expect("patch");
        let err = manager.update_policy(&patch).expect_err("invalid");
        assert!(matches!(err, AlertError::Validation(_)));
        // Cached policy untouched.
        assert!(!manager.policy().enabled);
    }

    #[tokio::test]
    async fn test_webhook_requires_some_target() {
        let store = IndexStore::open_in_memory().await.expect("store");
        let dir = TempDir::new().expect("tempdir");
        let manager = AlertManager::new(
            store,
            dir.path().join("alert-config.json"),
            AlertPolicy::default(),
        );
        let err = manager.send_test_webhook(None).await.expect_err("no url");
        assert!(matches!(err, AlertError::NoWebhookUrl));
    }

    #[tokio::test]
    async fn test_webhook_honors_override() {
        let (url, hits) = hook_server().await;
        let store = IndexStore::open_in_memory().await.expect("store");
        let dir = TempDir::new().expect("tempdir");
        let manager = AlertManager::new(
            store,
            dir.path().join("alert-config.json"),
            AlertPolicy::default(),
        );
        let (_, target) = manager
            .send_test_webhook(Some(url.clone()))
            .await
            .expect("sent");
        assert_eq!(target, url);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
