//! Alert policy: validation bounds, JSON persistence, masking.
//!
//! The policy file is the durable copy; the manager holds a cached
//! in-memory value and rewrites the file on every update.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AlertError, Result};

/// Persisted alerting policy. Serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertPolicy {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub interval_ms: u64,
    pub window_minutes: u64,
    pub error_threshold: u64,
    /// `0` disables the no-logs rule.
    pub no_logs_threshold_minutes: u64,
    pub cooldown_ms: u64,
    pub webhook_timeout_ms: u64,
    pub webhook_retry_attempts: u32,
    pub webhook_backoff_ms: u64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            interval_ms: 30_000,
            window_minutes: 5,
            error_threshold: 20,
            no_logs_threshold_minutes: 0,
            cooldown_ms: 300_000,
            webhook_timeout_ms: 5_000,
            webhook_retry_attempts: 3,
            webhook_backoff_ms: 250,
        }
    }
}

impl AlertPolicy {
    /// Enforce the documented field minimums.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.webhook_url.is_none() {
            return Err(AlertError::Validation(
                "enabled requires a webhookUrl".to_string(),
            ));
        }
        if let Some(url) = &self.webhook_url {
            if url.trim().is_empty() {
                return Err(AlertError::Validation("webhookUrl must not be empty".to_string()));
            }
        }
        let checks: [(&str, u64, u64); 7] = [
            ("intervalMs", self.interval_ms, 1000),
            ("windowMinutes", self.window_minutes, 1),
            ("errorThreshold", self.error_threshold, 1),
            ("cooldownMs", self.cooldown_ms, 1000),
            ("webhookTimeoutMs", self.webhook_timeout_ms, 250),
            ("webhookRetryAttempts", self.webhook_retry_attempts as u64, 1),
            ("webhookBackoffMs", self.webhook_backoff_ms, 25),
        ];
        for (name, value, min) in checks {
            if value < min {
                return Err(AlertError::Validation(format!(
                    "{name} must be at least {min}, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Apply a per-field patch. `webhookUrl: null` clears the URL.
    pub fn apply(&mut self, patch: &PolicyPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(url) = &patch.webhook_url {
            self.webhook_url = url.clone();
        }
        if let Some(value) = patch.interval_ms {
            self.interval_ms = value;
        }
        if let Some(value) = patch.window_minutes {
            self.window_minutes = value;
        }
        if let Some(value) = patch.error_threshold {
            self.error_threshold = value;
        }
        if let Some(value) = patch.no_logs_threshold_minutes {
            self.no_logs_threshold_minutes = value;
        }
        if let Some(value) = patch.cooldown_ms {
            self.cooldown_ms = value;
        }
        if let Some(value) = patch.webhook_timeout_ms {
            self.webhook_timeout_ms = value;
        }
        if let Some(value) = patch.webhook_retry_attempts {
            self.webhook_retry_attempts = value;
        }
        if let Some(value) = patch.webhook_backoff_ms {
            self.webhook_backoff_ms = value;
        }
    }

    /// Policy rendering for unauthenticated surfaces: the webhook URL is
    /// replaced by `"[configured]"`, or omitted when unset.
    pub fn masked(&self) -> Value {
        let mut value = json!(self);
        if let Some(object) = value.as_object_mut() {
            match self.webhook_url {
                Some(_) => {
                    object.insert("webhookUrl".to_string(), json!("[configured]"));
                }
                None => {
                    object.remove("webhookUrl");
                }
            }
        }
        value
    }
}

/// Per-field policy update. All fields optional; missing means "keep".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyPatch {
    pub enabled: Option<bool>,
    /// `None` = untouched, `Some(None)` = explicit null, clears the URL.
    pub webhook_url: Option<Option<String>>,
    pub interval_ms: Option<u64>,
    pub window_minutes: Option<u64>,
    pub error_threshold: Option<u64>,
    pub no_logs_threshold_minutes: Option<u64>,
    pub cooldown_ms: Option<u64>,
    pub webhook_timeout_ms: Option<u64>,
    pub webhook_retry_attempts: Option<u32>,
    pub webhook_backoff_ms: Option<u64>,
}

/// JSON keys accepted by `PUT /api/alerts/config`; anything else is a
/// validation error at the HTTP layer.
pub const POLICY_KEYS: &[&str] = &[
    "enabled",
    "webhookUrl",
    "intervalMs",
    "windowMinutes",
    "errorThreshold",
    "noLogsThresholdMinutes",
    "cooldownMs",
    "webhookTimeoutMs",
    "webhookRetryAttempts",
    "webhookBackoffMs",
];

/// Load the persisted policy patch, if the file exists.
pub fn load_policy_patch(path: &Path) -> Result<Option<PolicyPatch>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let patch: PolicyPatch = serde_json::from_str(&raw)?;
    Ok(Some(patch))
}

/// Persist the merged policy atomically (temp file + rename), creating
/// parent directories and restricting the file to mode `0600`.
pub fn save_policy(path: &Path, policy: &AlertPolicy) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(policy)?;
    fs::write(&tmp, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "persisted alert policy");
    Ok(())
}
