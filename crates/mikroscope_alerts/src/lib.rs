//! Threshold-based alerting with webhook delivery.
//!
//! A persisted [`AlertPolicy`] drives a periodic evaluator over the
//! index; triggered rules POST to a webhook with bounded retries and a
//! per-rule cooldown.

pub mod error;
pub mod manager;
pub mod policy;
pub mod webhook;

pub use error::{AlertError, Result};
pub use manager::{
    AlertManager, AlertStateSnapshot, RULE_ERROR_THRESHOLD, RULE_MANUAL_TEST, RULE_NO_LOGS,
};
pub use policy::{load_policy_patch, save_policy, AlertPolicy, PolicyPatch, POLICY_KEYS};
pub use webhook::{deliver, RetryConfig, WebhookPayload};
