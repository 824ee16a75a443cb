//! Error types for the alerting subsystem.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("invalid alert policy: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Index(#[from] mikroscope_index::IndexError),

    #[error("webhook delivery failed: {0}")]
    Webhook(String),

    #[error("no webhook URL configured")]
    NoWebhookUrl,
}

pub type Result<T> = std::result::Result<T, AlertError>;
