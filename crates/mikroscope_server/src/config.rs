//! Resolved runtime configuration consumed by the server.
//!
//! Layering (defaults, config file, environment, flags) happens in the
//! binary crate; by the time a `ServerConfig` reaches this crate every
//! field holds its final value.

use std::collections::HashMap;
use std::path::PathBuf;

use mikroscope_alerts::AlertPolicy;

pub const DEFAULT_MAX_BODY_BYTES: usize = 1_048_576;
pub const DEFAULT_INGEST_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_INGEST_QUEUE_FLUSH_MS: u64 = 250;
pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 21_600_000;
pub const MIN_MAINTENANCE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MIN_FREE_BYTES: u64 = 256 * 1024 * 1024;
pub const ALERT_CONFIG_FILE_NAME: &str = "mikroscope.alert-config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub logs_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    pub api_token: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    /// Comma-separated origin list; `*` means wildcard.
    pub cors_allow_origin: String,

    /// Bearer token to producer id.
    pub ingest_producers: HashMap<String, String>,
    pub ingest_max_body_bytes: usize,
    pub ingest_interval_ms: u64,
    pub disable_auto_ingest: bool,
    pub ingest_async_queue: bool,
    pub ingest_queue_flush_ms: u64,

    /// `0` disables a retention class.
    pub db_retention_days: u32,
    pub db_audit_retention_days: u32,
    pub log_retention_days: u32,
    pub log_audit_retention_days: u32,
    pub maintenance_interval_ms: u64,
    pub audit_backup_directory: Option<PathBuf>,

    pub min_free_bytes: u64,
    pub alert_config_path: Option<PathBuf>,
    /// Policy assembled from defaults, environment, and flags; the
    /// persisted file overlays this at manager construction.
    pub alert_seed: AlertPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("mikroscope.db"),
            logs_path: PathBuf::from("logs"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: Protocol::Http,
            tls_cert_path: None,
            tls_key_path: None,
            api_token: None,
            auth_username: None,
            auth_password: None,
            cors_allow_origin: "*".to_string(),
            ingest_producers: HashMap::new(),
            ingest_max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            ingest_interval_ms: DEFAULT_INGEST_INTERVAL_MS,
            disable_auto_ingest: false,
            ingest_async_queue: false,
            ingest_queue_flush_ms: DEFAULT_INGEST_QUEUE_FLUSH_MS,
            db_retention_days: 30,
            db_audit_retention_days: 365,
            log_retention_days: 30,
            log_audit_retention_days: 365,
            maintenance_interval_ms: DEFAULT_MAINTENANCE_INTERVAL_MS,
            audit_backup_directory: None,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            alert_config_path: None,
            alert_seed: AlertPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Alert config file path, defaulting to a sibling of the database.
    pub fn resolved_alert_config_path(&self) -> PathBuf {
        match &self.alert_config_path {
            Some(path) => path.clone(),
            None => self
                .db_path
                .parent()
                .map(|parent| parent.join(ALERT_CONFIG_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(ALERT_CONFIG_FILE_NAME)),
        }
    }

    /// Whether basic credentials are fully configured.
    pub fn basic_auth_configured(&self) -> bool {
        self.auth_username.is_some() && self.auth_password.is_some()
    }

    /// Parse an `ingestProducers` option string: comma-separated
    /// `token=producerId` pairs. Malformed pairs are skipped.
    pub fn parse_producers(raw: &str) -> HashMap<String, String> {
        raw.split(',')
            .filter_map(|pair| {
                let (token, producer) = pair.split_once('=')?;
                let token = token.trim();
                let producer = producer.trim();
                if token.is_empty() || producer.is_empty() {
                    return None;
                }
                Some((token.to_string(), producer.to_string()))
            })
            .collect()
    }
}
