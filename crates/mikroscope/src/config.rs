//! Layered configuration resolution.
//!
//! Precedence per field, lowest to highest: built-in defaults, the JSON
//! config file, `MIKROSCOPE_*` environment variables, direct flags.
//! Flags and environment share one layer (clap resolves env fallbacks),
//! which already puts flags above environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use mikroscope_alerts::AlertPolicy;
use mikroscope_server::{Protocol, ServerConfig};
use serde::Deserialize;

/// Every recognized option, as flags with environment fallbacks.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// JSON configuration file
    #[arg(long, env = "MIKROSCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Index database file
    #[arg(long, env = "MIKROSCOPE_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Root of the raw NDJSON tree
    #[arg(long, env = "MIKROSCOPE_LOGS_PATH")]
    pub logs_path: Option<PathBuf>,

    #[arg(long, env = "MIKROSCOPE_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "MIKROSCOPE_PORT")]
    pub port: Option<u16>,

    /// http or https
    #[arg(long, env = "MIKROSCOPE_PROTOCOL")]
    pub protocol: Option<String>,

    #[arg(long, env = "MIKROSCOPE_TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long, env = "MIKROSCOPE_TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    /// Bearer token for the query/admin API
    #[arg(long, env = "MIKROSCOPE_API_TOKEN")]
    pub api_token: Option<String>,

    #[arg(long, env = "MIKROSCOPE_AUTH_USERNAME")]
    pub auth_username: Option<String>,

    #[arg(long, env = "MIKROSCOPE_AUTH_PASSWORD")]
    pub auth_password: Option<String>,

    /// Comma-separated origin list, or *
    #[arg(long, env = "MIKROSCOPE_CORS_ALLOW_ORIGIN")]
    pub cors_allow_origin: Option<String>,

    /// Comma-separated token=producerId pairs
    #[arg(long, env = "MIKROSCOPE_INGEST_PRODUCERS")]
    pub ingest_producers: Option<String>,

    #[arg(long, env = "MIKROSCOPE_INGEST_MAX_BODY_BYTES")]
    pub ingest_max_body_bytes: Option<usize>,

    #[arg(long, env = "MIKROSCOPE_INGEST_INTERVAL_MS")]
    pub ingest_interval_ms: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_DISABLE_AUTO_INGEST")]
    pub disable_auto_ingest: Option<bool>,

    #[arg(long, env = "MIKROSCOPE_INGEST_ASYNC_QUEUE")]
    pub ingest_async_queue: Option<bool>,

    #[arg(long, env = "MIKROSCOPE_INGEST_QUEUE_FLUSH_MS")]
    pub ingest_queue_flush_ms: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_DB_RETENTION_DAYS")]
    pub db_retention_days: Option<u32>,

    #[arg(long, env = "MIKROSCOPE_DB_AUDIT_RETENTION_DAYS")]
    pub db_audit_retention_days: Option<u32>,

    #[arg(long, env = "MIKROSCOPE_LOG_RETENTION_DAYS")]
    pub log_retention_days: Option<u32>,

    #[arg(long, env = "MIKROSCOPE_LOG_AUDIT_RETENTION_DAYS")]
    pub log_audit_retention_days: Option<u32>,

    #[arg(long, env = "MIKROSCOPE_MAINTENANCE_INTERVAL_MS")]
    pub maintenance_interval_ms: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_MIN_FREE_BYTES")]
    pub min_free_bytes: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_AUDIT_BACKUP_DIRECTORY")]
    pub audit_backup_directory: Option<PathBuf>,

    #[arg(long, env = "MIKROSCOPE_ALERT_CONFIG_PATH")]
    pub alert_config_path: Option<PathBuf>,

    #[arg(long, env = "MIKROSCOPE_ALERT_ENABLED")]
    pub alert_enabled: Option<bool>,

    #[arg(long, env = "MIKROSCOPE_ALERT_WEBHOOK_URL")]
    pub alert_webhook_url: Option<String>,

    #[arg(long, env = "MIKROSCOPE_ALERT_INTERVAL_MS")]
    pub alert_interval_ms: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_ALERT_WINDOW_MINUTES")]
    pub alert_window_minutes: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_ALERT_ERROR_THRESHOLD")]
    pub alert_error_threshold: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_ALERT_NO_LOGS_THRESHOLD_MINUTES")]
    pub alert_no_logs_threshold_minutes: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_ALERT_COOLDOWN_MS")]
    pub alert_cooldown_ms: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_ALERT_WEBHOOK_TIMEOUT_MS")]
    pub alert_webhook_timeout_ms: Option<u64>,

    #[arg(long, env = "MIKROSCOPE_ALERT_WEBHOOK_RETRY_ATTEMPTS")]
    pub alert_webhook_retry_attempts: Option<u32>,

    #[arg(long, env = "MIKROSCOPE_ALERT_WEBHOOK_BACKOFF_MS")]
    pub alert_webhook_backoff_ms: Option<u64>,
}

/// The same options, as an optional JSON document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileOptions {
    pub db_path: Option<PathBuf>,
    pub logs_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub api_token: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub cors_allow_origin: Option<String>,
    pub ingest_producers: Option<String>,
    pub ingest_max_body_bytes: Option<usize>,
    pub ingest_interval_ms: Option<u64>,
    pub disable_auto_ingest: Option<bool>,
    pub ingest_async_queue: Option<bool>,
    pub ingest_queue_flush_ms: Option<u64>,
    pub db_retention_days: Option<u32>,
    pub db_audit_retention_days: Option<u32>,
    pub log_retention_days: Option<u32>,
    pub log_audit_retention_days: Option<u32>,
    pub maintenance_interval_ms: Option<u64>,
    pub min_free_bytes: Option<u64>,
    pub audit_backup_directory: Option<PathBuf>,
    pub alert_config_path: Option<PathBuf>,
    pub alert_enabled: Option<bool>,
    pub alert_webhook_url: Option<String>,
    pub alert_interval_ms: Option<u64>,
    pub alert_window_minutes: Option<u64>,
    pub alert_error_threshold: Option<u64>,
    pub alert_no_logs_threshold_minutes: Option<u64>,
    pub alert_cooldown_ms: Option<u64>,
    pub alert_webhook_timeout_ms: Option<u64>,
    pub alert_webhook_retry_attempts: Option<u32>,
    pub alert_webhook_backoff_ms: Option<u64>,
}

pub fn load_file_options(path: &Path) -> Result<FileOptions> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Resolve the final server configuration from all layers.
pub fn resolve(args: &ServeArgs) -> Result<ServerConfig> {
    let file = match &args.config {
        Some(path) => load_file_options(path)?,
        None => FileOptions::default(),
    };
    let defaults = ServerConfig::default();

    let protocol_raw = args
        .protocol
        .clone()
        .or_else(|| file.protocol.clone())
        .unwrap_or_else(|| defaults.protocol.scheme().to_string());
    let protocol = Protocol::parse(&protocol_raw)
        .with_context(|| format!("invalid protocol '{protocol_raw}', expected http or https"))?;

    let producers_raw = args
        .ingest_producers
        .clone()
        .or_else(|| file.ingest_producers.clone());
    let ingest_producers = producers_raw
        .as_deref()
        .map(ServerConfig::parse_producers)
        .unwrap_or_default();

    let webhook_url = args
        .alert_webhook_url
        .clone()
        .or_else(|| file.alert_webhook_url.clone());
    let alert_seed = AlertPolicy {
        // enabled defaults to "a webhook URL is configured"
        enabled: args
            .alert_enabled
            .or(file.alert_enabled)
            .unwrap_or(webhook_url.is_some()),
        webhook_url,
        interval_ms: args
            .alert_interval_ms
            .or(file.alert_interval_ms)
            .unwrap_or(AlertPolicy::default().interval_ms),
        window_minutes: args
            .alert_window_minutes
            .or(file.alert_window_minutes)
            .unwrap_or(AlertPolicy::default().window_minutes),
        error_threshold: args
            .alert_error_threshold
            .or(file.alert_error_threshold)
            .unwrap_or(AlertPolicy::default().error_threshold),
        no_logs_threshold_minutes: args
            .alert_no_logs_threshold_minutes
            .or(file.alert_no_logs_threshold_minutes)
            .unwrap_or(AlertPolicy::default().no_logs_threshold_minutes),
        cooldown_ms: args
            .alert_cooldown_ms
            .or(file.alert_cooldown_ms)
            .unwrap_or(AlertPolicy::default().cooldown_ms),
        webhook_timeout_ms: args
            .alert_webhook_timeout_ms
            .or(file.alert_webhook_timeout_ms)
            .unwrap_or(AlertPolicy::default().webhook_timeout_ms),
        webhook_retry_attempts: args
            .alert_webhook_retry_attempts
            .or(file.alert_webhook_retry_attempts)
            .unwrap_or(AlertPolicy::default().webhook_retry_attempts),
        webhook_backoff_ms: args
            .alert_webhook_backoff_ms
            .or(file.alert_webhook_backoff_ms)
            .unwrap_or(AlertPolicy::default().webhook_backoff_ms),
    };
    alert_seed
        .validate()
        .context("alert configuration is invalid")?;

    Ok(ServerConfig {
        db_path: args
            .db_path
            .clone()
            .or(file.db_path)
            .unwrap_or(defaults.db_path),
        logs_path: args
            .logs_path
            .clone()
            .or(file.logs_path)
            .unwrap_or(defaults.logs_path),
        host: args.host.clone().or(file.host).unwrap_or(defaults.host),
        port: args.port.or(file.port).unwrap_or(defaults.port),
        protocol,
        tls_cert_path: args.tls_cert_path.clone().or(file.tls_cert_path),
        tls_key_path: args.tls_key_path.clone().or(file.tls_key_path),
        api_token: args.api_token.clone().or(file.api_token),
        auth_username: args.auth_username.clone().or(file.auth_username),
        auth_password: args.auth_password.clone().or(file.auth_password),
        cors_allow_origin: args
            .cors_allow_origin
            .clone()
            .or(file.cors_allow_origin)
            .unwrap_or(defaults.cors_allow_origin),
        ingest_producers,
        ingest_max_body_bytes: args
            .ingest_max_body_bytes
            .or(file.ingest_max_body_bytes)
            .unwrap_or(defaults.ingest_max_body_bytes),
        ingest_interval_ms: args
            .ingest_interval_ms
            .or(file.ingest_interval_ms)
            .unwrap_or(defaults.ingest_interval_ms),
        disable_auto_ingest: args
            .disable_auto_ingest
            .or(file.disable_auto_ingest)
            .unwrap_or(defaults.disable_auto_ingest),
        ingest_async_queue: args
            .ingest_async_queue
            .or(file.ingest_async_queue)
            .unwrap_or(defaults.ingest_async_queue),
        ingest_queue_flush_ms: args
            .ingest_queue_flush_ms
            .or(file.ingest_queue_flush_ms)
            .unwrap_or(defaults.ingest_queue_flush_ms),
        db_retention_days: args
            .db_retention_days
            .or(file.db_retention_days)
            .unwrap_or(defaults.db_retention_days),
        db_audit_retention_days: args
            .db_audit_retention_days
            .or(file.db_audit_retention_days)
            .unwrap_or(defaults.db_audit_retention_days),
        log_retention_days: args
            .log_retention_days
            .or(file.log_retention_days)
            .unwrap_or(defaults.log_retention_days),
        log_audit_retention_days: args
            .log_audit_retention_days
            .or(file.log_audit_retention_days)
            .unwrap_or(defaults.log_audit_retention_days),
        maintenance_interval_ms: args
            .maintenance_interval_ms
            .or(file.maintenance_interval_ms)
            .unwrap_or(defaults.maintenance_interval_ms),
        audit_backup_directory: args
            .audit_backup_directory
            .clone()
            .or(file.audit_backup_directory),
        min_free_bytes: args
            .min_free_bytes
            .or(file.min_free_bytes)
            .unwrap_or(defaults.min_free_bytes),
        alert_config_path: args.alert_config_path.clone().or(file.alert_config_path),
        alert_seed,
    })
}

/// Resolved configuration rendered for `mikroscope config`, secrets
/// masked.
pub fn render(config: &ServerConfig, json: bool) -> String {
    let masked = |present: bool| if present { "[configured]" } else { "-" };
    let doc = serde_json::json!({
        "dbPath": config.db_path.display().to_string(),
        "logsPath": config.logs_path.display().to_string(),
        "host": config.host,
        "port": config.port,
        "protocol": config.protocol.scheme(),
        "tlsCertPath": config.tls_cert_path.as_ref().map(|p| p.display().to_string()),
        "tlsKeyPath": config.tls_key_path.as_ref().map(|p| p.display().to_string()),
        "apiToken": masked(config.api_token.is_some()),
        "authUsername": config.auth_username,
        "authPassword": masked(config.auth_password.is_some()),
        "corsAllowOrigin": config.cors_allow_origin,
        "ingestProducerCount": config.ingest_producers.len(),
        "ingestMaxBodyBytes": config.ingest_max_body_bytes,
        "ingestIntervalMs": config.ingest_interval_ms,
        "disableAutoIngest": config.disable_auto_ingest,
        "ingestAsyncQueue": config.ingest_async_queue,
        "ingestQueueFlushMs": config.ingest_queue_flush_ms,
        "retentionDays": {
            "db": config.db_retention_days,
            "dbAudit": config.db_audit_retention_days,
            "logs": config.log_retention_days,
            "logsAudit": config.log_audit_retention_days,
        },
        "maintenanceIntervalMs": config.maintenance_interval_ms,
        "minFreeBytes": config.min_free_bytes,
        "auditBackupDirectory": config.audit_backup_directory.as_ref().map(|p| p.display().to_string()),
        "alertConfigPath": config.resolved_alert_config_path().display().to_string(),
        "alertPolicy": config.alert_seed.masked(),
    });

    if json {
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut out = String::new();
        if let Some(object) = doc.as_object() {
            for (key, value) in object {
                out.push_str(&format!("{key}: {value}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = resolve(&ServeArgs::default()).expect("resolve");
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_allow_origin, "*");
        assert!(!config.alert_seed.enabled);
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 9000, "host": "0.0.0.0", "ingestProducers": "t1=web"}"#,
        )
        .expect("write config");

        let args = ServeArgs {
            config: Some(path),
            port: Some(9999),
            ..Default::default()
        };
        let config = resolve(&args).expect("resolve");
        assert_eq!(config.port, 9999, "flag beats file");
        assert_eq!(config.host, "0.0.0.0", "file beats default");
        assert_eq!(config.ingest_producers.len(), 1);
    }

    #[test]
    fn webhook_url_arms_alerting_by_default() {
        let args = ServeArgs {
            alert_webhook_url: Some("https://hooks.example/x".to_string()),
            ..Default::default()
        };
        let config = resolve(&args).expect("resolve");
        assert!(config.alert_seed.enabled);

        let args = ServeArgs {
            alert_webhook_url: Some("https://hooks.example/x".to_string()),
            alert_enabled: Some(false),
            ..Default::default()
        };
        let config = resolve(&args).expect("resolve");
        assert!(!config.alert_seed.enabled, "explicit flag wins");
    }

    #[test]
    fn enabled_without_url_fails_resolution() {
        let args = ServeArgs {
            alert_enabled: Some(true),
            ..Default::default()
        };
        assert!(resolve(&args).is_err());
    }

    #[test]
    fn invalid_protocol_is_rejected() {
        let args = ServeArgs {
            protocol: Some("gopher".to_string()),
            ..Default::default()
        };
        assert!(resolve(&args).is_err());
    }

    #[test]
    fn render_masks_secrets() {
        let args = ServeArgs {
            api_token: Some("super-secret".to_string()),
            auth_password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let config = resolve(&args).expect("resolve");
        let text = render(&config, true);
        assert!(!text.contains("super-secret"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("[configured]"));
    }
}
