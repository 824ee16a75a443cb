//! Request authentication.
//!
//! Two independent gates: the API gate (bearer token or basic
//! credentials, permissive when neither is configured) and the ingest
//! gate, which resolves a producer id and is disabled outright when no
//! producer mapping exists.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::state::AppState;

/// Outcome of producer resolution for `/api/ingest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerResolution {
    /// No basic credentials and no token mapping configured.
    Disabled,
    Unauthorized,
    Producer(String),
}

/// Middleware guarding the `/api` routes (ingest excluded, it has its
/// own resolution).
pub async fn require_api_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if api_auth_ok(&state.config, request.headers()) {
        Ok(next.run(request).await)
    } else {
        Err(AppError::unauthorized("Unauthorized"))
    }
}

/// Permissive when nothing is configured; otherwise at least one of
/// bearer token or basic credentials must match.
pub fn api_auth_ok(config: &ServerConfig, headers: &HeaderMap) -> bool {
    let token_configured = config.api_token.is_some();
    let basic_configured = config.basic_auth_configured();
    if !token_configured && !basic_configured {
        return true;
    }

    if let (Some(expected), Some(bearer)) = (config.api_token.as_deref(), bearer_token(headers)) {
        if bearer == expected {
            return true;
        }
    }

    if basic_configured {
        if let Some((username, password)) = basic_credentials(headers) {
            if config.auth_username.as_deref() == Some(username.as_str())
                && config.auth_password.as_deref() == Some(password.as_str())
            {
                return true;
            }
        }
    }

    false
}

/// Producer id resolution per the ingest contract: basic credentials
/// map to the username, bearer tokens map through `ingestProducers`.
pub fn resolve_producer(config: &ServerConfig, headers: &HeaderMap) -> ProducerResolution {
    if config.ingest_producers.is_empty() && !config.basic_auth_configured() {
        return ProducerResolution::Disabled;
    }

    if config.basic_auth_configured() {
        if let Some((username, password)) = basic_credentials(headers) {
            if config.auth_username.as_deref() == Some(username.as_str())
                && config.auth_password.as_deref() == Some(password.as_str())
            {
                return ProducerResolution::Producer(username);
            }
        }
    }

    if let Some(token) = bearer_token(headers) {
        if let Some(producer) = config.ingest_producers.get(token) {
            return ProducerResolution::Producer(producer.clone());
        }
    }

    ProducerResolution::Unauthorized
}

fn authorization_value(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION)?.to_str().ok()
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    authorization_value(headers)?.strip_prefix("Bearer ")
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = authorization_value(headers)?.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).expect("header"));
        headers
    }

    fn basic(username: &str, password: &str) -> HeaderMap {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        headers_with(&format!("Basic {encoded}"))
    }

    #[test]
    fn api_auth_is_permissive_when_unconfigured() {
        let config = ServerConfig::default();
        assert!(api_auth_ok(&config, &HeaderMap::new()));
    }

    #[test]
    fn api_auth_accepts_either_mechanism() {
        let config = ServerConfig {
            api_token: Some("sekrit".to_string()),
            auth_username: Some("ops".to_string()),
            auth_password: Some("hunter2".to_string()),
            ..Default::default()
        };

        assert!(api_auth_ok(&config, &headers_with("Bearer sekrit")));
        assert!(api_auth_ok(&config, &basic("ops", "hunter2")));
        assert!(!api_auth_ok(&config, &headers_with("Bearer wrong")));
        assert!(!api_auth_ok(&config, &basic("ops", "wrong")));
        assert!(!api_auth_ok(&config, &HeaderMap::new()));
    }

    #[test]
    fn producer_resolution_disabled_without_configuration() {
        let config = ServerConfig::default();
        assert_eq!(
            resolve_producer(&config, &HeaderMap::new()),
            ProducerResolution::Disabled
        );
    }

    #[test]
    fn producer_resolution_prefers_basic_then_token() {
        let mut config = ServerConfig {
            auth_username: Some("agent".to_string()),
            auth_password: Some("pw".to_string()),
            ..Default::default()
        };
        config
            .ingest_producers
            .insert("tokenA".to_string(), "frontend-web".to_string());

        assert_eq!(
            resolve_producer(&config, &basic("agent", "pw")),
            ProducerResolution::Producer("agent".to_string())
        );
        assert_eq!(
            resolve_producer(&config, &headers_with("Bearer tokenA")),
            ProducerResolution::Producer("frontend-web".to_string())
        );
        assert_eq!(
            resolve_producer(&config, &headers_with("Bearer nope")),
            ProducerResolution::Unauthorized
        );
        assert_eq!(
            resolve_producer(&config, &HeaderMap::new()),
            ProducerResolution::Unauthorized
        );
    }
}
