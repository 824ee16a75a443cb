//! CORS handling.
//!
//! `corsAllowOrigin` is a comma-separated list with `*` as the wildcard
//! default. Preflight `OPTIONS` requests short-circuit to `204` with
//! the CORS headers; all other responses get the headers appended.

use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, ORIGIN, VARY};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

const ALLOW_ORIGIN: &str = "access-control-allow-origin";
const ALLOW_METHODS: &str = "access-control-allow-methods";
const ALLOW_HEADERS: &str = "access-control-allow-headers";
const METHODS: &str = "GET,POST,PUT,OPTIONS";
const HEADERS: &str = "authorization,content-type";

/// What the response should advertise for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    Wildcard,
    /// Echo this origin and add `Vary: Origin`.
    Origin(String),
    /// Configured list, no match: no allow-origin header at all.
    None,
}

pub fn decide(cors_allow_origin: &str, request_origin: Option<&str>) -> CorsDecision {
    let configured = cors_allow_origin.trim();
    if configured.is_empty() || configured == "*" {
        return CorsDecision::Wildcard;
    }
    let Some(origin) = request_origin else {
        return CorsDecision::None;
    };
    let matched = configured
        .split(',')
        .map(str::trim)
        .any(|allowed| allowed == origin);
    if matched {
        CorsDecision::Origin(origin.to_string())
    } else {
        CorsDecision::None
    }
}

fn apply(headers: &mut HeaderMap, decision: &CorsDecision) {
    match decision {
        CorsDecision::Wildcard => {
            headers.insert(ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
        CorsDecision::Origin(origin) => {
            if let Ok(value) = HeaderValue::from_str(origin) {
                headers.insert(ALLOW_ORIGIN, value);
            }
            headers.insert(VARY, HeaderValue::from_static("Origin"));
        }
        CorsDecision::None => {}
    }
    headers.insert(ALLOW_METHODS, HeaderValue::from_static(METHODS));
    headers.insert(ALLOW_HEADERS, HeaderValue::from_static(HEADERS));
}

/// Outermost middleware: answers preflights and decorates every other
/// response.
pub async fn cors_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let decision = decide(&state.config.cors_allow_origin, origin.as_deref());

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_is_the_default() {
        assert_eq!(decide("*", Some("https://a.example")), CorsDecision::Wildcard);
        assert_eq!(decide("*", None), CorsDecision::Wildcard);
    }

    #[test]
    fn configured_list_matches_exactly() {
        let list = "https://a.example, https://b.example";
        assert_eq!(
            decide(list, Some("https://b.example")),
            CorsDecision::Origin("https://b.example".to_string())
        );
        assert_eq!(decide(list, Some("https://evil.example")), CorsDecision::None);
        assert_eq!(decide(list, None), CorsDecision::None);
    }

    #[test]
    fn headers_are_set_per_decision() {
        let mut headers = HeaderMap::new();
        apply(&mut headers, &CorsDecision::Wildcard);
        assert_eq!(headers.get(ALLOW_ORIGIN).unwrap(), "*");
        assert!(headers.get(VARY).is_none());

        let mut headers = HeaderMap::new();
        apply(
            &mut headers,
            &CorsDecision::Origin("https://a.example".to_string()),
        );
        assert_eq!(headers.get(ALLOW_ORIGIN).unwrap(), "https://a.example");
        assert_eq!(headers.get(VARY).unwrap(), "Origin");

        let mut headers = HeaderMap::new();
        apply(&mut headers, &CorsDecision::None);
        assert!(headers.get(ALLOW_ORIGIN).is_none());
        assert_eq!(headers.get(ALLOW_METHODS).unwrap(), METHODS);
    }
}
