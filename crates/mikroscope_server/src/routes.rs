//! Router assembly.
//!
//! A small routing table: public surfaces (health, docs, OpenAPI), the
//! ingest endpoint with its own producer auth, and the API routes
//! behind the bearer/basic gate. CORS wraps everything so preflights
//! are answered before routing.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::require_api_auth;
use crate::cors::cors_middleware;
use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/logs", get(handlers::logs::query_logs))
        .route("/api/logs/aggregate", get(handlers::logs::aggregate_logs))
        .route("/api/reindex", post(handlers::reindex::reindex))
        .route(
            "/api/alerts/config",
            get(handlers::alerts::get_config).put(handlers::alerts::put_config),
        )
        .route(
            "/api/alerts/test-webhook",
            post(handlers::alerts::test_webhook),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/openapi.json", get(handlers::docs::openapi_json))
        .route("/openapi.yaml", get(handlers::docs::openapi_yaml))
        .route("/docs", get(handlers::docs::docs_page))
        .route("/docs/", get(handlers::docs::docs_page))
        .route("/api/ingest", post(handlers::ingest::ingest))
        .merge(protected)
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
