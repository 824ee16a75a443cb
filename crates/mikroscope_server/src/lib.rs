//! HTTP surface and background services for the mikroscope sidecar.
//!
//! The binary crate resolves configuration and calls [`server::run`];
//! everything else in here is wiring: routing, auth, CORS, the ingest
//! pipeline, the query adapter, retention maintenance, and the
//! orchestrated lifecycle.

pub mod auth;
pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod maintenance;
pub mod preflight;
pub mod query;
pub mod routes;
pub mod server;
pub mod state;

pub use config::{Protocol, ServerConfig};
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use server::{run, start, RunningServer};
pub use state::AppState;
