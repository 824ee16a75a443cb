//! Request handlers, one module per surface.

pub mod alerts;
pub mod docs;
pub mod health;
pub mod ingest;
pub mod logs;
pub mod reindex;

use crate::error::AppError;

/// Uniform `{error}` shape for unmatched routes.
pub async fn not_found() -> AppError {
    AppError::not_found("not found")
}
