use axum::http::StatusCode;
use axum::response::IntoResponse;

/// GET liveness probe. Says nothing about the upstream; see `/stream/status`.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}
