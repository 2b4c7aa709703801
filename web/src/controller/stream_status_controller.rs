use crate::controller::ApiResponse;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use log::*;
use service::AppState;

/// GET the relay's upstream state and fan-out counters
pub async fn read(State(app_state): State<AppState>) -> impl IntoResponse {
    let stats = app_state.stream_controller.stats();
    debug!("Stream status: {stats:?}");

    Json(ApiResponse::new(StatusCode::OK.into(), stats))
}
