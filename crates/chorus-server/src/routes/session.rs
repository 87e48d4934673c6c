use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use tracing::info;

/// Forget one backend's conversation
async fn reset_session(State(state): State<AppState>, Path(backend): Path<String>) -> StatusCode {
    if state.orchestrator.reset(&backend) {
        info!("Reset session for {}", backend);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Forget every backend's conversation
async fn reset_all_sessions(State(state): State<AppState>) -> StatusCode {
    state.orchestrator.reset_all();
    info!("Reset all sessions");
    StatusCode::NO_CONTENT
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/sessions/reset", post(reset_all_sessions))
        .route("/sessions/:backend/reset", post(reset_session))
        .with_state(state)
}
