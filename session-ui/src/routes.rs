//! HTTP route handlers for the snapshot API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use chrono::Utc;
use serde::Serialize;
use session::replay::{ReplayReport, replay_file};
use tracing::warn;

use crate::sse;
use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/events", get(sse::events_handler))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<String>,
}

/// GET /api/sessions - iteration ids with an envelope log.
async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.session_ids(),
    })
}

/// GET /api/sessions/:id - replayed snapshot for one iteration.
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReplayReport>, StatusCode> {
    if id.contains(['/', '\\']) || id == ".." {
        return Err(StatusCode::BAD_REQUEST);
    }
    let path = state.log_path(&id);
    if !path.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }
    let report = replay_file(&path, Some(&id), &state.options, Utc::now()).map_err(|err| {
        warn!(iteration = %id, error = %format!("{err:#}"), "replay failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(report))
}
