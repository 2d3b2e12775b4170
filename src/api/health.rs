use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health response structure
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub rooms: usize,
    pub participants: usize,
    pub connections: usize,
    pub timestamp: String,
}

/// Health routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (rooms, participants) = {
        let registry = state.registry.lock().expect("registry lock poisoned");
        (registry.room_count(), registry.participant_count())
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        rooms,
        participants,
        connections: state.gateway.client_count(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
