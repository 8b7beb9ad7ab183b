use axum::extract::State;
use axum::Json;

use super::types::HealthResponse;
use super::AppState;

/// GET /health — liveness plus cache occupancy. Not authenticated.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.cache.stats().await;
    Json(HealthResponse {
        status: "ok",
        models_registered: state.registry.len(),
        models_resident: stats.models_resident,
        bytes_resident: stats.bytes_resident,
    })
}
