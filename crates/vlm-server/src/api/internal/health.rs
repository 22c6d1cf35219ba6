//! Liveness endpoint

use axum::{extract::State, Json};
use vlm_core::HealthReport;

use crate::state::AppState;

/// Report health without triggering a model load.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.service.health().await)
}
