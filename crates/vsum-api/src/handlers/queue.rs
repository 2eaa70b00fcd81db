//! Queue overview.

use axum::extract::State;
use axum::Json;

use vsum_models::QueueSnapshot;

use crate::state::AppState;

pub async fn get_queue(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.coordinator.status().snapshot())
}
