use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// GET /api/variants - list the configured chat variants
pub async fn list_variants(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.variants.descriptors())
}
