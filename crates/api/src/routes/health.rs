//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use checkout_store::CheckoutStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub version: &'static str,
}

/// GET /health: liveness plus the store backend in use.
pub async fn check<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.backend,
        version: env!("CARGO_PKG_VERSION"),
    })
}
