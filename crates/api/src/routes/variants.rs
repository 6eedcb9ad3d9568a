//! Variant availability.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use checkout_store::CheckoutStore;
use common::VariantId;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct AvailabilityResponse {
    pub variant_id: String,
    pub available: u32,
}

/// GET /variants/:id/availability: stock minus outstanding holds.
#[tracing::instrument(skip(state))]
pub async fn availability<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let variant_id = VariantId::new(id);
    let available = state.checkout.available_quantity(&variant_id).await?;
    Ok(Json(AvailabilityResponse {
        variant_id: variant_id.to_string(),
        available,
    }))
}
