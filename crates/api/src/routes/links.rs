//! Short link issuing, revocation and click resolution.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use checkout::{LinkOptions, Resolution};
use checkout_store::CheckoutStore;
use common::{CreatorId, OfferId};
use domain::{AttributionContext, Offer, ShortLink, Surface};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateLinkRequest {
    pub creator_id: CreatorId,
    pub offer_id: OfferId,
    pub attribution: AttributionRequest,
    #[serde(flatten)]
    pub options: LinkOptions,
}

#[derive(Deserialize)]
pub struct AttributionRequest {
    pub surface: Surface,
    pub platform: Option<String>,
    pub live_session_id: Option<String>,
    pub stream_id: Option<String>,
    pub replay_id: Option<String>,
    pub moment_id: Option<String>,
    pub campaign: Option<String>,
    pub source: Option<String>,
    pub medium: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AttributionRequest {
    fn into_context(self, creator_id: CreatorId, now: DateTime<Utc>) -> AttributionContext {
        let mut context = AttributionContext::new(creator_id, self.surface, now);
        context.platform = self.platform;
        context.live_session_id = self.live_session_id;
        context.stream_id = self.stream_id;
        context.replay_id = self.replay_id;
        context.moment_id = self.moment_id;
        context.campaign = self.campaign;
        context.source = self.source;
        context.medium = self.medium;
        context.metadata = self.metadata;
        context
    }
}

// -- Response types --

#[derive(Serialize)]
pub struct LinkResponse {
    pub id: String,
    pub code: String,
    pub creator_id: String,
    pub offer_id: String,
    pub attribution_context_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_clicks: Option<u32>,
    pub click_count: u32,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ShortLink> for LinkResponse {
    fn from(link: ShortLink) -> Self {
        Self {
            id: link.id.to_string(),
            code: link.code,
            creator_id: link.creator_id.to_string(),
            offer_id: link.offer_id.to_string(),
            attribution_context_id: link.attribution_context_id.to_string(),
            expires_at: link.expires_at,
            max_clicks: link.max_clicks,
            click_count: link.click_count,
            revoked: link.revoked,
            created_at: link.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub code: String,
    pub click_count: u32,
    pub offer: Offer,
    pub attribution_context: AttributionContext,
}

impl From<Resolution> for ResolveResponse {
    fn from(resolution: Resolution) -> Self {
        Self {
            code: resolution.short_link.code,
            click_count: resolution.short_link.click_count,
            offer: resolution.offer,
            attribution_context: resolution.attribution_context,
        }
    }
}

// -- Handlers --

/// POST /links: issue a short link for one of the creator's offers.
#[tracing::instrument(skip(state, req), fields(creator_id = %req.creator_id))]
pub async fn create<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<LinkResponse>), ApiError> {
    let context = req
        .attribution
        .into_context(req.creator_id, state.clock.now());
    let link = state
        .links
        .create(req.creator_id, req.offer_id, context, req.options)
        .await?;
    Ok((StatusCode::CREATED, Json(link.into())))
}

/// GET /links/:code: link details without counting a click.
#[tracing::instrument(skip(state))]
pub async fn get<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(code): Path<String>,
) -> Result<Json<LinkResponse>, ApiError> {
    let link = state.links.get(&code).await?;
    Ok(Json(link.into()))
}

/// DELETE /links/:code: revoke a link; later clicks are refused.
#[tracing::instrument(skip(state))]
pub async fn revoke<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(code): Path<String>,
) -> Result<Json<LinkResponse>, ApiError> {
    let link = state.links.revoke(&code).await?;
    Ok(Json(link.into()))
}

/// GET /l/:code: resolves a click to its offer and attribution.
#[tracing::instrument(skip(state))]
pub async fn resolve<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(code): Path<String>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let resolution = state.checkout.resolve_short_link(&code).await?;
    Ok(Json(resolution.into()))
}
