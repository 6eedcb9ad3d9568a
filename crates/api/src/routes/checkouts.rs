//! Checkout session endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use checkout::{SessionOutcome, StartCheckout};
use checkout_store::CheckoutStore;
use common::{ConnectionId, CreatorId, SessionId};
use domain::{CartItem, CheckoutSession, Currency, LineItem, Money, Reservation};
use serde::{Deserialize, Serialize};

use super::parse_uuid;
use crate::AppState;
use crate::error::ApiError;

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// -- Request types --

#[derive(Deserialize)]
pub struct StartCheckoutRequest {
    pub creator_id: CreatorId,
    pub short_link_code: String,
    pub items: Vec<CartItemRequest>,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

#[derive(Deserialize)]
pub struct CartItemRequest {
    pub variant_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub currency: String,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub external_order_ref: String,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub creator_id: String,
    pub status: String,
    pub offer_id: String,
    pub short_link_id: String,
    pub attribution_context_id: String,
    pub connection_id: Option<String>,
    pub currency: String,
    pub line_items: Vec<LineItemResponse>,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub reservation_ids: Vec<String>,
    pub external_order_ref: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct LineItemResponse {
    pub variant_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub offer_price_cents: i64,
}

#[derive(Serialize)]
pub struct ReservationResponse {
    pub id: String,
    pub variant_id: String,
    pub quantity: u32,
    pub status: String,
    pub release_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub session: SessionResponse,
    pub reservations: Vec<ReservationResponse>,
}

impl From<&LineItem> for LineItemResponse {
    fn from(line: &LineItem) -> Self {
        Self {
            variant_id: line.variant_id.to_string(),
            quantity: line.quantity,
            unit_price_cents: line.unit_price.cents(),
            offer_price_cents: line.offer_price.cents(),
        }
    }
}

impl From<CheckoutSession> for SessionResponse {
    fn from(session: CheckoutSession) -> Self {
        Self {
            id: session.id.to_string(),
            creator_id: session.creator_id.to_string(),
            status: session.status.to_string(),
            offer_id: session.offer_id.to_string(),
            short_link_id: session.short_link_id.to_string(),
            attribution_context_id: session.attribution_context_id.to_string(),
            connection_id: session.connection_id.map(|c| c.to_string()),
            currency: session.currency.to_string(),
            line_items: session.line_items.iter().map(LineItemResponse::from).collect(),
            subtotal_cents: session.subtotal.cents(),
            discount_cents: session.discount.cents(),
            total_cents: session.total.cents(),
            reservation_ids: session
                .reservation_ids
                .iter()
                .map(|id| id.to_string())
                .collect(),
            external_order_ref: session.external_order_ref,
            cancel_reason: session.cancel_reason,
            created_at: session.created_at,
            expires_at: session.expires_at,
            closed_at: session.closed_at,
        }
    }
}

impl From<Reservation> for ReservationResponse {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id.to_string(),
            variant_id: r.variant_id.to_string(),
            quantity: r.quantity,
            status: r.status.to_string(),
            release_reason: r.release_reason.map(|reason| reason.to_string()),
            expires_at: r.expires_at,
        }
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .ok_or_else(|| ApiError::BadRequest("Idempotency-Key header is required".to_string()))?;
    let key = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("Idempotency-Key must be visible ASCII".to_string()))?
        .trim();
    if key.is_empty() {
        return Err(ApiError::BadRequest(
            "Idempotency-Key must not be empty".to_string(),
        ));
    }
    Ok(key.to_string())
}

// -- Handlers --

/// POST /checkouts: open a session, or return the one already opened for the key.
///
/// Answers 201 for a new session and 200 for a replay.
#[tracing::instrument(skip(state, headers, req), fields(creator_id = %req.creator_id))]
pub async fn start<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(req): Json<StartCheckoutRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let idempotency_key = idempotency_key(&headers)?;

    let items = req
        .items
        .into_iter()
        .map(|item| {
            CartItem::new(
                item.variant_id,
                item.quantity,
                Money::from_cents(item.unit_price_cents),
                Currency::new(item.currency),
            )
        })
        .collect();

    let outcome = state
        .checkout
        .start(StartCheckout {
            creator_id: req.creator_id,
            idempotency_key,
            short_link_code: req.short_link_code,
            items,
            connection_id: req.connection_id,
        })
        .await?;

    let status = match &outcome {
        SessionOutcome::Created(_) => StatusCode::CREATED,
        SessionOutcome::Existing(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome.into_session().into())))
}

/// GET /checkouts/:id: a session with its reservations.
#[tracing::instrument(skip(state))]
pub async fn get<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session_id: SessionId = parse_uuid(&id)?;
    let session = state.checkout.get_session(session_id).await?;
    let reservations = state.checkout.session_reservations(session_id).await?;

    Ok(Json(SessionDetailResponse {
        session: session.into(),
        reservations: reservations.into_iter().map(Into::into).collect(),
    }))
}

/// POST /checkouts/:id/confirm: the external order was placed.
#[tracing::instrument(skip(state, req))]
pub async fn confirm<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id: SessionId = parse_uuid(&id)?;
    let external_order_ref = req.external_order_ref.trim();
    if external_order_ref.is_empty() {
        return Err(ApiError::BadRequest(
            "external_order_ref must not be empty".to_string(),
        ));
    }

    let session = state
        .checkout
        .confirm(session_id, external_order_ref)
        .await?;
    Ok(Json(session.into()))
}

/// POST /checkouts/:id/cancel: abandon a pending session.
#[tracing::instrument(skip(state, req))]
pub async fn cancel<S: CheckoutStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id: SessionId = parse_uuid(&id)?;
    let session = state.checkout.cancel(session_id, req.reason).await?;
    Ok(Json(session.into()))
}
