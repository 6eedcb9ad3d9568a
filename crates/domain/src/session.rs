//! Checkout sessions: the aggregate root of a checkout flow.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{
    AttributionContextId, ConnectionId, CreatorId, OfferId, ReservationId, SessionId, ShortLinkId,
    VariantId,
};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::money::{Currency, Money};
use crate::pricing::PriceQuote;

/// The state of a checkout session in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Confirmed
///           ├──► Cancelled
///           └──► Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Stock is held, waiting for the external order.
    #[default]
    Pending,

    /// The external platform placed the order (terminal state).
    Confirmed,

    /// The shopper or creator abandoned the checkout (terminal state).
    Cancelled,

    /// The TTL lapsed without confirmation (terminal state).
    Expired,
}

impl SessionStatus {
    /// Returns true if the session can be confirmed in this state.
    pub fn can_confirm(&self) -> bool {
        matches!(self, SessionStatus::Pending)
    }

    /// Returns true if the session can be cancelled in this state.
    pub fn can_cancel(&self) -> bool {
        matches!(self, SessionStatus::Pending)
    }

    /// Returns true if the session can expire in this state.
    pub fn can_expire(&self) -> bool {
        matches!(self, SessionStatus::Pending)
    }

    /// Returns true if `to` is a legal next state.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        match to {
            SessionStatus::Pending => false,
            SessionStatus::Confirmed => self.can_confirm(),
            SessionStatus::Cancelled => self.can_cancel(),
            SessionStatus::Expired => self.can_expire(),
        }
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "confirmed" => Ok(SessionStatus::Confirmed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(ParseError::new("session status", other)),
        }
    }
}

/// A line the shopper asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price: Money,
    pub currency: Currency,
}

impl CartItem {
    /// Creates a cart item.
    pub fn new(
        variant_id: impl Into<VariantId>,
        quantity: u32,
        unit_price: Money,
        currency: Currency,
    ) -> Self {
        Self {
            variant_id: variant_id.into(),
            quantity,
            unit_price,
            currency,
        }
    }
}

/// A priced line persisted on the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price: Money,
    /// Per-unit price after the offer's unit-level rule.
    pub offer_price: Money,
}

impl LineItem {
    /// Returns `unit_price * quantity`, or `None` on overflow.
    pub fn line_subtotal(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }
}

/// A checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: SessionId,
    pub creator_id: CreatorId,
    pub idempotency_key: String,
    pub short_link_id: ShortLinkId,
    pub attribution_context_id: AttributionContextId,
    pub offer_id: OfferId,
    pub connection_id: Option<ConnectionId>,
    pub status: SessionStatus,
    pub line_items: Vec<LineItem>,
    pub subtotal: Money,
    pub discount: Money,
    pub total: Money,
    pub currency: Currency,
    pub reservation_ids: Vec<ReservationId>,
    pub external_order_ref: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl CheckoutSession {
    /// Returns true once `now` has reached `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true when the session is still pending and inside its TTL.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Pending && !self.is_expired_at(now)
    }

    /// Applies a status change in place.
    ///
    /// Returns false (leaving the session untouched) if the transition is illegal.
    /// Confirmation is also refused once the TTL has lapsed.
    pub fn apply_transition(
        &mut self,
        to: SessionStatus,
        now: DateTime<Utc>,
        external_order_ref: Option<String>,
        reason: Option<String>,
    ) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        if to == SessionStatus::Confirmed && self.is_expired_at(now) {
            return false;
        }
        self.status = to;
        self.updated_at = now;
        self.closed_at = Some(now);
        match to {
            SessionStatus::Confirmed => self.external_order_ref = external_order_ref,
            SessionStatus::Cancelled => self.cancel_reason = reason,
            SessionStatus::Expired | SessionStatus::Pending => {}
        }
        true
    }
}

/// Everything needed to persist a brand-new pending session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: SessionId,
    pub creator_id: CreatorId,
    pub idempotency_key: String,
    pub short_link_id: ShortLinkId,
    pub attribution_context_id: AttributionContextId,
    pub offer_id: OfferId,
    pub connection_id: Option<ConnectionId>,
    pub quote: PriceQuote,
    pub reservation_ids: Vec<ReservationId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<NewSession> for CheckoutSession {
    fn from(new: NewSession) -> Self {
        Self {
            id: new.id,
            creator_id: new.creator_id,
            idempotency_key: new.idempotency_key,
            short_link_id: new.short_link_id,
            attribution_context_id: new.attribution_context_id,
            offer_id: new.offer_id,
            connection_id: new.connection_id,
            status: SessionStatus::Pending,
            line_items: new.quote.lines,
            subtotal: new.quote.subtotal,
            discount: new.quote.discount,
            total: new.quote.total,
            currency: new.quote.currency,
            reservation_ids: new.reservation_ids,
            external_order_ref: None,
            cancel_reason: None,
            created_at: new.created_at,
            updated_at: new.created_at,
            expires_at: new.expires_at,
            closed_at: None,
        }
    }
}
