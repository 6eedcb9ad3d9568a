//! Checkout error types.

use checkout_store::StoreError;
use common::{ReservationId, VariantId};
use domain::{Currency, LinkUnavailableReason, PricingError, ReservationStatus};
use thiserror::Error;

/// Errors that can occur during checkout operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The short link exists but may not be resolved.
    #[error("Short link {code} is unavailable: {reason}")]
    LinkUnavailable {
        code: String,
        reason: LinkUnavailableReason,
    },

    /// Not enough stock for the requested quantity.
    #[error("Insufficient inventory for {variant_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        variant_id: VariantId,
        requested: u32,
        available: u32,
    },

    /// The offer cannot be applied right now.
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    /// Cart lines or the offer use different currencies.
    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },

    /// The requested transition is illegal from the current state.
    #[error("Invalid state for {entity} {id}: {status}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
    },

    /// A reservation could not be confirmed together with its session.
    #[error("Reservation {reservation_id} could not be confirmed ({status})")]
    ReservationConflict {
        reservation_id: ReservationId,
        status: String,
    },

    /// The idempotency key belongs to another creator.
    #[error("Idempotency key {key} is already used by another creator")]
    KeyConflict { key: String },

    /// Another request with the same idempotency key has not finished yet.
    #[error("A request with idempotency key {key} is still in progress")]
    RequestInProgress { key: String },

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The catalog collaborator failed.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Persistence error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CheckoutError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CheckoutError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid_state(
        entity: &'static str,
        id: impl ToString,
        status: impl ToString,
    ) -> Self {
        CheckoutError::InvalidState {
            entity,
            id: id.to_string(),
            status: status.to_string(),
        }
    }

    pub(crate) fn reservation_conflict(
        reservation_id: ReservationId,
        status: Option<ReservationStatus>,
    ) -> Self {
        CheckoutError::ReservationConflict {
            reservation_id,
            status: status.map_or_else(|| "missing".to_string(), |s| s.to_string()),
        }
    }

    /// Returns true for infrastructure failures the caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckoutError::Store(_)
                | CheckoutError::Catalog(_)
                | CheckoutError::RequestInProgress { .. }
        )
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            CheckoutError::NotFound { .. } => "not_found",
            CheckoutError::LinkUnavailable { .. } => "link_unavailable",
            CheckoutError::InsufficientInventory { .. } => "insufficient_inventory",
            CheckoutError::InvalidOffer(_) => "invalid_offer",
            CheckoutError::CurrencyMismatch { .. } => "currency_mismatch",
            CheckoutError::InvalidState { .. } => "invalid_state",
            CheckoutError::ReservationConflict { .. } => "reservation_conflict",
            CheckoutError::KeyConflict { .. } => "key_conflict",
            CheckoutError::RequestInProgress { .. } => "request_in_progress",
            CheckoutError::InvalidRequest(_) => "invalid_request",
            CheckoutError::Catalog(_) => "catalog_unavailable",
            CheckoutError::Store(_) => "store_unavailable",
        }
    }
}

impl From<PricingError> for CheckoutError {
    fn from(e: PricingError) -> Self {
        match e {
            PricingError::CurrencyMismatch { expected, found } => {
                CheckoutError::CurrencyMismatch { expected, found }
            }
            e if e.is_offer_error() => CheckoutError::InvalidOffer(e.to_string()),
            e => CheckoutError::InvalidRequest(e.to_string()),
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
