//! Domain error types.

use chrono::{DateTime, Utc};
use common::OfferId;
use thiserror::Error;

use crate::money::Currency;

/// Errors raised while pricing a cart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    /// The offer is switched off.
    #[error("Offer {offer_id} is inactive")]
    OfferInactive { offer_id: OfferId },

    /// The offer is outside its validity window.
    #[error("Offer {offer_id} is not valid at {at}")]
    OfferNotValid { offer_id: OfferId, at: DateTime<Utc> },

    /// The offer rule itself is malformed (e.g. more than 100% off).
    #[error("Offer {offer_id} is malformed: {reason}")]
    MalformedOffer { offer_id: OfferId, reason: String },

    /// Cart items (or the offer) use different currencies.
    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },

    /// The cart has no items.
    #[error("Cart is empty")]
    EmptyCart,

    /// A line has a zero quantity.
    #[error("Invalid quantity for {variant_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { variant_id: String, quantity: u32 },

    /// A line has a negative unit price.
    #[error("Invalid unit price for {variant_id}: {price}")]
    InvalidPrice { variant_id: String, price: i64 },

    /// A line or cart total does not fit in `i64` cents.
    #[error("Cart amount overflows")]
    AmountOverflow,
}

impl PricingError {
    /// Returns true when the failure is attributable to the offer rather than the cart.
    pub fn is_offer_error(&self) -> bool {
        matches!(
            self,
            PricingError::OfferInactive { .. }
                | PricingError::OfferNotValid { .. }
                | PricingError::MalformedOffer { .. }
        )
    }
}

/// Error returned when a stored string does not name a known enum value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown {kind}: {value}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
