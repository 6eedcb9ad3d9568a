//! Creator offers (discount rules).

use chrono::{DateTime, Utc};
use common::{ConnectionId, CreatorId, OfferId};
use serde::{Deserialize, Serialize};

use crate::error::PricingError;
use crate::money::{Currency, Money};

/// The discount rule an offer applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OfferKind {
    /// `percent`% off the cart subtotal.
    PercentageOff { percent: u32 },
    /// A flat amount off the cart subtotal.
    AmountOff { amount: Money, currency: Currency },
    /// Every unit sells for `unit_price` (never raising a unit's price).
    FixedPrice { unit_price: Money, currency: Currency },
}

impl OfferKind {
    /// Returns the wire/storage name of the rule.
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferKind::PercentageOff { .. } => "percentage_off",
            OfferKind::AmountOff { .. } => "amount_off",
            OfferKind::FixedPrice { .. } => "fixed_price",
        }
    }

    /// Returns the currency the rule is denominated in, if any.
    pub fn currency(&self) -> Option<&Currency> {
        match self {
            OfferKind::PercentageOff { .. } => None,
            OfferKind::AmountOff { currency, .. } | OfferKind::FixedPrice { currency, .. } => {
                Some(currency)
            }
        }
    }
}

/// A discount rule owned by a creator. Read-only to the checkout engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub creator_id: CreatorId,
    pub name: String,
    pub kind: OfferKind,
    pub active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Storefront connection the offered variants are sold through.
    pub connection_id: Option<ConnectionId>,
}

impl Offer {
    /// Creates an active, open-ended offer.
    pub fn new(creator_id: CreatorId, name: impl Into<String>, kind: OfferKind) -> Self {
        Self {
            id: OfferId::new(),
            creator_id,
            name: name.into(),
            kind,
            active: true,
            starts_at: None,
            expires_at: None,
            connection_id: None,
        }
    }

    /// Shorthand for a percentage-off offer.
    pub fn percentage_off(creator_id: CreatorId, percent: u32) -> Self {
        Self::new(
            creator_id,
            format!("{percent}% off"),
            OfferKind::PercentageOff { percent },
        )
    }

    /// Sets the validity window.
    pub fn valid_between(
        mut self,
        starts_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.starts_at = starts_at;
        self.expires_at = expires_at;
        self
    }

    /// Checks that the offer may be applied at `now`.
    pub fn ensure_applicable(&self, now: DateTime<Utc>) -> Result<(), PricingError> {
        if !self.active {
            return Err(PricingError::OfferInactive { offer_id: self.id });
        }
        let not_started = self.starts_at.is_some_and(|s| now < s);
        let ended = self.expires_at.is_some_and(|e| now >= e);
        if not_started || ended {
            return Err(PricingError::OfferNotValid {
                offer_id: self.id,
                at: now,
            });
        }
        match &self.kind {
            OfferKind::PercentageOff { percent } if *percent > 100 => {
                Err(PricingError::MalformedOffer {
                    offer_id: self.id,
                    reason: format!("{percent}% exceeds 100%"),
                })
            }
            OfferKind::AmountOff { amount, .. } if amount.is_negative() => {
                Err(PricingError::MalformedOffer {
                    offer_id: self.id,
                    reason: "negative amount".to_string(),
                })
            }
            OfferKind::FixedPrice { unit_price, .. } if unit_price.is_negative() => {
                Err(PricingError::MalformedOffer {
                    offer_id: self.id,
                    reason: "negative unit price".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Per-unit price a shopper pays for one unit listed at `unit_price`.
    ///
    /// Order-level rules (`AmountOff`) leave unit prices untouched. Returns
    /// `None` if the amount overflows.
    pub fn offer_unit_price(&self, unit_price: Money) -> Option<Money> {
        match &self.kind {
            OfferKind::PercentageOff { percent } => {
                unit_price.checked_sub(unit_price.checked_percentage(*percent)?)
            }
            OfferKind::AmountOff { .. } => Some(unit_price),
            OfferKind::FixedPrice {
                unit_price: fixed, ..
            } => Some(unit_price.min(*fixed)),
        }
    }
}
