//! Offer pricing.
//!
//! All arithmetic happens on integer cents and is checked: a cart whose
//! amounts do not fit in `i64` is refused with [`PricingError::AmountOverflow`].
//! The discount is always clamped to `[0, subtotal]`, so
//! `total = subtotal - discount` can never go negative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PricingError;
use crate::money::{Currency, Money};
use crate::offer::{Offer, OfferKind};
use crate::session::{CartItem, LineItem};

/// Result of pricing a cart against an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub lines: Vec<LineItem>,
    pub subtotal: Money,
    pub discount: Money,
    pub total: Money,
    pub currency: Currency,
}

/// Stateless calculator for cart totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct PricingCalculator;

impl PricingCalculator {
    /// Creates a calculator.
    pub fn new() -> Self {
        Self
    }

    /// Prices `items` under `offer` as of `now`.
    pub fn price(
        &self,
        offer: &Offer,
        items: &[CartItem],
        now: DateTime<Utc>,
    ) -> Result<PriceQuote, PricingError> {
        offer.ensure_applicable(now)?;

        let currency = Self::cart_currency(items)?;
        if let Some(offer_currency) = offer.kind.currency()
            && *offer_currency != currency
        {
            return Err(PricingError::CurrencyMismatch {
                expected: currency,
                found: offer_currency.clone(),
            });
        }

        let lines = items
            .iter()
            .map(|item| {
                Some(LineItem {
                    variant_id: item.variant_id.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    offer_price: offer.offer_unit_price(item.unit_price)?,
                })
            })
            .collect::<Option<Vec<_>>>()
            .ok_or(PricingError::AmountOverflow)?;

        let subtotal = lines
            .iter()
            .map(LineItem::line_subtotal)
            .collect::<Option<Vec<_>>>()
            .and_then(Money::checked_sum)
            .ok_or(PricingError::AmountOverflow)?;

        let raw_discount = match &offer.kind {
            OfferKind::PercentageOff { percent } => subtotal.checked_percentage(*percent),
            OfferKind::AmountOff { amount, .. } => Some(*amount),
            OfferKind::FixedPrice { .. } => lines
                .iter()
                .map(|l| (l.unit_price - l.offer_price).checked_multiply(l.quantity))
                .collect::<Option<Vec<_>>>()
                .and_then(Money::checked_sum),
        }
        .ok_or(PricingError::AmountOverflow)?;
        let discount = raw_discount.clamp_to(Money::zero(), subtotal);
        let total = subtotal - discount;

        Ok(PriceQuote {
            lines,
            subtotal,
            discount,
            total,
            currency,
        })
    }

    /// Validates line items and returns their common currency.
    fn cart_currency(items: &[CartItem]) -> Result<Currency, PricingError> {
        let first = items.first().ok_or(PricingError::EmptyCart)?;
        for item in items {
            if item.quantity == 0 {
                return Err(PricingError::InvalidQuantity {
                    variant_id: item.variant_id.to_string(),
                    quantity: item.quantity,
                });
            }
            if item.unit_price.is_negative() {
                return Err(PricingError::InvalidPrice {
                    variant_id: item.variant_id.to_string(),
                    price: item.unit_price.cents(),
                });
            }
            if item.currency != first.currency {
                return Err(PricingError::CurrencyMismatch {
                    expected: first.currency.clone(),
                    found: item.currency.clone(),
                });
            }
        }
        Ok(first.currency.clone())
    }
}
