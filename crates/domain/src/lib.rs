//! Domain layer for the checkout engine.
//!
//! This crate holds the data model shared by every other crate:
//! - short links and the attribution context that produced a click
//! - offers and the pure pricing calculation
//! - checkout sessions and inventory reservations with their state machines
//!
//! Nothing here performs I/O. Atomicity is the store's job; this crate only
//! decides whether a transition is legal.

pub mod attribution;
pub mod error;
pub mod money;
pub mod offer;
pub mod pricing;
pub mod reservation;
pub mod session;
pub mod short_link;

pub use attribution::{AttributionContext, Surface};
pub use error::{ParseError, PricingError};
pub use money::{Currency, Money};
pub use offer::{Offer, OfferKind};
pub use pricing::{PriceQuote, PricingCalculator};
pub use reservation::{ReleaseReason, Reservation, ReservationStatus};
pub use session::{CartItem, CheckoutSession, LineItem, NewSession, SessionStatus};
pub use short_link::{LinkUnavailableReason, ShortLink};
