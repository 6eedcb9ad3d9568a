//! Shared types for the checkout engine.

pub mod clock;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{
    AttributionContextId, ConnectionId, CreatorId, OfferId, ReservationId, SessionId, ShortLinkId,
    VariantId,
};
