//! Transactional persistence for the checkout engine.
//!
//! [`CheckoutStore`] is the only way the engine touches shared state. Every
//! trait method is a single atomic unit, so read-check-write sequences
//! (click caps, idempotency claims, stock checks) cannot interleave.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryCheckoutStore;
pub use postgres::PostgresCheckoutStore;
pub use store::{
    CheckoutStore, ClaimOutcome, ClaimState, ClickOutcome, ConfirmOutcome, IdempotencyClaim,
    ReleaseOutcome, ReserveOutcome, SessionTransition,
};
