//! Checkout and inventory reservation engine.
//!
//! This crate turns a short-link click into a priced checkout session with
//! stock held for it, and carries that session to confirmation, cancellation
//! or expiry:
//!
//! - [`AttributionResolver`] resolves a short-link code, enforcing its click cap
//! - [`IdempotencyGuard`] collapses repeated start requests onto one session
//! - [`InventoryReservationManager`] is the only writer of reservation state
//! - [`CheckoutSessionStateMachine`] orchestrates the above
//! - [`ReservationReaper`] expires what nobody confirmed
//!
//! Every component talks to persistence through a [`CheckoutStore`] and to
//! the storefront through a [`CatalogService`], both injected by the caller.
//!
//! # Example
//!
//! ```ignore
//! use checkout::{CheckoutConfig, CheckoutSessionStateMachine, InMemoryCatalog, StartCheckout};
//! use checkout_store::InMemoryCheckoutStore;
//!
//! let machine = CheckoutSessionStateMachine::new(
//!     InMemoryCheckoutStore::new(),
//!     InMemoryCatalog::new(),
//!     Arc::new(SystemClock),
//!     CheckoutConfig::default(),
//! );
//! let session = machine.start(request).await?.into_session();
//! machine.confirm(session.id, "ORD-1001").await?;
//! ```

pub mod attribution;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod inventory;
pub mod links;
pub mod reaper;
pub mod services;
pub mod session;

pub use attribution::{AttributionResolver, Resolution};
pub use checkout_store::CheckoutStore;
pub use config::{CheckoutConfig, ReaperConfig};
pub use error::{CheckoutError, Result};
pub use idempotency::{IdempotencyGuard, SessionBuilder, SessionOutcome};
pub use inventory::InventoryReservationManager;
pub use links::{LinkOptions, ShortLinkService};
pub use reaper::{ReservationReaper, SweepReport};
pub use services::{CatalogSeed, CatalogService, InMemoryCatalog};
pub use session::{CheckoutSessionStateMachine, StartCheckout};
