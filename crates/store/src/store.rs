use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AttributionContextId, CreatorId, ReservationId, SessionId, VariantId};
use domain::{
    AttributionContext, CheckoutSession, LinkUnavailableReason, ReleaseReason, Reservation,
    ReservationStatus, SessionStatus, ShortLink,
};

use crate::Result;

/// Result of an atomic availability check + click increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// The click was counted; carries the updated link.
    Recorded(ShortLink),
    /// The link exists but refused the click.
    Unavailable(LinkUnavailableReason),
    /// No link has this code.
    NotFound,
}

/// Lifecycle of an idempotency claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// A request is building the session.
    InProgress,
    /// The session was persisted.
    Completed,
}

impl ClaimState {
    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimState::InProgress => "in_progress",
            ClaimState::Completed => "completed",
        }
    }
}

/// Record backing the `(creator, idempotency key)` uniqueness guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub key: String,
    pub creator_id: CreatorId,
    pub session_id: SessionId,
    pub state: ClaimState,
    pub claimed_at: DateTime<Utc>,
}

/// Result of trying to claim an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the key and must build the session.
    Claimed,
    /// Someone else holds the key.
    Held(IdempotencyClaim),
}

/// Result of an atomic stock check + reservation insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The reservation was stored.
    Reserved(Reservation),
    /// Not enough stock; nothing was stored.
    Insufficient { available: u32 },
}

/// Result of an all-or-nothing reservation confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Every reservation moved to `confirmed`.
    Confirmed(Vec<Reservation>),
    /// At least one reservation was missing, expired or not pending; nothing changed.
    Conflict {
        reservation_id: ReservationId,
        status: Option<ReservationStatus>,
    },
}

/// Result of releasing a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The reservation stopped holding stock.
    Released(Reservation),
    /// It had already been released or expired; nothing changed.
    AlreadyReleased(Reservation),
    /// The current state does not allow this release reason.
    Rejected(Reservation),
    /// No such reservation.
    NotFound,
}

/// Result of a conditional session status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// The change was applied; carries the updated session.
    Applied(CheckoutSession),
    /// The current state does not allow the change; carries the unchanged session.
    Rejected(CheckoutSession),
    /// No such session.
    NotFound,
}

/// Abstract transactional store consumed by the checkout engine.
///
/// All implementations must be thread-safe (Send + Sync) and every method
/// must behave as one atomic unit with respect to concurrent callers.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    // -- attribution & links --

    /// Persists an attribution context. Contexts are immutable once written.
    async fn insert_attribution_context(&self, context: AttributionContext) -> Result<()>;

    /// Loads an attribution context.
    async fn get_attribution_context(
        &self,
        id: AttributionContextId,
    ) -> Result<Option<AttributionContext>>;

    /// Persists a new short link.
    ///
    /// Fails with `DuplicateKey` if the code is taken.
    async fn insert_short_link(&self, link: ShortLink) -> Result<()>;

    /// Loads a short link by code without counting a click.
    async fn get_short_link(&self, code: &str) -> Result<Option<ShortLink>>;

    /// Checks availability and counts one click as a single unit.
    ///
    /// Under concurrent calls against a link with `max_clicks = n`, at most
    /// `n` calls ever return `Recorded`.
    async fn record_click(&self, code: &str, now: DateTime<Utc>) -> Result<ClickOutcome>;

    /// Revokes a link. Returns the link, or None if the code is unknown.
    async fn revoke_short_link(&self, code: &str, now: DateTime<Utc>)
    -> Result<Option<ShortLink>>;

    // -- idempotency --

    /// Claims `key` for `session_id` unless another request holds it.
    ///
    /// An in-progress claim older than `stale_before` belonging to the same
    /// creator is taken over.
    async fn claim_idempotency_key(
        &self,
        creator_id: CreatorId,
        key: &str,
        session_id: SessionId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Drops an in-progress claim owned by `session_id` so a retry can start over.
    async fn release_idempotency_claim(&self, key: &str, session_id: SessionId) -> Result<()>;

    // -- sessions --

    /// Persists a pending session and completes its idempotency claim.
    ///
    /// Fails with `DuplicateKey` if the key is already bound to another session
    /// or the claim was taken over.
    async fn insert_session(&self, session: CheckoutSession) -> Result<()>;

    /// Loads a session.
    async fn get_session(&self, id: SessionId) -> Result<Option<CheckoutSession>>;

    /// Loads the session bound to `(creator_id, key)`.
    async fn find_session_by_key(
        &self,
        creator_id: CreatorId,
        key: &str,
    ) -> Result<Option<CheckoutSession>>;

    /// Moves a pending session to `to` if the transition is legal at `now`.
    async fn transition_session(
        &self,
        id: SessionId,
        to: SessionStatus,
        now: DateTime<Utc>,
        external_order_ref: Option<String>,
        reason: Option<String>,
    ) -> Result<SessionTransition>;

    /// Expires a pending session once none of its reservations is still live.
    async fn expire_session_if_drained(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition>;

    /// Pending sessions whose TTL has lapsed, oldest first.
    async fn expired_pending_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutSession>>;

    // -- reservations --

    /// Stores `reservation` if `stock` minus the live reserved quantity covers it.
    ///
    /// Pending reservations of the same variant that are already past their
    /// TTL are expired within the same unit before availability is computed.
    async fn try_reserve(
        &self,
        reservation: Reservation,
        stock: u32,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome>;

    /// Confirms every reservation in `ids`, or none of them.
    async fn confirm_reservations(
        &self,
        ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome>;

    /// Releases a reservation for `reason`. Releasing twice is a no-op.
    async fn release_reservation(
        &self,
        id: ReservationId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome>;

    /// Loads a reservation.
    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// All reservations created for a session.
    async fn reservations_for_session(&self, session_id: SessionId) -> Result<Vec<Reservation>>;

    /// Quantity of a variant currently held by live reservations.
    async fn outstanding_quantity(&self, variant_id: &VariantId, now: DateTime<Utc>)
    -> Result<u32>;

    /// Pending reservations whose TTL has lapsed, oldest first.
    async fn expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>>;
}
