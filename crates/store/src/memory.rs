use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AttributionContextId, CreatorId, ReservationId, SessionId, VariantId};
use domain::{
    AttributionContext, CheckoutSession, ReleaseReason, Reservation, ReservationStatus,
    SessionStatus, ShortLink,
};
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{
        CheckoutStore, ClaimOutcome, ClaimState, ClickOutcome, ConfirmOutcome, IdempotencyClaim,
        ReleaseOutcome, ReserveOutcome, SessionTransition,
    },
};

#[derive(Default)]
struct MemoryState {
    contexts: HashMap<AttributionContextId, AttributionContext>,
    links: HashMap<String, ShortLink>,
    claims: HashMap<String, IdempotencyClaim>,
    sessions: HashMap<SessionId, CheckoutSession>,
    session_keys: HashMap<String, SessionId>,
    reservations: HashMap<ReservationId, Reservation>,
    by_variant: HashMap<VariantId, Vec<ReservationId>>,
    by_session: HashMap<SessionId, Vec<ReservationId>>,
}

impl MemoryState {
    fn expire_stale(&mut self, variant_id: &VariantId, now: DateTime<Utc>) {
        let Some(ids) = self.by_variant.get(variant_id) else {
            return;
        };
        for id in ids {
            if let Some(r) = self.reservations.get_mut(id)
                && r.status == ReservationStatus::Pending
                && r.is_expired_at(now)
            {
                r.release(ReleaseReason::Expired, now);
            }
        }
    }

    fn outstanding(&self, variant_id: &VariantId, now: DateTime<Utc>) -> u32 {
        self.by_variant
            .get(variant_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.reservations.get(id))
            .filter(|r| r.is_live_at(now))
            .map(|r| r.quantity)
            .sum()
    }

    fn session_reservations(&self, session_id: SessionId) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .by_session
            .get(&session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.reservations.get(id).cloned())
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }
}

/// In-memory checkout store for tests and single-process runs.
///
/// A single lock guards all tables, so every trait method is trivially one
/// atomic unit. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryCheckoutStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryCheckoutStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sessions stored.
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Returns the total number of reservations stored, in any status.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        *self.state.write().await = MemoryState::default();
    }
}

#[async_trait]
impl CheckoutStore for InMemoryCheckoutStore {
    async fn insert_attribution_context(&self, context: AttributionContext) -> Result<()> {
        let mut state = self.state.write().await;
        if state.contexts.contains_key(&context.id) {
            return Err(StoreError::DuplicateKey(format!(
                "attribution context {}",
                context.id
            )));
        }
        state.contexts.insert(context.id, context);
        Ok(())
    }

    async fn get_attribution_context(
        &self,
        id: AttributionContextId,
    ) -> Result<Option<AttributionContext>> {
        Ok(self.state.read().await.contexts.get(&id).cloned())
    }

    async fn insert_short_link(&self, link: ShortLink) -> Result<()> {
        let mut state = self.state.write().await;
        if state.links.contains_key(&link.code) {
            return Err(StoreError::DuplicateKey(format!("short link {}", link.code)));
        }
        state.links.insert(link.code.clone(), link);
        Ok(())
    }

    async fn get_short_link(&self, code: &str) -> Result<Option<ShortLink>> {
        Ok(self.state.read().await.links.get(code).cloned())
    }

    async fn record_click(&self, code: &str, now: DateTime<Utc>) -> Result<ClickOutcome> {
        let mut state = self.state.write().await;
        let Some(link) = state.links.get_mut(code) else {
            return Ok(ClickOutcome::NotFound);
        };
        if let Err(reason) = link.availability(now) {
            return Ok(ClickOutcome::Unavailable(reason));
        }
        link.record_click(now);
        Ok(ClickOutcome::Recorded(link.clone()))
    }

    async fn revoke_short_link(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ShortLink>> {
        let mut state = self.state.write().await;
        Ok(state.links.get_mut(code).map(|link| {
            link.revoke(now);
            link.clone()
        }))
    }

    async fn claim_idempotency_key(
        &self,
        creator_id: CreatorId,
        key: &str,
        session_id: SessionId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.claims.get_mut(key) {
            let stale = existing.state == ClaimState::InProgress
                && existing.claimed_at < stale_before
                && existing.creator_id == creator_id;
            if !stale {
                return Ok(ClaimOutcome::Held(existing.clone()));
            }
            existing.session_id = session_id;
            existing.claimed_at = now;
            return Ok(ClaimOutcome::Claimed);
        }
        state.claims.insert(
            key.to_string(),
            IdempotencyClaim {
                key: key.to_string(),
                creator_id,
                session_id,
                state: ClaimState::InProgress,
                claimed_at: now,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_idempotency_claim(&self, key: &str, session_id: SessionId) -> Result<()> {
        let mut state = self.state.write().await;
        let owned = state.claims.get(key).is_some_and(|c| {
            c.state == ClaimState::InProgress && c.session_id == session_id
        });
        if owned {
            state.claims.remove(key);
        }
        Ok(())
    }

    async fn insert_session(&self, session: CheckoutSession) -> Result<()> {
        let mut state = self.state.write().await;
        let key = session.idempotency_key.clone();

        if state.session_keys.contains_key(&key) {
            return Err(StoreError::DuplicateKey(format!("idempotency key {key}")));
        }
        match state.claims.get_mut(&key) {
            Some(claim) if claim.session_id != session.id => {
                return Err(StoreError::DuplicateKey(format!(
                    "idempotency key {key} is claimed by session {}",
                    claim.session_id
                )));
            }
            Some(claim) => claim.state = ClaimState::Completed,
            None => {
                state.claims.insert(
                    key.clone(),
                    IdempotencyClaim {
                        key: key.clone(),
                        creator_id: session.creator_id,
                        session_id: session.id,
                        state: ClaimState::Completed,
                        claimed_at: session.created_at,
                    },
                );
            }
        }

        state.session_keys.insert(key, session.id);
        state.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<CheckoutSession>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn find_session_by_key(
        &self,
        creator_id: CreatorId,
        key: &str,
    ) -> Result<Option<CheckoutSession>> {
        let state = self.state.read().await;
        Ok(state
            .session_keys
            .get(key)
            .and_then(|id| state.sessions.get(id))
            .filter(|s| s.creator_id == creator_id)
            .cloned())
    }

    async fn transition_session(
        &self,
        id: SessionId,
        to: SessionStatus,
        now: DateTime<Utc>,
        external_order_ref: Option<String>,
        reason: Option<String>,
    ) -> Result<SessionTransition> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(SessionTransition::NotFound);
        };
        if session.apply_transition(to, now, external_order_ref, reason) {
            Ok(SessionTransition::Applied(session.clone()))
        } else {
            Ok(SessionTransition::Rejected(session.clone()))
        }
    }

    async fn expire_session_if_drained(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition> {
        let mut state = self.state.write().await;
        let drained = state
            .session_reservations(id)
            .iter()
            .all(|r| !r.is_live_at(now));
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(SessionTransition::NotFound);
        };
        if drained && session.apply_transition(SessionStatus::Expired, now, None, None) {
            Ok(SessionTransition::Applied(session.clone()))
        } else {
            Ok(SessionTransition::Rejected(session.clone()))
        }
    }

    async fn expired_pending_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.is_expired_at(now))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.expires_at);
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn try_reserve(
        &self,
        reservation: Reservation,
        stock: u32,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let mut state = self.state.write().await;

        state.expire_stale(&reservation.variant_id, now);
        let available = stock.saturating_sub(state.outstanding(&reservation.variant_id, now));
        if reservation.quantity > available {
            return Ok(ReserveOutcome::Insufficient { available });
        }

        state
            .by_variant
            .entry(reservation.variant_id.clone())
            .or_default()
            .push(reservation.id);
        state
            .by_session
            .entry(reservation.session_id)
            .or_default()
            .push(reservation.id);
        state.reservations.insert(reservation.id, reservation.clone());
        Ok(ReserveOutcome::Reserved(reservation))
    }

    async fn confirm_reservations(
        &self,
        ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let mut state = self.state.write().await;

        for id in ids {
            match state.reservations.get(id) {
                Some(r) if r.is_confirmable_at(now) => {}
                other => {
                    return Ok(ConfirmOutcome::Conflict {
                        reservation_id: *id,
                        status: other.map(|r| r.status),
                    });
                }
            }
        }

        let mut confirmed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = state.reservations.get_mut(id) {
                r.confirm(now);
                confirmed.push(r.clone());
            }
        }
        Ok(ConfirmOutcome::Confirmed(confirmed))
    }

    async fn release_reservation(
        &self,
        id: ReservationId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome> {
        let mut state = self.state.write().await;
        let Some(r) = state.reservations.get_mut(&id) else {
            return Ok(ReleaseOutcome::NotFound);
        };
        if !r.status.is_outstanding() {
            return Ok(ReleaseOutcome::AlreadyReleased(r.clone()));
        }
        if !r.can_release(reason) {
            return Ok(ReleaseOutcome::Rejected(r.clone()));
        }
        r.release(reason, now);
        Ok(ReleaseOutcome::Released(r.clone()))
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.state.read().await.reservations.get(&id).cloned())
    }

    async fn reservations_for_session(&self, session_id: SessionId) -> Result<Vec<Reservation>> {
        Ok(self.state.read().await.session_reservations(session_id))
    }

    async fn outstanding_quantity(
        &self,
        variant_id: &VariantId,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        Ok(self.state.read().await.outstanding(variant_id, now))
    }

    async fn expired_pending_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut expired: Vec<_> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }
}
