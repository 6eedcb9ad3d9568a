//! Inventory reservation manager.
//!
//! The only component that writes reservation state. Every mutation is a
//! single atomic store call, so the per-variant invariant
//! `Σ live reserved quantity <= stock` holds under any interleaving.

use std::sync::Arc;

use checkout_store::{CheckoutStore, ConfirmOutcome, ReleaseOutcome, ReserveOutcome};
use chrono::{DateTime, Duration, Utc};
use common::{Clock, ReservationId, SessionId, VariantId};
use domain::{ReleaseReason, Reservation};

use crate::error::{CheckoutError, Result};
use crate::services::CatalogService;

/// Holds exclusive, time-bounded claims against variant stock.
pub struct InventoryReservationManager<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    store: S,
    catalog: C,
    clock: Arc<dyn Clock>,
}

impl<S, C> Clone for InventoryReservationManager<S, C>
where
    S: CheckoutStore + Clone,
    C: CatalogService + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S, C> InventoryReservationManager<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    /// Creates a new reservation manager.
    pub fn new(store: S, catalog: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    async fn stock_of(&self, variant_id: &VariantId) -> Result<u32> {
        self.catalog
            .get_variant_stock(variant_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("variant", variant_id))
    }

    /// Reserves `quantity` units of `variant_id` for `session_id` until `now + ttl`.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(
        &self,
        variant_id: &VariantId,
        quantity: u32,
        session_id: SessionId,
        ttl: Duration,
    ) -> Result<Reservation> {
        if quantity == 0 {
            return Err(CheckoutError::InvalidRequest(format!(
                "quantity for {variant_id} must be greater than 0"
            )));
        }

        let stock = self.stock_of(variant_id).await?;
        let now = self.clock.now();
        let reservation =
            Reservation::pending(variant_id.clone(), session_id, quantity, now, now + ttl);

        match self.store.try_reserve(reservation, stock, now).await? {
            ReserveOutcome::Reserved(reservation) => {
                metrics::counter!("reservations_created_total").increment(1);
                tracing::info!(reservation_id = %reservation.id, quantity, "stock reserved");
                Ok(reservation)
            }
            ReserveOutcome::Insufficient { available } => {
                metrics::counter!("reservations_rejected_total").increment(1);
                tracing::warn!(quantity, available, "insufficient inventory");
                Err(CheckoutError::InsufficientInventory {
                    variant_id: variant_id.clone(),
                    requested: quantity,
                    available,
                })
            }
        }
    }

    /// Confirms a single pending, unexpired reservation.
    pub async fn confirm(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let now = self.clock.now();
        match self.store.confirm_reservations(&[reservation_id], now).await? {
            ConfirmOutcome::Confirmed(mut confirmed) => confirmed
                .pop()
                .ok_or_else(|| CheckoutError::not_found("reservation", reservation_id)),
            ConfirmOutcome::Conflict { status: None, .. } => {
                Err(CheckoutError::not_found("reservation", reservation_id))
            }
            ConfirmOutcome::Conflict {
                status: Some(status),
                ..
            } => {
                // An expired-but-unreaped reservation still reads as pending.
                let shown = if status == domain::ReservationStatus::Pending {
                    "expired".to_string()
                } else {
                    status.to_string()
                };
                Err(CheckoutError::invalid_state(
                    "reservation",
                    reservation_id,
                    shown,
                ))
            }
        }
    }

    /// Confirms every reservation in `ids` at `now`, or none of them.
    pub async fn confirm_all(
        &self,
        ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        match self.store.confirm_reservations(ids, now).await? {
            ConfirmOutcome::Confirmed(confirmed) => {
                metrics::counter!("reservations_confirmed_total")
                    .increment(confirmed.len() as u64);
                Ok(confirmed)
            }
            ConfirmOutcome::Conflict {
                reservation_id,
                status,
            } => {
                tracing::warn!(%reservation_id, ?status, "reservation could not be confirmed");
                Err(CheckoutError::reservation_conflict(reservation_id, status))
            }
        }
    }

    /// Releases a reservation. Releasing twice is a no-op success.
    pub async fn release(
        &self,
        reservation_id: ReservationId,
        reason: ReleaseReason,
    ) -> Result<Reservation> {
        self.release_at(reservation_id, reason, self.clock.now())
            .await
    }

    /// Releases a reservation as of `now`.
    pub async fn release_at(
        &self,
        reservation_id: ReservationId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        match self
            .store
            .release_reservation(reservation_id, reason, now)
            .await?
        {
            ReleaseOutcome::Released(reservation) => {
                metrics::counter!("reservations_released_total", "reason" => reason.as_str())
                    .increment(1);
                tracing::debug!(%reservation_id, %reason, "reservation released");
                Ok(reservation)
            }
            ReleaseOutcome::AlreadyReleased(reservation) => Ok(reservation),
            ReleaseOutcome::Rejected(reservation) => Err(CheckoutError::invalid_state(
                "reservation",
                reservation_id,
                reservation.status,
            )),
            ReleaseOutcome::NotFound => Err(CheckoutError::not_found("reservation", reservation_id)),
        }
    }

    /// Expires a pending reservation whose TTL has lapsed.
    ///
    /// Returns true only if this call released it. A reservation that was
    /// confirmed first is left alone.
    pub async fn expire_at(&self, reservation_id: ReservationId, now: DateTime<Utc>) -> Result<bool> {
        match self
            .store
            .release_reservation(reservation_id, ReleaseReason::Expired, now)
            .await?
        {
            ReleaseOutcome::Released(_) => {
                metrics::counter!("reservations_released_total", "reason" => ReleaseReason::Expired.as_str())
                    .increment(1);
                tracing::debug!(%reservation_id, "reservation expired");
                Ok(true)
            }
            ReleaseOutcome::AlreadyReleased(_) | ReleaseOutcome::Rejected(_) => Ok(false),
            ReleaseOutcome::NotFound => Err(CheckoutError::not_found("reservation", reservation_id)),
        }
    }

    /// Releases every reservation in `ids` for `reason`, logging failures.
    ///
    /// Returns the number of reservations that could not be released.
    pub async fn release_all(&self, ids: &[ReservationId], reason: ReleaseReason) -> usize {
        let mut failures = 0;
        for id in ids {
            if let Err(e) = self.release(*id, reason).await {
                failures += 1;
                tracing::error!(reservation_id = %id, error = %e, "failed to release reservation");
            }
        }
        failures
    }

    /// Loads a reservation.
    pub async fn get(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("reservation", reservation_id))
    }

    /// Stock minus the quantity held by live reservations.
    pub async fn available_quantity(&self, variant_id: &VariantId) -> Result<u32> {
        let stock = self.stock_of(variant_id).await?;
        let reserved = self
            .store
            .outstanding_quantity(variant_id, self.clock.now())
            .await?;
        Ok(stock.saturating_sub(reserved))
    }
}
