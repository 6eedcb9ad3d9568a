//! Background sweep that expires lapsed reservations and sessions.
//!
//! Correctness never depends on the sweep: `reserve` and `confirm` re-check
//! `expires_at` themselves. The reaper only returns held stock promptly and
//! closes sessions nobody will confirm.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use checkout_store::{CheckoutStore, SessionTransition};
use chrono::{DateTime, Utc};
use common::{Clock, SessionId};
use domain::ReservationStatus;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::error::Result;
use crate::inventory::InventoryReservationManager;
use crate::services::CatalogService;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_expired: usize,
    pub sessions_expired: usize,
    pub failures: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.reservations_expired == 0 && self.sessions_expired == 0 && self.failures == 0
    }
}

/// Periodically expires stale reservations and drained sessions.
pub struct ReservationReaper<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    inventory: InventoryReservationManager<S, C>,
    store: S,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
}

impl<S, C> ReservationReaper<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    /// Creates a reaper that releases stock through `inventory`.
    pub fn new(
        inventory: InventoryReservationManager<S, C>,
        store: S,
        clock: Arc<dyn Clock>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            inventory,
            store,
            clock,
            config,
        }
    }

    /// Runs one sweep as of `now`.
    ///
    /// A failure on one reservation or session is logged and counted; the
    /// sweep carries on with the rest. Only a failed batch query aborts it.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let mut sessions = BTreeSet::new();

        let lapsed = self
            .store
            .expired_pending_reservations(now, self.config.batch_size)
            .await?;
        for reservation in &lapsed {
            sessions.insert(reservation.session_id);
            match self.inventory.expire_at(reservation.id, now).await {
                Ok(true) => report.reservations_expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(reservation_id = %reservation.id, error = %e, "failed to expire reservation");
                }
            }
        }

        let lapsed_sessions = self
            .store
            .expired_pending_sessions(now, self.config.batch_size)
            .await?;
        sessions.extend(lapsed_sessions.iter().map(|s| s.id));

        for session_id in sessions {
            match self.close_session(session_id, now, &mut report).await {
                Ok(true) => report.sessions_expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(%session_id, error = %e, "failed to expire session");
                }
            }
        }

        metrics::histogram!("reaper_sweep_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("reaper_reservations_expired_total")
            .increment(report.reservations_expired as u64);
        metrics::counter!("reaper_sessions_expired_total").increment(report.sessions_expired as u64);
        metrics::counter!("reaper_failures_total").increment(report.failures as u64);

        if !report.is_empty() {
            tracing::info!(
                reservations_expired = report.reservations_expired,
                sessions_expired = report.sessions_expired,
                failures = report.failures,
                "reaper sweep finished"
            );
        }
        Ok(report)
    }

    /// Expires whatever lapsed reservations a session still has, then the
    /// session itself if nothing live is left.
    async fn close_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<bool> {
        let reservations = self.store.reservations_for_session(session_id).await?;
        for reservation in reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Pending && r.is_expired_at(now))
        {
            if self.inventory.expire_at(reservation.id, now).await? {
                report.reservations_expired += 1;
            }
        }

        match self.store.expire_session_if_drained(session_id, now).await? {
            SessionTransition::Applied(_) => {
                tracing::debug!(%session_id, "session expired");
                Ok(true)
            }
            SessionTransition::Rejected(_) | SessionTransition::NotFound => Ok(false),
        }
    }

    /// Sweeps on an interval until `shutdown` fires.
    ///
    /// A sweep that filled its batch is followed immediately by another.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "reservation reaper started"
        );

        loop {
            let backlog = match self.sweep_once(self.clock.now()).await {
                Ok(report) => report.reservations_expired >= self.config.batch_size,
                Err(e) => {
                    tracing::error!(error = %e, "reaper sweep failed");
                    false
                }
            };
            if backlog {
                if shutdown.is_cancelled() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!("reservation reaper stopped");
    }
}
