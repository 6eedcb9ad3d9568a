//! Checkout session state machine.
//!
//! Orchestrates idempotency, attribution, pricing and inventory into one
//! checkout lifecycle:
//!
//! ```text
//! start ──► Pending ──┬── confirm ──► Confirmed
//!                     ├── cancel ───► Cancelled
//!                     └── (reaper) ─► Expired
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use checkout_store::{CheckoutStore, SessionTransition};
use common::{Clock, ConnectionId, CreatorId, ReservationId, SessionId, VariantId};
use domain::{
    CartItem, CheckoutSession, NewSession, PricingCalculator, ReleaseReason, Reservation,
    ReservationStatus, SessionStatus,
};
use serde::Deserialize;

use crate::attribution::{AttributionResolver, Resolution};
use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, Result};
use crate::idempotency::{IdempotencyGuard, SessionBuilder, SessionOutcome};
use crate::inventory::InventoryReservationManager;
use crate::services::CatalogService;

/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Request to open a checkout session.
#[derive(Debug, Clone, Deserialize)]
pub struct StartCheckout {
    pub creator_id: CreatorId,
    pub idempotency_key: String,
    pub short_link_code: String,
    pub items: Vec<CartItem>,
    /// Storefront connection; defaults to the offer's.
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

impl StartCheckout {
    fn validate(&self) -> Result<()> {
        let key_len = self.idempotency_key.len();
        if key_len == 0 || key_len > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(CheckoutError::InvalidRequest(format!(
                "idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        if self.short_link_code.is_empty() {
            return Err(CheckoutError::InvalidRequest(
                "short link code is required".to_string(),
            ));
        }
        if self.items.is_empty() {
            return Err(CheckoutError::InvalidRequest("cart is empty".to_string()));
        }
        Ok(())
    }
}

/// The component callers interact with to run a checkout.
pub struct CheckoutSessionStateMachine<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    store: S,
    resolver: AttributionResolver<S, C>,
    inventory: InventoryReservationManager<S, C>,
    guard: IdempotencyGuard<S>,
    pricing: PricingCalculator,
    clock: Arc<dyn Clock>,
    config: CheckoutConfig,
}

impl<S, C> CheckoutSessionStateMachine<S, C>
where
    S: CheckoutStore + Clone,
    C: CatalogService + Clone,
{
    /// Wires the engine's components over one store and catalog.
    pub fn new(store: S, catalog: C, clock: Arc<dyn Clock>, config: CheckoutConfig) -> Self {
        Self {
            resolver: AttributionResolver::new(store.clone(), catalog.clone(), clock.clone()),
            inventory: InventoryReservationManager::new(store.clone(), catalog, clock.clone()),
            guard: IdempotencyGuard::new(store.clone(), clock.clone(), config.clone()),
            pricing: PricingCalculator::new(),
            store,
            clock,
            config,
        }
    }
}

impl<S, C> CheckoutSessionStateMachine<S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    /// The reservation manager used by this engine.
    pub fn inventory(&self) -> &InventoryReservationManager<S, C> {
        &self.inventory
    }

    /// The resolver used by this engine.
    pub fn resolver(&self) -> &AttributionResolver<S, C> {
        &self.resolver
    }

    /// Engine configuration.
    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Resolves a short link, counting a click.
    ///
    /// This is the only counted click: [`Self::start`] re-checks the link's
    /// revocation and expiry but leaves `click_count` alone.
    pub async fn resolve_short_link(&self, code: &str) -> Result<Resolution> {
        self.resolver.resolve(code).await
    }

    /// Opens a checkout session, or returns the one already bound to the key.
    ///
    /// On the creation path every line is reserved; if any line fails, the
    /// lines reserved so far are released before the error is returned.
    #[tracing::instrument(
        skip(self, request),
        fields(creator_id = %request.creator_id, key = %request.idempotency_key)
    )]
    pub async fn start(&self, request: StartCheckout) -> Result<SessionOutcome> {
        request.validate()?;

        let builder = StartBuilder {
            machine: self,
            request: &request,
        };
        let outcome = self
            .guard
            .get_or_create(request.creator_id, &request.idempotency_key, builder)
            .await?;

        if let SessionOutcome::Created(session) = &outcome {
            metrics::counter!("checkout_started_total").increment(1);
            tracing::info!(
                session_id = %session.id,
                total = %session.total,
                "checkout session started"
            );
        }
        Ok(outcome)
    }

    /// Confirms a pending session and all of its reservations.
    ///
    /// Confirming an already confirmed session returns it unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(
        &self,
        session_id: SessionId,
        external_order_ref: &str,
    ) -> Result<CheckoutSession> {
        let now = self.clock.now();
        let session = self.get_session(session_id).await?;

        if session.status == SessionStatus::Confirmed {
            return Ok(session);
        }
        if !session.is_open_at(now) {
            return Err(Self::not_open(&session));
        }

        match self
            .inventory
            .confirm_all(&session.reservation_ids, now)
            .await
        {
            Ok(_) => {}
            // Reservations are only confirmed all at once, by a confirm of
            // this same session that is still finishing.
            Err(CheckoutError::ReservationConflict { status, .. })
                if status == ReservationStatus::Confirmed.as_str() => {}
            Err(e) => {
                let current = self.get_session(session_id).await?;
                if current.status == SessionStatus::Confirmed {
                    return Ok(current);
                }
                metrics::counter!("checkout_confirm_conflicts_total").increment(1);
                return Err(e);
            }
        }

        match self
            .store
            .transition_session(
                session_id,
                SessionStatus::Confirmed,
                now,
                Some(external_order_ref.to_string()),
                None,
            )
            .await?
        {
            SessionTransition::Applied(confirmed) => {
                metrics::counter!("checkout_confirmed_total").increment(1);
                tracing::info!(external_order_ref, "checkout session confirmed");
                Ok(confirmed)
            }
            SessionTransition::Rejected(current) if current.status == SessionStatus::Confirmed => {
                Ok(current)
            }
            SessionTransition::Rejected(current) => {
                // The session closed between the reservation confirm and now.
                tracing::warn!(status = %current.status, "session closed during confirm");
                self.inventory
                    .release_all(&current.reservation_ids, ReleaseReason::Cancelled)
                    .await;
                Err(Self::not_open(&current))
            }
            SessionTransition::NotFound => Err(CheckoutError::not_found("session", session_id)),
        }
    }

    /// Cancels a pending session and releases its stock.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(
        &self,
        session_id: SessionId,
        reason: Option<String>,
    ) -> Result<CheckoutSession> {
        let now = self.clock.now();
        let cancelled = match self
            .store
            .transition_session(session_id, SessionStatus::Cancelled, now, None, reason)
            .await?
        {
            SessionTransition::Applied(session) => session,
            SessionTransition::Rejected(current) => {
                return Err(CheckoutError::invalid_state(
                    "session",
                    session_id,
                    current.status,
                ));
            }
            SessionTransition::NotFound => {
                return Err(CheckoutError::not_found("session", session_id));
            }
        };

        let failures = self
            .inventory
            .release_all(&cancelled.reservation_ids, ReleaseReason::Cancelled)
            .await;
        if failures > 0 {
            // The reaper picks up whatever is still pending once it lapses.
            tracing::warn!(failures, "some reservations were not released on cancel");
        }

        metrics::counter!("checkout_cancelled_total").increment(1);
        tracing::info!("checkout session cancelled");
        Ok(cancelled)
    }

    /// Loads a session.
    pub async fn get_session(&self, session_id: SessionId) -> Result<CheckoutSession> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("session", session_id))
    }

    /// Reservations held (or once held) by a session.
    pub async fn session_reservations(&self, session_id: SessionId) -> Result<Vec<Reservation>> {
        let session = self.get_session(session_id).await?;
        Ok(self.store.reservations_for_session(session.id).await?)
    }

    /// Units of a variant still available for new reservations.
    pub async fn available_quantity(&self, variant_id: &VariantId) -> Result<u32> {
        self.inventory.available_quantity(variant_id).await
    }

    fn not_open(session: &CheckoutSession) -> CheckoutError {
        let status = if session.status == SessionStatus::Pending {
            SessionStatus::Expired
        } else {
            session.status
        };
        CheckoutError::invalid_state("session", session.id, status)
    }
}

/// Builds a session on the creation path of [`CheckoutSessionStateMachine::start`].
struct StartBuilder<'a, S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    machine: &'a CheckoutSessionStateMachine<S, C>,
    request: &'a StartCheckout,
}

impl<S, C> StartBuilder<'_, S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    async fn reserve_lines(&self, session_id: SessionId) -> Result<Vec<ReservationId>> {
        let machine = self.machine;
        let mut reserved = Vec::with_capacity(self.request.items.len());

        for item in &self.request.items {
            match machine
                .inventory
                .reserve(
                    &item.variant_id,
                    item.quantity,
                    session_id,
                    machine.config.reservation_ttl,
                )
                .await
            {
                Ok(reservation) => reserved.push(reservation.id),
                Err(e) => {
                    let failures = machine
                        .inventory
                        .release_all(&reserved, ReleaseReason::Cancelled)
                        .await;
                    tracing::warn!(
                        variant_id = %item.variant_id,
                        rolled_back = reserved.len(),
                        failures,
                        error = %e,
                        "reservation failed, rolling back earlier lines"
                    );
                    return Err(e);
                }
            }
        }
        Ok(reserved)
    }
}

#[async_trait]
impl<'a, S, C> SessionBuilder for StartBuilder<'a, S, C>
where
    S: CheckoutStore,
    C: CatalogService,
{
    async fn build(&mut self, session_id: SessionId) -> Result<CheckoutSession> {
        let machine = self.machine;
        let request = self.request;

        let resolution = machine.resolver.lookup(&request.short_link_code).await?;
        if resolution.short_link.creator_id != request.creator_id {
            return Err(CheckoutError::InvalidRequest(format!(
                "short link {} does not belong to this creator",
                request.short_link_code
            )));
        }

        let now = machine.clock.now();
        let quote = machine
            .pricing
            .price(&resolution.offer, &request.items, now)?;
        let reservation_ids = self.reserve_lines(session_id).await?;

        Ok(NewSession {
            id: session_id,
            creator_id: request.creator_id,
            idempotency_key: request.idempotency_key.clone(),
            short_link_id: resolution.short_link.id,
            attribution_context_id: resolution.attribution_context.id,
            offer_id: resolution.offer.id,
            connection_id: request.connection_id.or(resolution.offer.connection_id),
            quote,
            reservation_ids,
            created_at: now,
            expires_at: now + machine.config.effective_session_ttl(),
        }
        .into())
    }

    async fn discard(&mut self, session: &CheckoutSession) {
        self.machine
            .inventory
            .release_all(&session.reservation_ids, ReleaseReason::Cancelled)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use checkout_store::InMemoryCheckoutStore;
    use chrono::{Duration, Utc};
    use common::ManualClock;
    use domain::{AttributionContext, Currency, Money, Offer, ShortLink, Surface};

    use super::*;
    use crate::services::InMemoryCatalog;

    struct Fixture {
        machine: CheckoutSessionStateMachine<InMemoryCheckoutStore, InMemoryCatalog>,
        store: InMemoryCheckoutStore,
        catalog: InMemoryCatalog,
        clock: ManualClock,
        creator: CreatorId,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryCheckoutStore::new();
        let catalog = InMemoryCatalog::new();
        let clock = ManualClock::new(Utc::now());
        let creator = CreatorId::new();

        let offer = Offer::percentage_off(creator, 20);
        catalog.put_offer(offer.clone());
        catalog.set_stock("SKU-1", 10);
        catalog.set_stock("SKU-2", 1);

        let ctx = AttributionContext::new(creator, Surface::Live, clock.now());
        store.insert_attribution_context(ctx.clone()).await.unwrap();
        store
            .insert_short_link(ShortLink::new("live1", creator, offer.id, ctx.id, clock.now()))
            .await
            .unwrap();

        let machine = CheckoutSessionStateMachine::new(
            store.clone(),
            catalog.clone(),
            Arc::new(clock.clone()),
            CheckoutConfig::default(),
        );
        Fixture {
            machine,
            store,
            catalog,
            clock,
            creator,
        }
    }

    fn request(creator: CreatorId, key: &str, items: Vec<CartItem>) -> StartCheckout {
        StartCheckout {
            creator_id: creator,
            idempotency_key: key.to_string(),
            short_link_code: "live1".to_string(),
            items,
            connection_id: None,
        }
    }

    fn item(sku: &str, quantity: u32, cents: i64) -> CartItem {
        CartItem::new(sku, quantity, Money::from_cents(cents), Currency::usd())
    }

    #[tokio::test]
    async fn happy_path_prices_reserves_and_confirms() {
        let f = fixture().await;
        let sku = VariantId::new("SKU-1");

        let session = f
            .machine
            .start(request(f.creator, "k1", vec![item("SKU-1", 1, 2999)]))
            .await
            .unwrap()
            .into_session();

        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.subtotal.cents(), 2999);
        assert_eq!(session.discount.cents(), 600);
        assert_eq!(session.total.cents(), 2399);
        assert_eq!(session.expires_at, f.clock.now() + Duration::minutes(30));
        assert_eq!(f.machine.available_quantity(&sku).await.unwrap(), 9);

        let confirmed = f.machine.confirm(session.id, "ORD-1").await.unwrap();
        assert_eq!(confirmed.status, SessionStatus::Confirmed);
        assert_eq!(confirmed.external_order_ref.as_deref(), Some("ORD-1"));

        let reservations = f.machine.session_reservations(session.id).await.unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].status, ReservationStatus::Confirmed);
        assert_eq!(f.machine.available_quantity(&sku).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn double_confirm_is_a_no_op() {
        let f = fixture().await;
        let session = f
            .machine
            .start(request(f.creator, "k2", vec![item("SKU-1", 1, 1000)]))
            .await
            .unwrap()
            .into_session();

        let first = f.machine.confirm(session.id, "ORD-1").await.unwrap();
        let second = f.machine.confirm(session.id, "ORD-2").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.external_order_ref.as_deref(), Some("ORD-1"));
    }

    #[tokio::test]
    async fn failed_line_rolls_back_earlier_reservations() {
        let f = fixture().await;
        let err = f
            .machine
            .start(request(
                f.creator,
                "k3",
                vec![item("SKU-1", 2, 1000), item("SKU-2", 5, 1000)],
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::InsufficientInventory { .. }));
        assert_eq!(
            f.machine
                .available_quantity(&VariantId::new("SKU-1"))
                .await
                .unwrap(),
            10
        );
        assert_eq!(f.store.session_count().await, 0);
        assert!(
            f.store
                .find_session_by_key(f.creator, "k3")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cancel_releases_stock_and_is_terminal() {
        let f = fixture().await;
        let session = f
            .machine
            .start(request(f.creator, "k4", vec![item("SKU-2", 1, 1000)]))
            .await
            .unwrap()
            .into_session();
        let sku = VariantId::new("SKU-2");
        assert_eq!(f.machine.available_quantity(&sku).await.unwrap(), 0);

        let cancelled = f
            .machine
            .cancel(session.id, Some("changed mind".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed mind"));
        assert_eq!(f.machine.available_quantity(&sku).await.unwrap(), 1);

        assert!(matches!(
            f.machine.cancel(session.id, None).await,
            Err(CheckoutError::InvalidState { .. })
        ));
        assert!(matches!(
            f.machine.confirm(session.id, "ORD-1").await,
            Err(CheckoutError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn confirm_after_ttl_is_rejected() {
        let f = fixture().await;
        let session = f
            .machine
            .start(request(f.creator, "k5", vec![item("SKU-1", 1, 1000)]))
            .await
            .unwrap()
            .into_session();

        f.clock.advance(Duration::minutes(30));
        let err = f.machine.confirm(session.id, "ORD-late").await.unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidState { ref status, .. } if status == "expired"));
        assert_eq!(
            f.machine.get_session(session.id).await.unwrap().status,
            SessionStatus::Pending
        );
    }

    #[tokio::test]
    async fn released_reservation_conflicts_and_session_stays_pending() {
        let f = fixture().await;
        let machine = &f.machine;
        let session = machine
            .start(request(f.creator, "k6", vec![item("SKU-1", 1, 1000)]))
            .await
            .unwrap()
            .into_session();

        // Pull the reservation out from under the still-open session.
        machine
            .inventory()
            .release(session.reservation_ids[0], ReleaseReason::Cancelled)
            .await
            .unwrap();

        let err = machine.confirm(session.id, "ORD-1").await.unwrap_err();
        assert!(matches!(err, CheckoutError::ReservationConflict { .. }));
        assert_eq!(
            machine.get_session(session.id).await.unwrap().status,
            SessionStatus::Pending
        );
    }

    #[tokio::test]
    async fn retry_returns_existing_session() {
        let f = fixture().await;
        let req = request(f.creator, "k7", vec![item("SKU-1", 1, 1000)]);

        let first = f.machine.start(req.clone()).await.unwrap();
        let second = f.machine.start(req).await.unwrap();
        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.session().id, second.session().id);
        assert_eq!(
            f.machine
                .available_quantity(&VariantId::new("SKU-1"))
                .await
                .unwrap(),
            9
        );
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_claiming() {
        let f = fixture().await;
        assert!(matches!(
            f.machine.start(request(f.creator, "", vec![item("SKU-1", 1, 1)])).await,
            Err(CheckoutError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.machine.start(request(f.creator, "k8", vec![])).await,
            Err(CheckoutError::InvalidRequest(_))
        ));
        let long_key = "x".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
        assert!(matches!(
            f.machine
                .start(request(f.creator, &long_key, vec![item("SKU-1", 1, 1)]))
                .await,
            Err(CheckoutError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn link_of_another_creator_is_refused() {
        let f = fixture().await;
        let err = f
            .machine
            .start(request(CreatorId::new(), "k9", vec![item("SKU-1", 1, 1000)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn inactive_offer_is_invalid_and_reserves_nothing() {
        let f = fixture().await;
        let link = f.store.get_short_link("live1").await.unwrap().unwrap();
        let mut offer = f
            .catalog
            .get_offer(link.offer_id)
            .await
            .unwrap()
            .unwrap();
        offer.active = false;
        f.catalog.put_offer(offer);

        let err = f
            .machine
            .start(request(f.creator, "k10", vec![item("SKU-1", 1, 1000)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidOffer(_)));
        assert_eq!(f.store.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn start_after_the_last_click_succeeds() {
        let f = fixture().await;
        let live = f.store.get_short_link("live1").await.unwrap().unwrap();
        let mut once = ShortLink::new(
            "once",
            f.creator,
            live.offer_id,
            live.attribution_context_id,
            f.clock.now(),
        );
        once.max_clicks = Some(1);
        f.store.insert_short_link(once).await.unwrap();

        f.machine.resolve_short_link("once").await.unwrap();
        let outcome = f
            .machine
            .start(StartCheckout {
                short_link_code: "once".to_string(),
                ..request(f.creator, "k11", vec![item("SKU-1", 1, 1000)])
            })
            .await
            .unwrap();

        assert!(matches!(outcome, SessionOutcome::Created(_)));
        let stored = f.store.get_short_link("once").await.unwrap().unwrap();
        assert_eq!(stored.click_count, 1);
    }
}
