//! Integration tests for the checkout engine over the in-memory store.

use std::sync::Arc;

use checkout::{
    CheckoutConfig, CheckoutError, CheckoutSessionStateMachine, InMemoryCatalog, ReaperConfig,
    ReservationReaper, StartCheckout,
};
use checkout_store::{CheckoutStore, InMemoryCheckoutStore};
use chrono::{Duration, Utc};
use common::{Clock, CreatorId, ManualClock, SessionId, VariantId};
use domain::{
    AttributionContext, CartItem, CheckoutSession, Currency, LinkUnavailableReason, Money, Offer,
    ReservationStatus, SessionStatus, ShortLink, Surface,
};
use futures_util::future::join_all;

type Machine = CheckoutSessionStateMachine<InMemoryCheckoutStore, InMemoryCatalog>;

struct TestHarness {
    machine: Arc<Machine>,
    reaper: ReservationReaper<InMemoryCheckoutStore, InMemoryCatalog>,
    store: InMemoryCheckoutStore,
    catalog: InMemoryCatalog,
    clock: ManualClock,
    creator: CreatorId,
}

impl TestHarness {
    async fn new() -> Self {
        let store = InMemoryCheckoutStore::new();
        let catalog = InMemoryCatalog::new();
        let clock = ManualClock::new(Utc::now());
        let creator = CreatorId::new();

        let offer = Offer::percentage_off(creator, 20);
        catalog.put_offer(offer.clone());
        let ctx = AttributionContext::new(creator, Surface::Live, clock.now())
            .with_live("live-42", Some("stream-1".to_string()));
        store.insert_attribution_context(ctx.clone()).await.unwrap();
        store
            .insert_short_link(ShortLink::new("live42", creator, offer.id, ctx.id, clock.now()))
            .await
            .unwrap();

        let machine = Arc::new(CheckoutSessionStateMachine::new(
            store.clone(),
            catalog.clone(),
            Arc::new(clock.clone()),
            CheckoutConfig::default(),
        ));
        let reaper = ReservationReaper::new(
            machine.inventory().clone(),
            store.clone(),
            Arc::new(clock.clone()),
            ReaperConfig::default(),
        );

        Self {
            machine,
            reaper,
            store,
            catalog,
            clock,
            creator,
        }
    }

    fn request(&self, key: &str, items: Vec<CartItem>) -> StartCheckout {
        StartCheckout {
            creator_id: self.creator,
            idempotency_key: key.to_string(),
            short_link_code: "live42".to_string(),
            items,
            connection_id: None,
        }
    }

    async fn start(&self, key: &str, sku: &str, quantity: u32) -> CheckoutSession {
        self.machine
            .start(self.request(key, vec![item(sku, quantity, 2999)]))
            .await
            .unwrap()
            .into_session()
    }

    async fn available(&self, sku: &str) -> u32 {
        self.machine
            .available_quantity(&VariantId::new(sku))
            .await
            .unwrap()
    }
}

fn item(sku: &str, quantity: u32, cents: i64) -> CartItem {
    CartItem::new(sku, quantity, Money::from_cents(cents), Currency::usd())
}

#[tokio::test]
async fn test_happy_path_prices_reserves_and_confirms() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 10);

    let session = h.start("order-1", "SKU-1", 1).await;
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.subtotal.cents(), 2999);
    assert_eq!(session.discount.cents(), 600);
    assert_eq!(session.total.cents(), 2399);
    assert_eq!(h.available("SKU-1").await, 9);

    let confirmed = h.machine.confirm(session.id, "ORD-1001").await.unwrap();
    assert_eq!(confirmed.status, SessionStatus::Confirmed);
    assert_eq!(confirmed.external_order_ref.as_deref(), Some("ORD-1001"));

    let reservations = h.machine.session_reservations(session.id).await.unwrap();
    assert!(
        reservations
            .iter()
            .all(|r| r.status == ReservationStatus::Confirmed)
    );
    assert_eq!(h.available("SKU-1").await, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_oversell() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-HOT", 5);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let machine = h.machine.clone();
            tokio::spawn(async move {
                machine
                    .inventory()
                    .reserve(
                        &VariantId::new("SKU-HOT"),
                        1,
                        SessionId::new(),
                        Duration::minutes(15),
                    )
                    .await
            })
        })
        .collect();

    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(CheckoutError::InsufficientInventory { .. })))
        .count();

    assert_eq!(succeeded, 5);
    assert_eq!(insufficient, 15);
    assert_eq!(h.available("SKU-HOT").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_with_same_key_share_one_session() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 10);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let machine = h.machine.clone();
            let request = h.request("dup-key", vec![item("SKU-1", 1, 2999)]);
            tokio::spawn(async move { machine.start(request).await })
        })
        .collect();

    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let created = outcomes.iter().filter(|o| o.is_created()).count();
    assert_eq!(created, 1);
    let first_id = outcomes[0].session().id;
    assert!(outcomes.iter().all(|o| o.session().id == first_id));
    assert_eq!(h.store.session_count().await, 1);
    assert_eq!(h.available("SKU-1").await, 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_unit_goes_to_exactly_one_checkout() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-LAST", 1);

    let a = {
        let machine = h.machine.clone();
        let request = h.request("shopper-a", vec![item("SKU-LAST", 1, 2999)]);
        tokio::spawn(async move { machine.start(request).await })
    };
    let b = {
        let machine = h.machine.clone();
        let request = h.request("shopper-b", vec![item("SKU-LAST", 1, 2999)]);
        tokio::spawn(async move { machine.start(request).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].session().status, SessionStatus::Pending);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(CheckoutError::InsufficientInventory { .. })))
    );
    assert_eq!(h.store.session_count().await, 1);
}

#[tokio::test]
async fn test_double_confirm_is_a_no_op() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 3);
    let session = h.start("order-2", "SKU-1", 1).await;

    let first = h.machine.confirm(session.id, "ORD-1").await.unwrap();
    let second = h.machine.confirm(session.id, "ORD-1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.available("SKU-1").await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirms_agree() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 3);
    let session_id = h.start("order-3", "SKU-1", 2).await.id;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let machine = h.machine.clone();
            tokio::spawn(async move { machine.confirm(session_id, "ORD-7").await })
        })
        .collect();

    for result in join_all(handles).await {
        let confirmed = result.unwrap().unwrap();
        assert_eq!(confirmed.status, SessionStatus::Confirmed);
        assert_eq!(confirmed.external_order_ref.as_deref(), Some("ORD-7"));
    }
    assert_eq!(h.available("SKU-1").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_click_cap_holds_under_concurrency() {
    let h = TestHarness::new().await;
    let mut link = h.store.get_short_link("live42").await.unwrap().unwrap();
    link.code = "capped".to_string();
    link.id = Default::default();
    link.max_clicks = Some(3);
    h.store.insert_short_link(link).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let machine = h.machine.clone();
            tokio::spawn(async move { machine.resolve_short_link("capped").await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(
                r,
                Err(CheckoutError::LinkUnavailable {
                    reason: LinkUnavailableReason::ClickLimitReached,
                    ..
                })
            ))
            .count(),
        7
    );
    let stored = h.store.get_short_link("capped").await.unwrap().unwrap();
    assert_eq!(stored.click_count, 3);
}

async fn insert_link(h: &TestHarness, code: &str, max_clicks: Option<u32>) {
    let mut link = h.store.get_short_link("live42").await.unwrap().unwrap();
    link.code = code.to_string();
    link.id = Default::default();
    link.max_clicks = max_clicks;
    link.expires_at = Some(h.clock.now() + Duration::hours(1));
    h.store.insert_short_link(link).await.unwrap();
}

fn start_from(h: &TestHarness, code: &str, key: &str) -> StartCheckout {
    StartCheckout {
        short_link_code: code.to_string(),
        ..h.request(key, vec![item("SKU-1", 1, 2999)])
    }
}

#[tokio::test]
async fn test_resolve_then_start_counts_one_click() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 5);
    insert_link(&h, "once", Some(1)).await;

    let resolution = h.machine.resolve_short_link("once").await.unwrap();
    assert_eq!(resolution.short_link.click_count, 1);

    let session = h
        .machine
        .start(start_from(&h, "once", "order-once"))
        .await
        .unwrap()
        .into_session();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.short_link_id, resolution.short_link.id);

    let stored = h.store.get_short_link("once").await.unwrap().unwrap();
    assert_eq!(stored.click_count, 1);

    // The cap still applies to new clicks.
    assert!(matches!(
        h.machine.resolve_short_link("once").await,
        Err(CheckoutError::LinkUnavailable {
            reason: LinkUnavailableReason::ClickLimitReached,
            ..
        })
    ));
}

#[tokio::test]
async fn test_start_refuses_revoked_and_expired_links() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 5);
    insert_link(&h, "gone", None).await;
    insert_link(&h, "late", None).await;

    h.store
        .revoke_short_link("gone", h.clock.now())
        .await
        .unwrap();
    assert!(matches!(
        h.machine.start(start_from(&h, "gone", "order-gone")).await,
        Err(CheckoutError::LinkUnavailable {
            reason: LinkUnavailableReason::Revoked,
            ..
        })
    ));

    h.clock.advance(Duration::hours(1));
    assert!(matches!(
        h.machine.start(start_from(&h, "late", "order-late")).await,
        Err(CheckoutError::LinkUnavailable {
            reason: LinkUnavailableReason::Expired,
            ..
        })
    ));
    assert_eq!(h.available("SKU-1").await, 5);
}

#[tokio::test]
async fn test_overflowing_cart_is_refused_without_holds() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 5);
    h.catalog.set_stock("SKU-2", 5);
    let half = i64::MAX / 2 + 1;

    let err = h
        .machine
        .start(h.request(
            "order-huge",
            vec![item("SKU-1", 1, half), item("SKU-2", 1, half)],
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::InvalidRequest(_)));
    assert_eq!(h.available("SKU-1").await, 5);
    assert_eq!(h.available("SKU-2").await, 5);
}

#[tokio::test]
async fn test_expired_hold_is_reaped_and_stock_reused() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-ONE", 1);
    let session = h.start("order-4", "SKU-ONE", 1).await;
    assert_eq!(h.available("SKU-ONE").await, 0);

    h.clock.advance(Duration::minutes(15));
    let report = h.reaper.sweep_once(h.clock.now()).await.unwrap();
    assert_eq!(report.reservations_expired, 1);
    assert_eq!(report.sessions_expired, 1);

    let stored = h.machine.get_session(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);
    let reservations = h.machine.session_reservations(session.id).await.unwrap();
    assert_eq!(reservations[0].status, ReservationStatus::Expired);

    let next = h.start("order-5", "SKU-ONE", 1).await;
    assert_eq!(next.status, SessionStatus::Pending);
}

#[tokio::test]
async fn test_lapsed_hold_frees_stock_without_reaper() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-ONE", 1);
    h.start("order-6", "SKU-ONE", 1).await;

    h.clock.advance(Duration::minutes(15));
    assert_eq!(h.available("SKU-ONE").await, 1);
    h.start("order-7", "SKU-ONE", 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reaper_and_confirm_agree_past_expiry() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 1);
    let session = h.start("order-8", "SKU-1", 1).await;
    h.clock.advance(Duration::minutes(15));

    let now = h.clock.now();
    let (confirm, sweep) = tokio::join!(
        h.machine.confirm(session.id, "ORD-late"),
        h.reaper.sweep_once(now)
    );

    assert!(matches!(
        confirm,
        Err(CheckoutError::ReservationConflict { .. }) | Err(CheckoutError::InvalidState { .. })
    ));
    sweep.unwrap();

    let stored = h.machine.get_session(session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);
    let reservations = h.machine.session_reservations(session.id).await.unwrap();
    assert_eq!(reservations[0].status, ReservationStatus::Expired);
}

#[tokio::test]
async fn test_failed_start_leaves_no_outstanding_reservations() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-A", 5);
    h.catalog.set_stock("SKU-B", 1);

    let err = h
        .machine
        .start(h.request(
            "order-9",
            vec![item("SKU-A", 2, 1000), item("SKU-B", 3, 1000)],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::InsufficientInventory { .. }));
    assert_eq!(h.available("SKU-A").await, 5);
    assert_eq!(h.available("SKU-B").await, 1);
    assert!(
        h.store
            .find_session_by_key(h.creator, "order-9")
            .await
            .unwrap()
            .is_none()
    );

    // The key is free again once the cart fits.
    h.catalog.set_stock("SKU-B", 3);
    let retry = h
        .machine
        .start(h.request(
            "order-9",
            vec![item("SKU-A", 2, 1000), item("SKU-B", 3, 1000)],
        ))
        .await
        .unwrap();
    assert!(retry.is_created());
}

#[tokio::test]
async fn test_key_reused_by_another_creator_conflicts() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-1", 5);
    h.start("shared-key", "SKU-1", 1).await;

    let mut foreign = h.request("shared-key", vec![item("SKU-1", 1, 2999)]);
    foreign.creator_id = CreatorId::new();
    let err = h.machine.start(foreign).await.unwrap_err();
    assert!(matches!(err, CheckoutError::KeyConflict { .. }));
    assert_eq!(h.available("SKU-1").await, 4);
}

#[tokio::test]
async fn test_cancel_releases_every_line() {
    let h = TestHarness::new().await;
    h.catalog.set_stock("SKU-A", 2);
    h.catalog.set_stock("SKU-B", 2);
    let session = h
        .machine
        .start(h.request(
            "order-10",
            vec![item("SKU-A", 2, 1000), item("SKU-B", 1, 500)],
        ))
        .await
        .unwrap()
        .into_session();
    assert_eq!(h.available("SKU-A").await, 0);

    let cancelled = h
        .machine
        .cancel(session.id, Some("out of budget".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(h.available("SKU-A").await, 2);
    assert_eq!(h.available("SKU-B").await, 2);

    for reservation in h.machine.session_reservations(session.id).await.unwrap() {
        assert_eq!(reservation.status, ReservationStatus::Released);
    }
}
