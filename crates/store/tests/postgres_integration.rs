//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container. Every test works on its own
//! codes, keys and variant ids, so they can run in parallel:
//!
//! ```bash
//! cargo test -p checkout-store --test postgres_integration
//! ```

use std::sync::Arc;

use checkout_store::{
    CheckoutStore, ClaimOutcome, ClaimState, ClickOutcome, ConfirmOutcome, PostgresCheckoutStore,
    ReleaseOutcome, ReserveOutcome, SessionTransition, StoreError,
};
use chrono::{DateTime, Duration, Utc};
use common::{CreatorId, OfferId, SessionId, VariantId};
use domain::{
    AttributionContext, CartItem, CheckoutSession, Currency, LinkUnavailableReason, Money,
    NewSession, Offer, PricingCalculator, ReleaseReason, Reservation, ReservationStatus,
    SessionStatus, ShortLink, Surface,
};
use futures_util::future::join_all;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_checkout_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresCheckoutStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    PostgresCheckoutStore::new(pool)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

async fn seed_link(
    store: &PostgresCheckoutStore,
    max_clicks: Option<u32>,
    now: DateTime<Utc>,
) -> ShortLink {
    let ctx = AttributionContext::new(CreatorId::new(), Surface::Live, now)
        .with_live("live-1", Some("stream-9".to_string()))
        .with_metadata("product_position", serde_json::json!(2));
    store.insert_attribution_context(ctx.clone()).await.unwrap();

    let mut link = ShortLink::new(unique("c"), ctx.creator_id, OfferId::new(), ctx.id, now);
    link.max_clicks = max_clicks;
    store.insert_short_link(link.clone()).await.unwrap();
    link
}

fn new_session(
    creator_id: CreatorId,
    key: &str,
    reservations: &[Reservation],
    now: DateTime<Utc>,
) -> CheckoutSession {
    let offer = Offer::percentage_off(creator_id, 20);
    let quote = PricingCalculator::new()
        .price(
            &offer,
            &[CartItem::new("SKU", 1, Money::from_cents(2999), Currency::usd())],
            now,
        )
        .unwrap();

    NewSession {
        id: reservations.first().map(|r| r.session_id).unwrap_or_default(),
        creator_id,
        idempotency_key: key.to_string(),
        short_link_id: Default::default(),
        attribution_context_id: Default::default(),
        offer_id: offer.id,
        connection_id: None,
        quote,
        reservation_ids: reservations.iter().map(|r| r.id).collect(),
        created_at: now,
        expires_at: now + Duration::minutes(30),
    }
    .into()
}

fn pending(variant: &VariantId, session_id: SessionId, qty: u32, now: DateTime<Utc>) -> Reservation {
    Reservation::pending(
        variant.clone(),
        session_id,
        qty,
        now,
        now + Duration::minutes(15),
    )
}

#[tokio::test]
async fn attribution_context_round_trips() {
    let store = get_test_store().await;
    let now = Utc::now();
    let link = seed_link(&store, None, now).await;

    let ctx = store
        .get_attribution_context(link.attribution_context_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ctx.surface, Surface::Live);
    assert_eq!(ctx.stream_id.as_deref(), Some("stream-9"));
    assert_eq!(ctx.metadata["product_position"], serde_json::json!(2));
}

#[tokio::test]
async fn duplicate_link_code_is_rejected() {
    let store = get_test_store().await;
    let now = Utc::now();
    let link = seed_link(&store, None, now).await;

    let mut clash = link.clone();
    clash.id = Default::default();
    let result = store.insert_short_link(clash).await;
    assert!(matches!(result, Err(StoreError::DuplicateKey(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clicks_respect_cap() {
    let store = get_test_store().await;
    let now = Utc::now();
    let link = seed_link(&store, Some(3), now).await;

    let tasks = (0..10).map(|_| {
        let store = store.clone();
        let code = link.code.clone();
        tokio::spawn(async move { store.record_click(&code, Utc::now()).await.unwrap() })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let recorded = outcomes
        .iter()
        .filter(|o| matches!(o, ClickOutcome::Recorded(_)))
        .count();
    assert_eq!(recorded, 3);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        ClickOutcome::Recorded(_) | ClickOutcome::Unavailable(LinkUnavailableReason::ClickLimitReached)
    )));

    let stored = store.get_short_link(&link.code).await.unwrap().unwrap();
    assert_eq!(stored.click_count, 3);
}

#[tokio::test]
async fn revoked_link_refuses_clicks() {
    let store = get_test_store().await;
    let now = Utc::now();
    let link = seed_link(&store, None, now).await;

    let revoked = store.revoke_short_link(&link.code, now).await.unwrap().unwrap();
    assert!(revoked.revoked);
    assert_eq!(
        store.record_click(&link.code, now).await.unwrap(),
        ClickOutcome::Unavailable(LinkUnavailableReason::Revoked)
    );
    assert_eq!(
        store.record_click("missing-code", now).await.unwrap(),
        ClickOutcome::NotFound
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let store = get_test_store().await;
    let variant = VariantId::new(unique("sku"));
    let now = Utc::now();

    let tasks = (0..20).map(|_| {
        let store = store.clone();
        let r = pending(&variant, SessionId::new(), 1, now);
        tokio::spawn(async move { store.try_reserve(r, 5, now).await.unwrap() })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let reserved = outcomes
        .iter()
        .filter(|o| matches!(o, ReserveOutcome::Reserved(_)))
        .count();
    assert_eq!(reserved, 5);
    assert_eq!(store.outstanding_quantity(&variant, now).await.unwrap(), 5);
}

#[tokio::test]
async fn stale_reservations_are_expired_on_reserve() {
    let store = get_test_store().await;
    let variant = VariantId::new(unique("sku"));
    let now = Utc::now();

    let stale = pending(&variant, SessionId::new(), 1, now);
    let stale_id = stale.id;
    store.try_reserve(stale, 1, now).await.unwrap();

    let later = now + Duration::minutes(15);
    let outcome = store
        .try_reserve(pending(&variant, SessionId::new(), 1, later), 1, later)
        .await
        .unwrap();
    assert!(matches!(outcome, ReserveOutcome::Reserved(_)));

    let stale = store.get_reservation(stale_id).await.unwrap().unwrap();
    assert_eq!(stale.status, ReservationStatus::Expired);
    assert_eq!(stale.release_reason, Some(ReleaseReason::Expired));
}

#[tokio::test]
async fn confirm_reservations_is_atomic() {
    let store = get_test_store().await;
    let now = Utc::now();
    let session_id = SessionId::new();
    let a = pending(&VariantId::new(unique("a")), session_id, 1, now);
    let b = pending(&VariantId::new(unique("b")), session_id, 1, now);
    let (a_id, b_id) = (a.id, b.id);
    store.try_reserve(a, 1, now).await.unwrap();
    store.try_reserve(b, 1, now).await.unwrap();

    store
        .release_reservation(b_id, ReleaseReason::Cancelled, now)
        .await
        .unwrap();
    let outcome = store.confirm_reservations(&[a_id, b_id], now).await.unwrap();
    assert!(matches!(
        outcome,
        ConfirmOutcome::Conflict { reservation_id, .. } if reservation_id == b_id
    ));
    assert_eq!(
        store.get_reservation(a_id).await.unwrap().unwrap().status,
        ReservationStatus::Pending
    );

    let outcome = store.confirm_reservations(&[a_id], now).await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Confirmed(ref rs) if rs.len() == 1));

    let release = store
        .release_reservation(a_id, ReleaseReason::Expired, now)
        .await
        .unwrap();
    assert!(matches!(release, ReleaseOutcome::Rejected(_)));
}

#[tokio::test]
async fn idempotency_claim_lifecycle() {
    let store = get_test_store().await;
    let now = Utc::now();
    let creator = CreatorId::new();
    let key = unique("key");
    let variant = VariantId::new(unique("sku"));
    let session_id = SessionId::new();

    let claim = store
        .claim_idempotency_key(creator, &key, session_id, now, now - Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(claim, ClaimOutcome::Claimed);

    let r = pending(&variant, session_id, 1, now);
    store.try_reserve(r.clone(), 3, now).await.unwrap();
    let session = new_session(creator, &key, &[r], now);
    store.insert_session(session.clone()).await.unwrap();

    let held = store
        .claim_idempotency_key(creator, &key, SessionId::new(), now, now)
        .await
        .unwrap();
    assert!(matches!(
        held,
        ClaimOutcome::Held(ref c) if c.state == ClaimState::Completed && c.session_id == session.id
    ));

    let found = store.find_session_by_key(creator, &key).await.unwrap().unwrap();
    assert_eq!(found.id, session.id);
    assert_eq!(found.total.cents(), 2399);
    assert_eq!(found.reservation_ids, session.reservation_ids);
    assert!(
        store
            .find_session_by_key(CreatorId::new(), &key)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn released_claim_can_be_reclaimed() {
    let store = get_test_store().await;
    let now = Utc::now();
    let creator = CreatorId::new();
    let key = unique("key");
    let first = SessionId::new();

    store
        .claim_idempotency_key(creator, &key, first, now, now)
        .await
        .unwrap();
    store.release_idempotency_claim(&key, first).await.unwrap();

    let again = store
        .claim_idempotency_key(creator, &key, SessionId::new(), now, now)
        .await
        .unwrap();
    assert_eq!(again, ClaimOutcome::Claimed);
}

#[tokio::test]
async fn session_expires_only_when_drained() {
    let store = get_test_store().await;
    let now = Utc::now();
    let creator = CreatorId::new();
    let key = unique("key");
    let variant = VariantId::new(unique("sku"));
    let session_id = SessionId::new();

    let r = pending(&variant, session_id, 1, now);
    store.try_reserve(r.clone(), 1, now).await.unwrap();
    let session = new_session(creator, &key, std::slice::from_ref(&r), now);
    store.insert_session(session.clone()).await.unwrap();

    let late = now + Duration::minutes(31);
    assert_eq!(
        store
            .expired_pending_sessions(late, 10)
            .await
            .unwrap()
            .iter()
            .filter(|s| s.id == session.id)
            .count(),
        1
    );

    // Reservation rows still say pending, but their TTL has passed.
    let applied = store.expire_session_if_drained(session.id, late).await.unwrap();
    assert!(matches!(applied, SessionTransition::Applied(ref s) if s.status == SessionStatus::Expired));

    let confirm = store
        .transition_session(session.id, SessionStatus::Confirmed, late, None, None)
        .await
        .unwrap();
    assert!(matches!(confirm, SessionTransition::Rejected(_)));
}
