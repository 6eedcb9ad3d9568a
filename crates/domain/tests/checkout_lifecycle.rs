//! Integration tests for the checkout domain model.
//!
//! These tests walk a cart through pricing, session creation and the
//! session and reservation state machines without any store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{AttributionContextId, CreatorId, SessionId, ShortLinkId, VariantId};
use domain::{
    CartItem, CheckoutSession, Currency, Money, NewSession, Offer, OfferKind, PricingCalculator,
    ReleaseReason, Reservation, ReservationStatus, SessionStatus,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
}

fn cart(quantity: u32, cents: i64) -> Vec<CartItem> {
    vec![CartItem::new(
        "SKU-001",
        quantity,
        Money::from_cents(cents),
        Currency::usd(),
    )]
}

fn open_session(offer: &Offer, items: &[CartItem], ttl: Duration) -> CheckoutSession {
    let quote = PricingCalculator::new().price(offer, items, t0()).unwrap();
    NewSession {
        id: SessionId::new(),
        creator_id: offer.creator_id,
        idempotency_key: "checkout-1".to_string(),
        short_link_id: ShortLinkId::new(),
        attribution_context_id: AttributionContextId::new(),
        offer_id: offer.id,
        connection_id: offer.connection_id,
        quote,
        reservation_ids: Vec::new(),
        created_at: t0(),
        expires_at: t0() + ttl,
    }
    .into()
}

mod session_lifecycle {
    use super::*;

    #[test]
    fn priced_session_starts_pending_with_quote_totals() {
        let offer = Offer::percentage_off(CreatorId::new(), 20);
        let session = open_session(&offer, &cart(1, 2999), Duration::minutes(30));

        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.subtotal, Money::from_cents(2999));
        assert_eq!(session.discount, Money::from_cents(600));
        assert_eq!(session.total, Money::from_cents(2399));
        assert_eq!(session.total, session.subtotal - session.discount);
        assert_eq!(session.line_items[0].offer_price, Money::from_cents(2399));
        assert!(session.is_open_at(t0()));
    }

    #[test]
    fn confirm_records_order_reference_and_closes() {
        let offer = Offer::percentage_off(CreatorId::new(), 10);
        let mut session = open_session(&offer, &cart(2, 1000), Duration::minutes(30));
        let at = t0() + Duration::minutes(5);

        assert!(session.apply_transition(
            SessionStatus::Confirmed,
            at,
            Some("order-77".to_string()),
            None
        ));

        assert_eq!(session.status, SessionStatus::Confirmed);
        assert_eq!(session.external_order_ref.as_deref(), Some("order-77"));
        assert_eq!(session.closed_at, Some(at));
        assert!(!session.is_open_at(at));
    }

    #[test]
    fn terminal_sessions_refuse_every_transition() {
        let offer = Offer::percentage_off(CreatorId::new(), 10);
        let mut session = open_session(&offer, &cart(1, 500), Duration::minutes(30));
        assert!(session.apply_transition(
            SessionStatus::Cancelled,
            t0(),
            None,
            Some("shopper left".to_string())
        ));

        for to in [
            SessionStatus::Pending,
            SessionStatus::Confirmed,
            SessionStatus::Cancelled,
            SessionStatus::Expired,
        ] {
            assert!(!session.apply_transition(to, t0(), None, None));
        }
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.cancel_reason.as_deref(), Some("shopper left"));
    }

    #[test]
    fn confirm_at_the_expiry_instant_is_refused() {
        let offer = Offer::percentage_off(CreatorId::new(), 10);
        let mut session = open_session(&offer, &cart(1, 500), Duration::minutes(15));
        let deadline = session.expires_at;

        assert!(!session.apply_transition(SessionStatus::Confirmed, deadline, None, None));
        assert_eq!(session.status, SessionStatus::Pending);

        // The reaper may still expire it.
        assert!(session.apply_transition(SessionStatus::Expired, deadline, None, None));
    }
}

mod reservation_lifecycle {
    use super::*;

    fn hold(quantity: u32) -> Reservation {
        Reservation::pending(
            VariantId::new("SKU-001"),
            SessionId::new(),
            quantity,
            t0(),
            t0() + Duration::minutes(15),
        )
    }

    #[test]
    fn pending_hold_counts_until_it_lapses() {
        let r = hold(2);

        assert!(r.is_live_at(t0()));
        assert!(r.is_confirmable_at(t0() + Duration::minutes(14)));
        assert!(!r.is_live_at(t0() + Duration::minutes(15)));
        assert!(!r.is_confirmable_at(t0() + Duration::minutes(15)));
    }

    #[test]
    fn confirmed_hold_outlives_its_ttl_until_completed() {
        let mut r = hold(1);
        r.confirm(t0() + Duration::minutes(1));

        let later = t0() + Duration::hours(2);
        assert!(r.is_live_at(later));
        assert!(!r.can_release(ReleaseReason::Expired));
        assert!(r.can_release(ReleaseReason::Completed));

        r.release(ReleaseReason::Completed, later);
        assert_eq!(r.status, ReservationStatus::Released);
        assert_eq!(r.release_reason, Some(ReleaseReason::Completed));
        assert!(!r.is_live_at(later));
    }

    #[test]
    fn expiry_lands_in_expired_status() {
        let mut r = hold(3);
        r.release(ReleaseReason::Expired, t0() + Duration::minutes(20));

        assert_eq!(r.status, ReservationStatus::Expired);
        assert!(!r.status.is_outstanding());
        assert!(!r.can_release(ReleaseReason::Cancelled));
    }
}

mod pricing_scenarios {
    use super::*;

    #[test]
    fn amount_off_never_drives_total_negative() {
        let offer = Offer::new(
            CreatorId::new(),
            "$50 off",
            OfferKind::AmountOff {
                amount: Money::from_cents(5000),
                currency: Currency::usd(),
            },
        );

        let quote = PricingCalculator::new()
            .price(&offer, &cart(1, 1999), t0())
            .unwrap();

        assert_eq!(quote.discount, Money::from_cents(1999));
        assert_eq!(quote.total, Money::zero());
    }

    #[test]
    fn fixed_price_discounts_each_unit() {
        let offer = Offer::new(
            CreatorId::new(),
            "Everything $10",
            OfferKind::FixedPrice {
                unit_price: Money::from_cents(1000),
                currency: Currency::usd(),
            },
        );

        let quote = PricingCalculator::new()
            .price(&offer, &cart(3, 1500), t0())
            .unwrap();

        assert_eq!(quote.subtotal, Money::from_cents(4500));
        assert_eq!(quote.discount, Money::from_cents(1500));
        assert_eq!(quote.total, Money::from_cents(3000));
    }

    #[test]
    fn expired_offer_cannot_price() {
        let offer = Offer::percentage_off(CreatorId::new(), 15)
            .valid_between(None, Some(t0() - Duration::seconds(1)));

        let err = PricingCalculator::new()
            .price(&offer, &cart(1, 1000), t0())
            .unwrap_err();

        assert!(err.is_offer_error());
    }
}
