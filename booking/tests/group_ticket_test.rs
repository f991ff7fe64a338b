//! Group ticket tests: stock under concurrent purchases, party size limits,
//! and redemption into prepaid orders.

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use chrono::Duration;
use cinema_booking::{
    BookingCore, BookingError, CinemaId, GroupTicketKind, GroupTicketType, GroupTicketTypeId,
    HallId, MockPaymentGateway, Money, MovieId, OrderStatus, PaymentMethod, PurchaseSource,
    Redemption, Screening, ScreeningId, SeatRef, TicketStatus, UserId,
};
use cinema_core::environment::Clock;
use cinema_testing::{ManualClock, test_clock};
use std::sync::Arc;

struct Harness {
    core: Arc<BookingCore>,
    clock: ManualClock,
    gateway: MockPaymentGateway,
    type_id: GroupTicketTypeId,
    screening_id: ScreeningId,
}

impl Harness {
    /// Family pack of 2..=10 at 30.00 each with `stock` left, plus a
    /// matching 4x4 screening tomorrow
    async fn new(stock: u32) -> Self {
        let clock = ManualClock::starting_at(test_clock().now());
        let gateway = MockPaymentGateway::new();
        let core = BookingCore::builder()
            .clock(Arc::new(clock.clone()))
            .gateway(Arc::new(gateway.clone()))
            .build()
            .unwrap();

        let movie_id = MovieId::new();
        let cinema_id = CinemaId::new();
        let type_id = GroupTicketTypeId::new();
        core.register_group_ticket_type(GroupTicketType {
            id: type_id,
            kind: GroupTicketKind::Family,
            name: "Family Pack".to_string(),
            movie_id,
            cinema_id,
            unit_price: Money::from_cents(3_000),
            min_quantity: 2,
            max_quantity: 10,
            valid_until: (clock.now() + Duration::days(30)).date_naive(),
            stock,
            active: true,
        })
        .await
        .unwrap();

        let screening = Screening {
            id: ScreeningId::new(),
            movie_id,
            cinema_id,
            hall_id: HallId::new(),
            starts_at: clock.now() + Duration::days(1),
            ticket_price: Money::from_cents(4_500),
            rows: 4,
            cols: 4,
        };
        let screening_id = screening.id;
        core.schedule_screening(screening).await.unwrap();

        Self {
            core: Arc::new(core),
            clock,
            gateway,
            type_id,
            screening_id,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_purchases_never_oversell() {
    let h = Harness::new(5).await;

    let buyers = (0..2).map(|_| {
        let core = Arc::clone(&h.core);
        let type_id = h.type_id;
        tokio::spawn(async move {
            core.purchase_group_ticket(UserId::new(), type_id, 3, PaymentMethod::WeChatPay)
                .await
        })
    });
    let results: Vec<_> = futures::future::join_all(buyers)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let refused = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(refused, BookingError::StockExhausted { requested: 3, .. }));
    assert_eq!(h.core.group_ticket_stock(h.type_id).await.unwrap(), 2);

    // Whatever the loser was charged went back
    assert_eq!(
        h.gateway.charges().len() - h.gateway.refunds().len(),
        1
    );
}

#[tokio::test]
async fn test_purchase_prices_and_records_the_ticket() {
    let h = Harness::new(20).await;
    let user = UserId::new();

    let purchase = h
        .core
        .purchase_group_ticket(user, h.type_id, 4, PaymentMethod::CreditCard)
        .await
        .unwrap();

    assert_eq!(purchase.ticket_count, 4);
    assert_eq!(purchase.total_price, Money::from_cents(12_000));
    assert_eq!(purchase.redemption, Redemption::Available);
    assert_eq!(h.core.group_ticket_stock(h.type_id).await.unwrap(), 16);
    assert_eq!(h.gateway.charges()[0].amount, Money::from_cents(12_000));
    assert_eq!(h.core.purchased_group_tickets_for_user(user).await.len(), 1);
}

#[tokio::test]
async fn test_party_size_and_availability_rules() {
    let h = Harness::new(20).await;
    let user = UserId::new();

    for quantity in [1, 11] {
        let error = h
            .core
            .purchase_group_ticket(user, h.type_id, quantity, PaymentMethod::Alipay)
            .await
            .unwrap_err();
        assert_eq!(
            error,
            BookingError::InvalidQuantityRange {
                requested: quantity,
                min: 2,
                max: 10,
            }
        );
    }

    let error = h
        .core
        .purchase_group_ticket(user, h.type_id, 2, PaymentMethod::GroupTicket)
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::PaymentFailed { .. }));

    h.gateway.set_declining(true);
    let error = h
        .core
        .purchase_group_ticket(user, h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::PaymentFailed { .. }));
    assert_eq!(h.core.group_ticket_stock(h.type_id).await.unwrap(), 20);
    h.gateway.set_declining(false);

    h.core.deactivate_group_ticket(h.type_id).await.unwrap();
    let error = h
        .core
        .purchase_group_ticket(user, h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::GroupTicketUnavailable(_)));
    assert!(h.gateway.charges().is_empty());
}

#[tokio::test]
async fn test_expired_type_is_not_sold() {
    let h = Harness::new(20).await;

    h.clock.advance(Duration::days(31));
    let error = h
        .core
        .purchase_group_ticket(UserId::new(), h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::GroupTicketUnavailable(_)));
}

#[tokio::test]
async fn test_restock_adds_to_remaining_stock() {
    let h = Harness::new(2).await;

    h.core
        .purchase_group_ticket(UserId::new(), h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap();
    assert_eq!(h.core.group_ticket_stock(h.type_id).await.unwrap(), 0);

    assert_eq!(h.core.restock_group_ticket(h.type_id, 5).await.unwrap(), 5);
    assert!(h.core.restock_group_ticket(h.type_id, 0).await.is_err());
}

#[tokio::test]
async fn test_redemption_creates_prepaid_order() {
    let h = Harness::new(20).await;
    let user = UserId::new();
    let purchase = h
        .core
        .purchase_group_ticket(user, h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap();
    let charges_before = h.gateway.charges().len();

    let order = h
        .core
        .redeem_group_ticket(
            purchase.id,
            h.screening_id,
            vec![SeatRef::new(2, 2), SeatRef::new(2, 3)],
        )
        .await
        .unwrap();

    assert_eq!(order.state(), (OrderStatus::Paid, TicketStatus::Issued));
    assert_eq!(order.user_id, user);
    assert_eq!(order.amount, Money::ZERO);
    assert_eq!(order.payment_method, PaymentMethod::GroupTicket);
    assert_eq!(
        order.source,
        PurchaseSource::GroupTicket {
            purchased_ticket: purchase.id
        }
    );
    assert_eq!(h.gateway.charges().len(), charges_before);
    assert_eq!(h.core.tickets_for_order(order.id).await.len(), 2);
    assert_eq!(h.core.screening_counts(h.screening_id).await.unwrap().sold, 2);

    let stored = h.core.purchased_group_tickets_for_user(user).await;
    assert!(matches!(stored[0].redemption, Redemption::Redeemed { .. }));

    let error = h
        .core
        .redeem_group_ticket(
            purchase.id,
            h.screening_id,
            vec![SeatRef::new(3, 2), SeatRef::new(3, 3)],
        )
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::AlreadyUsed { .. }));
}

#[tokio::test]
async fn test_failed_redemption_keeps_ticket_redeemable() {
    let h = Harness::new(20).await;
    let purchase = h
        .core
        .purchase_group_ticket(UserId::new(), h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap();

    // Wrong party size
    let error = h
        .core
        .redeem_group_ticket(purchase.id, h.screening_id, vec![SeatRef::new(1, 1)])
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::InvalidSeatSelection(_)));

    // Seats taken by someone else
    h.core
        .lock_seats_default(h.screening_id, vec![SeatRef::new(1, 2)])
        .await
        .unwrap();
    let error = h
        .core
        .redeem_group_ticket(
            purchase.id,
            h.screening_id,
            vec![SeatRef::new(1, 1), SeatRef::new(1, 2)],
        )
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::SeatConflict { .. }));

    let order = h
        .core
        .redeem_group_ticket(
            purchase.id,
            h.screening_id,
            vec![SeatRef::new(4, 1), SeatRef::new(4, 2)],
        )
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_redemption_needs_matching_screening() {
    let h = Harness::new(20).await;
    let purchase = h
        .core
        .purchase_group_ticket(UserId::new(), h.type_id, 2, PaymentMethod::Alipay)
        .await
        .unwrap();

    let other = Screening {
        id: ScreeningId::new(),
        movie_id: MovieId::new(),
        cinema_id: CinemaId::new(),
        hall_id: HallId::new(),
        starts_at: h.clock.now() + Duration::days(1),
        ticket_price: Money::from_cents(4_500),
        rows: 2,
        cols: 2,
    };
    let other_id = other.id;
    h.core.schedule_screening(other).await.unwrap();

    let error = h
        .core
        .redeem_group_ticket(
            purchase.id,
            other_id,
            vec![SeatRef::new(1, 1), SeatRef::new(1, 2)],
        )
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::GroupTicketUnavailable(_)));
    assert_eq!(h.core.available_count(other_id).await.unwrap(), 4);
}
