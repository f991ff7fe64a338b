//! Races between the operations that move one order out of its current
//! state: pay, cancel, verification and the expiration sweep.
//!
//! Whichever side wins, the order must end in exactly one terminal outcome,
//! the seat counts must agree with it and the customer is charged at most
//! once net of refunds.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use chrono::Duration;
use cinema_booking::{
    BookingCore, BookingError, CinemaId, ExpirationSweeper, HallId, MockPaymentGateway, Money,
    MovieId, Order, OrderId, OrderStatus, PaymentMethod, Screening, ScreeningId, SeatRef,
    TicketStatus, UserId,
};
use cinema_core::environment::Clock;
use cinema_testing::{ManualClock, test_clock};
use std::sync::Arc;

const ROUNDS: usize = 40;
const CAPACITY: u32 = 4;

struct Race {
    core: Arc<BookingCore>,
    clock: ManualClock,
    gateway: MockPaymentGateway,
    screening_id: ScreeningId,
}

impl Race {
    /// A 2x2 hall with a screening tomorrow
    async fn new() -> Self {
        let clock = ManualClock::starting_at(test_clock().now());
        let gateway = MockPaymentGateway::new();
        let core = BookingCore::builder()
            .clock(Arc::new(clock.clone()))
            .gateway(Arc::new(gateway.clone()))
            .build()
            .unwrap();

        let screening = Screening {
            id: ScreeningId::new(),
            movie_id: MovieId::new(),
            cinema_id: CinemaId::new(),
            hall_id: HallId::new(),
            starts_at: clock.now() + Duration::days(1),
            ticket_price: Money::from_cents(5_000),
            rows: 2,
            cols: 2,
        };
        let screening_id = screening.id;
        core.schedule_screening(screening).await.unwrap();

        Self {
            core: Arc::new(core),
            clock,
            gateway,
            screening_id,
        }
    }

    async fn pending_order(&self, hold: std::time::Duration) -> Order {
        let handle = self
            .core
            .lock_seats(self.screening_id, vec![SeatRef::new(1, 1)], hold)
            .await
            .unwrap();
        self.core
            .create_order(UserId::new(), handle, PaymentMethod::CreditCard)
            .await
            .unwrap()
    }

    /// The order is settled one way or the other, and seats and money agree
    async fn assert_settled(&self, order_id: OrderId) -> Order {
        let order = self.core.order(order_id).await.unwrap();
        let counts = self.core.screening_counts(self.screening_id).await.unwrap();
        let charges = self.gateway.charges().len();
        let refunds = self.gateway.refunds().len();
        assert!(refunds <= charges, "{refunds} refunds for {charges} charges");
        let net_charges = charges - refunds;

        assert_eq!(counts.locked, 0, "{order:?}");
        match order.status {
            OrderStatus::Paid => {
                assert_eq!(counts.sold, 1);
                assert_eq!(net_charges, 1);
            },
            OrderStatus::Cancelled => {
                assert_eq!(counts.sold, 0);
                assert_eq!(counts.available, CAPACITY);
                assert_eq!(net_charges, 0);
                assert!(self.core.refunds_for_order(order_id).await.len() <= 1);
            },
            OrderStatus::Pending => panic!("order left pending: {order:?}"),
        }
        order
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pay_and_cancel_race_settles_once() {
    for _ in 0..ROUNDS {
        let race = Race::new().await;
        let order = race.pending_order(std::time::Duration::from_secs(900)).await;

        let payer = {
            let core = Arc::clone(&race.core);
            tokio::spawn(async move { core.pay(order.id, PaymentMethod::CreditCard).await })
        };
        let canceller = {
            let core = Arc::clone(&race.core);
            tokio::spawn(async move { core.cancel_order(order.id).await })
        };
        let (paid, cancelled) = tokio::join!(payer, canceller);
        let paid = paid.unwrap();
        let (cancelled, refund) = cancelled.unwrap().unwrap();

        // The cancel always lands; it refunds only if the payment got in first
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        match paid {
            Ok(_) => {
                assert_eq!(cancelled.ticket_status, TicketStatus::Refunded);
                assert_eq!(refund.unwrap().amount, order.amount);
            },
            Err(error) => {
                assert!(
                    matches!(error, BookingError::InvalidStateTransition { .. }),
                    "{error:?}"
                );
                assert_eq!(cancelled.ticket_status, TicketStatus::Unissued);
                assert!(refund.is_none());
            },
        }

        let settled = race.assert_settled(order.id).await;
        assert_eq!(settled, cancelled);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pay_and_sweep_race_at_deadline() {
    for _ in 0..ROUNDS {
        let race = Race::new().await;
        // Hold and payment deadline lapse together
        let order = race.pending_order(std::time::Duration::from_secs(30 * 60)).await;
        race.clock
            .advance(Duration::minutes(30) - Duration::seconds(1));

        let payer = {
            let core = Arc::clone(&race.core);
            tokio::spawn(async move { core.pay(order.id, PaymentMethod::CreditCard).await })
        };
        let sweeper = {
            let sweeper = ExpirationSweeper::new(Arc::clone(&race.core));
            let clock = race.clock.clone();
            tokio::spawn(async move {
                clock.advance(Duration::seconds(2));
                sweeper.sweep_once().await
            })
        };
        let (paid, report) = tokio::join!(payer, sweeper);
        let paid = paid.unwrap();
        let report = report.unwrap();

        let settled = race.assert_settled(order.id).await;
        match paid {
            Ok(_) => {
                assert_eq!(settled.state(), (OrderStatus::Paid, TicketStatus::Issued));
                assert_eq!(report.orders_cancelled, 0);
            },
            Err(error) => {
                assert!(
                    matches!(
                        error,
                        BookingError::PaymentFailed { .. }
                            | BookingError::InvalidStateTransition { .. }
                    ),
                    "{error:?}"
                );
                assert_eq!(settled.state(), (OrderStatus::Cancelled, TicketStatus::Unissued));
            },
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verify_and_cancel_race_settles_once() {
    for _ in 0..ROUNDS {
        let race = Race::new().await;
        let order = race.pending_order(std::time::Duration::from_secs(900)).await;
        race.core
            .pay(order.id, PaymentMethod::CreditCard)
            .await
            .unwrap();
        let code = race.core.tickets_for_order(order.id).await[0].code.clone();

        let verifier = {
            let core = Arc::clone(&race.core);
            tokio::spawn(async move { core.verify_ticket(code.as_str()).await })
        };
        let canceller = {
            let core = Arc::clone(&race.core);
            tokio::spawn(async move { core.cancel_order(order.id).await })
        };
        let (verified, cancelled) = tokio::join!(verifier, canceller);
        let verified = verified.unwrap();
        let cancelled = cancelled.unwrap();

        // Exactly one side wins
        assert!(verified.is_ok() != cancelled.is_ok(), "{verified:?} / {cancelled:?}");

        let settled = race.assert_settled(order.id).await;
        if verified.is_ok() {
            assert_eq!(settled.state(), (OrderStatus::Paid, TicketStatus::Used));
            assert_eq!(
                cancelled.unwrap_err(),
                BookingError::AlreadyConsumed { order_id: order.id }
            );
        } else {
            assert_eq!(settled.state(), (OrderStatus::Cancelled, TicketStatus::Refunded));
            assert!(matches!(
                verified.unwrap_err(),
                BookingError::InvalidStateTransition { .. }
            ));
        }
    }
}
