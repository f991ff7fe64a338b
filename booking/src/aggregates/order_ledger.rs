//! Order ledger aggregate.
//!
//! Owns every order and its `(OrderStatus, TicketStatus)` state machine:
//!
//! ```text
//! {Pending, Unissued} ──MarkPaid──▶ {Paid, Issued} ──MarkUsed──▶ {Paid, Used}
//!        │                               │
//!        │ Cancel / Expire / FailPayment │ Refund
//!        ▼                               ▼
//! {Cancelled, Unissued}           {Cancelled, Refunded}
//! ```
//!
//! Cancelled and used orders never change again. A second cancel or expiry of
//! a cancelled order reports the order unchanged instead of failing.

use crate::aggregates::{RecordsOutcome, journal_events};
use crate::error::{BookingError, BookingResult};
use crate::events::BookingEvent;
use crate::types::{
    Money, Order, OrderId, OrderStatus, PaymentMethod, PurchaseSource, RefundRecord, Screening,
    SeatLockHandle, SeatLockId, TicketStatus, UserId,
};
use chrono::{DateTime, Utc};
use cinema_core::{
    SmallVec, effect::Effect, environment::Clock, journal::EventJournal, reducer::Reducer,
    stream::StreamId,
};
use cinema_runtime::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the order ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OrderAction {
    // Commands
    /// Create a pending order over a claimed seat lock
    PlaceOrder {
        /// New order ID
        order_id: OrderId,
        /// Customer
        user_id: UserId,
        /// Screening snapshot
        screening: Box<Screening>,
        /// Seat lock backing the order
        lock: SeatLockHandle,
        /// Chosen payment method
        payment_method: PaymentMethod,
        /// Price per seat
        unit_price: Money,
        /// Regular purchase or group redemption
        source: PurchaseSource,
    },

    /// Record a successful payment
    MarkPaid {
        /// Order
        order_id: OrderId,
        /// Method actually used
        payment_method: PaymentMethod,
        /// Gateway transaction
        payment_reference: Option<String>,
    },

    /// Cancel a pending order whose payment could not complete
    FailPayment {
        /// Order
        order_id: OrderId,
        /// What went wrong
        reason: String,
    },

    /// Cancel a pending order
    Cancel {
        /// Order
        order_id: OrderId,
    },

    /// Cancel a pending order if its payment deadline has passed
    Expire {
        /// Order
        order_id: OrderId,
    },

    /// Cancel a paid, unused order and mark its tickets refunded
    Refund {
        /// Order
        order_id: OrderId,
    },

    /// Attach the refund record of a refunded order
    RecordRefund {
        /// Refund record
        refund: RefundRecord,
    },

    /// Mark the tickets of a paid order as used
    MarkUsed {
        /// Order
        order_id: OrderId,
    },

    // Events
    /// Order created
    OrderPlaced {
        /// The new order
        order: Box<Order>,
    },

    /// Order paid and tickets issued
    OrderPaid {
        /// Order
        order_id: OrderId,
        /// Method used
        payment_method: PaymentMethod,
        /// Gateway transaction
        payment_reference: Option<String>,
        /// When
        paid_at: DateTime<Utc>,
    },

    /// Pending order cancelled
    OrderCancelled {
        /// Order
        order_id: OrderId,
        /// Why
        reason: CancelReason,
        /// When
        cancelled_at: DateTime<Utc>,
    },

    /// Paid order cancelled with refund
    OrderRefunded {
        /// Order
        order_id: OrderId,
        /// When
        cancelled_at: DateTime<Utc>,
    },

    /// Refund record stored
    RefundRecorded {
        /// Record
        refund: RefundRecord,
    },

    /// Tickets used at the entrance
    OrderUsed {
        /// Order
        order_id: OrderId,
        /// When
        used_at: DateTime<Utc>,
    },

    /// Journal append failed
    JournalWriteFailed {
        /// Journal error
        error: String,
    },
}

impl OrderAction {
    /// Versioned journal name of an event
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::OrderPlaced { .. } => "OrderPlaced.v1",
            Self::OrderPaid { .. } => "OrderPaid.v1",
            Self::OrderCancelled { .. } => "OrderCancelled.v1",
            Self::OrderRefunded { .. } => "OrderRefunded.v1",
            Self::RefundRecorded { .. } => "RefundRecorded.v1",
            Self::OrderUsed { .. } => "OrderUsed.v1",
            Self::JournalWriteFailed { .. } => "OrderJournalWriteFailed.v1",
            Self::PlaceOrder { .. }
            | Self::MarkPaid { .. }
            | Self::FailPayment { .. }
            | Self::Cancel { .. }
            | Self::Expire { .. }
            | Self::Refund { .. }
            | Self::RecordRefund { .. }
            | Self::MarkUsed { .. } => "OrderCommand",
        }
    }
}

/// Why a pending order was cancelled
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// Customer cancelled
    Customer,
    /// Payment deadline passed
    Expired,
    /// Payment could not complete
    PaymentFailed {
        /// Failure reason
        reason: String,
    },
}

// ============================================================================
// State
// ============================================================================

/// Result of a successful order command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderOutcome {
    /// Order after the command
    pub order: Order,
    /// Whether the command changed the order
    pub changed: bool,
}

/// State of the order ledger
#[derive(Clone, Debug, Default)]
pub struct OrderLedgerState {
    /// Every order
    pub orders: HashMap<OrderId, Order>,
    /// Orders of each customer, in creation order
    pub by_user: HashMap<UserId, Vec<OrderId>>,
    /// Order created from each seat lock
    pub lock_owners: HashMap<SeatLockId, OrderId>,
    /// Refund records per order
    pub refunds: HashMap<OrderId, Vec<RefundRecord>>,
    /// Journal appends that failed
    pub journal_failures: u32,
    /// Outcome of the last command
    pub last_outcome: Option<BookingResult<OrderOutcome>>,
}

impl OrderLedgerState {
    /// Creates an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an order
    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    /// Orders of a customer, oldest first
    #[must_use]
    pub fn orders_for_user(&self, user_id: UserId) -> Vec<Order> {
        self.by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.orders.get(id))
            .cloned()
            .collect()
    }

    /// Refund records of an order
    #[must_use]
    pub fn refunds_for(&self, order_id: OrderId) -> Vec<RefundRecord> {
        self.refunds.get(&order_id).cloned().unwrap_or_default()
    }

    /// Pending orders whose payment deadline has passed
    #[must_use]
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<(OrderId, SeatLockHandle)> {
        let mut overdue: Vec<(OrderId, SeatLockHandle)> = self
            .orders
            .values()
            .filter(|order| order.is_pending() && order.payment_deadline <= now)
            .map(|order| (order.id, order.lock.clone()))
            .collect();
        overdue.sort_by_key(|(id, _)| *id);
        overdue
    }
}

impl RecordsOutcome for OrderLedgerState {
    type Outcome = OrderOutcome;

    fn last_outcome(&self) -> Option<BookingResult<OrderOutcome>> {
        self.last_outcome.clone()
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the order ledger
#[derive(Clone)]
pub struct OrderLedgerEnvironment {
    /// Clock for deadlines
    pub clock: Arc<dyn Clock>,
    /// Audit journal
    pub journal: Arc<dyn EventJournal>,
    /// Ledger stream
    pub stream_id: StreamId,
    /// Time an order may stay unpaid
    pub payment_timeout: chrono::Duration,
    /// Paid orders can't be refunded within this long before the screening
    pub refund_cutoff: chrono::Duration,
}

/// Store running the order ledger
pub type OrderLedgerStore =
    Store<OrderLedgerState, OrderAction, OrderLedgerEnvironment, OrderLedgerReducer>;

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the order ledger
#[derive(Clone, Debug, Default)]
pub struct OrderLedgerReducer;

type Effects = SmallVec<[Effect<OrderAction>; 4]>;

impl OrderLedgerReducer {
    /// Creates a new `OrderLedgerReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn reject(state: &mut OrderLedgerState, error: BookingError) -> Effects {
        tracing::debug!(%error, "Order command rejected");
        state.last_outcome = Some(Err(error));
        SmallVec::new()
    }

    fn unchanged(state: &mut OrderLedgerState, order: Order) -> Effects {
        state.last_outcome = Some(Ok(OrderOutcome {
            order,
            changed: false,
        }));
        SmallVec::new()
    }

    /// Applies `event`, records the updated order and journals the event
    fn commit(
        state: &mut OrderLedgerState,
        order_id: OrderId,
        event: OrderAction,
        env: &OrderLedgerEnvironment,
    ) -> Effects {
        Self::apply_event(state, &event);
        state.last_outcome = Some(
            state
                .orders
                .get(&order_id)
                .cloned()
                .map(|order| OrderOutcome {
                    order,
                    changed: true,
                })
                .ok_or_else(|| BookingError::not_found("order", order_id)),
        );
        journal_events(
            vec![BookingEvent::Order(event)],
            &env.journal,
            &env.stream_id,
            |error| OrderAction::JournalWriteFailed { error },
        )
    }

    pub(crate) fn invalid(order: &Order, attempted: &'static str) -> BookingError {
        BookingError::InvalidStateTransition {
            entity: "order",
            id: order.id.to_string(),
            from: format!("{{{}, {}}}", order.status, order.ticket_status),
            attempted,
        }
    }

    fn order_number(order_id: OrderId, now: DateTime<Utc>) -> String {
        let suffix: String = order_id
            .as_uuid()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        format!("ORD{}{}", now.timestamp_millis(), suffix.to_uppercase())
    }

    #[allow(clippy::too_many_arguments)] // mirrors the PlaceOrder command
    fn place_order(
        state: &mut OrderLedgerState,
        order_id: OrderId,
        user_id: UserId,
        screening: &Screening,
        lock: SeatLockHandle,
        payment_method: PaymentMethod,
        unit_price: Money,
        source: PurchaseSource,
        env: &OrderLedgerEnvironment,
    ) -> Effects {
        let now = env.clock.now();

        if state.orders.contains_key(&order_id) {
            return Self::reject(
                state,
                BookingError::InvalidStateTransition {
                    entity: "order",
                    id: order_id.to_string(),
                    from: "Created".to_string(),
                    attempted: "create",
                },
            );
        }
        if state.lock_owners.contains_key(&lock.lock_id()) {
            return Self::reject(
                state,
                BookingError::HandleAlreadyConsumed {
                    lock_id: lock.lock_id(),
                },
            );
        }
        if lock.expires_at() <= now {
            return Self::reject(
                state,
                BookingError::LockExpired {
                    lock_id: lock.lock_id(),
                },
            );
        }
        if lock.screening_id() != screening.id {
            return Self::reject(
                state,
                BookingError::InvalidSeatSelection(
                    "seat lock belongs to another screening".to_string(),
                ),
            );
        }
        let group_source = matches!(source, PurchaseSource::GroupTicket { .. });
        if group_source != (payment_method == PaymentMethod::GroupTicket) {
            return Self::reject(
                state,
                BookingError::PaymentFailed {
                    reason: format!("{payment_method} payment does not match the order source"),
                },
            );
        }

        let Some(amount) = unit_price.checked_mul(lock.seats().len() as u64) else {
            return Self::reject(
                state,
                BookingError::InvalidSeatSelection("order amount overflows".to_string()),
            );
        };
        let Some(payment_deadline) = now.checked_add_signed(env.payment_timeout) else {
            return Self::reject(
                state,
                BookingError::InvalidConfig("payment timeout out of range".to_string()),
            );
        };

        let order = Order {
            id: order_id,
            order_number: Self::order_number(order_id, now),
            user_id,
            screening_id: screening.id,
            cinema_id: screening.cinema_id,
            screening_starts_at: screening.starts_at,
            seats: lock.seats().to_vec(),
            lock,
            source,
            payment_method,
            amount,
            status: OrderStatus::Pending,
            ticket_status: TicketStatus::Unissued,
            created_at: now,
            payment_deadline,
            paid_at: None,
            cancelled_at: None,
            payment_reference: None,
        };

        tracing::debug!(
            %order_id,
            order_number = %order.order_number,
            amount = %order.amount,
            seats = order.seats.len(),
            "Order placed"
        );

        Self::commit(
            state,
            order_id,
            OrderAction::OrderPlaced {
                order: Box::new(order),
            },
            env,
        )
    }

    fn cancel_pending(
        state: &mut OrderLedgerState,
        order: Order,
        reason: CancelReason,
        env: &OrderLedgerEnvironment,
    ) -> Effects {
        match order.state() {
            (OrderStatus::Pending, _) => Self::commit(
                state,
                order.id,
                OrderAction::OrderCancelled {
                    order_id: order.id,
                    reason,
                    cancelled_at: env.clock.now(),
                },
                env,
            ),
            (OrderStatus::Cancelled, _) => Self::unchanged(state, order),
            (OrderStatus::Paid, TicketStatus::Used) => {
                Self::reject(state, BookingError::AlreadyConsumed { order_id: order.id })
            },
            (OrderStatus::Paid, _) => Self::reject(state, Self::invalid(&order, "cancel without refund")),
        }
    }

    fn refund(
        state: &mut OrderLedgerState,
        order: Order,
        env: &OrderLedgerEnvironment,
    ) -> Effects {
        let now = env.clock.now();
        match order.state() {
            (OrderStatus::Paid, TicketStatus::Issued) => {
                let closes_at = order
                    .screening_starts_at
                    .checked_sub_signed(env.refund_cutoff)
                    .unwrap_or(order.screening_starts_at);
                if now >= closes_at {
                    return Self::reject(
                        state,
                        BookingError::RefundWindowClosed { order_id: order.id },
                    );
                }
                Self::commit(
                    state,
                    order.id,
                    OrderAction::OrderRefunded {
                        order_id: order.id,
                        cancelled_at: now,
                    },
                    env,
                )
            },
            (OrderStatus::Paid, TicketStatus::Used) => {
                Self::reject(state, BookingError::AlreadyConsumed { order_id: order.id })
            },
            (OrderStatus::Cancelled, _) => Self::unchanged(state, order),
            _ => Self::reject(state, Self::invalid(&order, "refund")),
        }
    }

    fn record_refund(
        state: &mut OrderLedgerState,
        refund: RefundRecord,
        env: &OrderLedgerEnvironment,
    ) -> Effects {
        let Some(order) = state.orders.get(&refund.order_id).cloned() else {
            return Self::reject(state, BookingError::not_found("order", refund.order_id));
        };
        if order.state() != (OrderStatus::Cancelled, TicketStatus::Refunded)
            || state.refunds.contains_key(&order.id)
            || refund.amount > order.amount
        {
            return Self::reject(state, Self::invalid(&order, "record refund"));
        }

        Self::commit(state, order.id, OrderAction::RefundRecorded { refund }, env)
    }

    /// Applies an event to state
    fn apply_event(state: &mut OrderLedgerState, action: &OrderAction) {
        match action {
            OrderAction::OrderPlaced { order } => {
                state.lock_owners.insert(order.lock.lock_id(), order.id);
                state.by_user.entry(order.user_id).or_default().push(order.id);
                state.orders.insert(order.id, (**order).clone());
            },

            OrderAction::OrderPaid {
                order_id,
                payment_method,
                payment_reference,
                paid_at,
            } => {
                if let Some(order) = state.orders.get_mut(order_id) {
                    order.status = OrderStatus::Paid;
                    order.ticket_status = TicketStatus::Issued;
                    order.payment_method = *payment_method;
                    order.payment_reference.clone_from(payment_reference);
                    order.paid_at = Some(*paid_at);
                }
            },

            OrderAction::OrderCancelled {
                order_id,
                cancelled_at,
                ..
            } => {
                if let Some(order) = state.orders.get_mut(order_id) {
                    order.status = OrderStatus::Cancelled;
                    order.cancelled_at = Some(*cancelled_at);
                }
            },

            OrderAction::OrderRefunded {
                order_id,
                cancelled_at,
            } => {
                if let Some(order) = state.orders.get_mut(order_id) {
                    order.status = OrderStatus::Cancelled;
                    order.ticket_status = TicketStatus::Refunded;
                    order.cancelled_at = Some(*cancelled_at);
                }
            },

            OrderAction::RefundRecorded { refund } => {
                state
                    .refunds
                    .entry(refund.order_id)
                    .or_default()
                    .push(refund.clone());
            },

            OrderAction::OrderUsed { order_id, .. } => {
                if let Some(order) = state.orders.get_mut(order_id) {
                    order.ticket_status = TicketStatus::Used;
                }
            },

            OrderAction::JournalWriteFailed { error } => {
                state.journal_failures += 1;
                tracing::warn!(%error, "Order journal write failed");
            },

            // Commands don't modify state
            OrderAction::PlaceOrder { .. }
            | OrderAction::MarkPaid { .. }
            | OrderAction::FailPayment { .. }
            | OrderAction::Cancel { .. }
            | OrderAction::Expire { .. }
            | OrderAction::Refund { .. }
            | OrderAction::RecordRefund { .. }
            | OrderAction::MarkUsed { .. } => {},
        }
    }
}

impl Reducer for OrderLedgerReducer {
    type State = OrderLedgerState;
    type Action = OrderAction;
    type Environment = OrderLedgerEnvironment;

    #[allow(clippy::too_many_lines)] // one arm per command
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        // Every command except PlaceOrder and RecordRefund targets an existing order
        let target = match &action {
            OrderAction::MarkPaid { order_id, .. }
            | OrderAction::FailPayment { order_id, .. }
            | OrderAction::Cancel { order_id }
            | OrderAction::Expire { order_id }
            | OrderAction::Refund { order_id }
            | OrderAction::MarkUsed { order_id } => Some(*order_id),
            _ => None,
        };
        let order = match target {
            Some(order_id) => match state.orders.get(&order_id) {
                Some(order) => Some(order.clone()),
                None => return Self::reject(state, BookingError::not_found("order", order_id)),
            },
            None => None,
        };

        match (action, order) {
            // ========== Commands ==========
            (
                OrderAction::PlaceOrder {
                    order_id,
                    user_id,
                    screening,
                    lock,
                    payment_method,
                    unit_price,
                    source,
                },
                _,
            ) => Self::place_order(
                state,
                order_id,
                user_id,
                &screening,
                lock,
                payment_method,
                unit_price,
                source,
                env,
            ),

            (
                OrderAction::MarkPaid {
                    order_id,
                    payment_method,
                    payment_reference,
                },
                Some(order),
            ) => {
                if !order.is_pending() {
                    return Self::reject(state, Self::invalid(&order, "pay"));
                }
                tracing::info!(%order_id, amount = %order.amount, %payment_method, "Order paid");
                Self::commit(
                    state,
                    order_id,
                    OrderAction::OrderPaid {
                        order_id,
                        payment_method,
                        payment_reference,
                        paid_at: env.clock.now(),
                    },
                    env,
                )
            },

            (OrderAction::FailPayment { reason, .. }, Some(order)) => {
                if !order.is_pending() {
                    return Self::reject(state, Self::invalid(&order, "fail payment of"));
                }
                Self::cancel_pending(state, order, CancelReason::PaymentFailed { reason }, env)
            },

            (OrderAction::Cancel { .. }, Some(order)) => {
                Self::cancel_pending(state, order, CancelReason::Customer, env)
            },

            (OrderAction::Expire { .. }, Some(order)) => {
                if order.is_pending() && order.payment_deadline <= env.clock.now() {
                    Self::cancel_pending(state, order, CancelReason::Expired, env)
                } else {
                    Self::unchanged(state, order)
                }
            },

            (OrderAction::Refund { .. }, Some(order)) => Self::refund(state, order, env),

            (OrderAction::RecordRefund { refund }, _) => Self::record_refund(state, refund, env),

            (OrderAction::MarkUsed { order_id }, Some(order)) => {
                if order.state() != (OrderStatus::Paid, TicketStatus::Issued) {
                    return Self::reject(state, Self::invalid(&order, "use"));
                }
                Self::commit(
                    state,
                    order_id,
                    OrderAction::OrderUsed {
                        order_id,
                        used_at: env.clock.now(),
                    },
                    env,
                )
            },

            // ========== Events ==========
            (event, _) => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CinemaId, HallId, MovieId, RefundId, RefundStatus, ScreeningId, SeatRef};
    use cinema_runtime::InMemoryJournal;
    use cinema_testing::{ManualClock, ReducerTest, assertions, test_clock};

    struct Fixture {
        clock: ManualClock,
        env: OrderLedgerEnvironment,
        screening: Screening,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::starting_at(test_clock().now());
            let env = OrderLedgerEnvironment {
                clock: Arc::new(clock.clone()),
                journal: Arc::new(InMemoryJournal::new()),
                stream_id: StreamId::new("orders"),
                payment_timeout: chrono::Duration::minutes(30),
                refund_cutoff: chrono::Duration::minutes(120),
            };
            let screening = Screening {
                id: ScreeningId::new(),
                movie_id: MovieId::new(),
                cinema_id: CinemaId::new(),
                hall_id: HallId::new(),
                starts_at: test_clock().now() + chrono::Duration::hours(5),
                ticket_price: Money::from_cents(4_000),
                rows: 5,
                cols: 5,
            };
            Self {
                clock,
                env,
                screening,
            }
        }

        fn place(&self, order_id: OrderId, lock_id: SeatLockId) -> OrderAction {
            OrderAction::PlaceOrder {
                order_id,
                user_id: UserId::new(),
                screening: Box::new(self.screening.clone()),
                lock: SeatLockHandle::new(
                    lock_id,
                    self.screening.id,
                    vec![SeatRef::new(1, 1), SeatRef::new(1, 2)],
                    self.clock.now() + chrono::Duration::minutes(15),
                ),
                payment_method: PaymentMethod::WeChatPay,
                unit_price: self.screening.ticket_price,
                source: PurchaseSource::Regular,
            }
        }

        fn paid_state(&self, order_id: OrderId) -> OrderLedgerState {
            let mut state = OrderLedgerState::new();
            for action in [
                self.place(order_id, SeatLockId::new()),
                OrderAction::MarkPaid {
                    order_id,
                    payment_method: PaymentMethod::WeChatPay,
                    payment_reference: Some("txn-1".to_string()),
                },
            ] {
                let _ = OrderLedgerReducer.reduce(&mut state, action, &self.env);
            }
            state
        }
    }

    fn order_of(state: &OrderLedgerState) -> Order {
        state.last_outcome.clone().unwrap().unwrap().order
    }

    #[test]
    fn placed_order_is_pending_with_fixed_amount() {
        let fx = Fixture::new();
        let order_id = OrderId::new();

        ReducerTest::new(OrderLedgerReducer)
            .with_env(fx.env.clone())
            .given_state(OrderLedgerState::new())
            .when_action(fx.place(order_id, SeatLockId::new()))
            .then_state(move |state| {
                let order = order_of(state);
                assert!(order.is_pending());
                assert_eq!(order.amount, Money::from_cents(8_000));
                assert!(order.order_number.starts_with("ORD"));
                assert_eq!(order.order_number.len(), 3 + 13 + 8);
                assert_eq!(
                    order.payment_deadline,
                    test_clock().now() + chrono::Duration::minutes(30)
                );
            })
            .then_effects(|effects| assertions::assert_journaled(effects, &["OrderPlaced.v1"]))
            .run();
    }

    #[test]
    fn reused_lock_is_rejected() {
        let fx = Fixture::new();
        let lock_id = SeatLockId::new();

        ReducerTest::new(OrderLedgerReducer)
            .with_env(fx.env.clone())
            .given_state(OrderLedgerState::new())
            .given_actions(vec![fx.place(OrderId::new(), lock_id)])
            .when_action(fx.place(OrderId::new(), lock_id))
            .then_state(move |state| {
                assert_eq!(
                    state.last_outcome,
                    Some(Err(BookingError::HandleAlreadyConsumed { lock_id }))
                );
                assert_eq!(state.orders.len(), 1);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn expired_lock_cannot_back_an_order() {
        let fx = Fixture::new();
        let lock_id = SeatLockId::new();
        let action = fx.place(OrderId::new(), lock_id);
        fx.clock.advance(chrono::Duration::minutes(15));

        ReducerTest::new(OrderLedgerReducer)
            .with_env(fx.env.clone())
            .given_state(OrderLedgerState::new())
            .when_action(action)
            .then_state(move |state| {
                assert_eq!(
                    state.last_outcome,
                    Some(Err(BookingError::LockExpired { lock_id }))
                );
            })
            .run();
    }

    #[test]
    fn paid_order_is_issued() {
        let fx = Fixture::new();
        let order_id = OrderId::new();
        let state = fx.paid_state(order_id);

        let order = order_of(&state);
        assert_eq!(order.state(), (OrderStatus::Paid, TicketStatus::Issued));
        assert_eq!(order.payment_reference.as_deref(), Some("txn-1"));
        assert!(order.paid_at.is_some());
    }

    #[test]
    fn cancel_twice_returns_same_terminal_state() {
        let fx = Fixture::new();
        let order_id = OrderId::new();
        let mut state = OrderLedgerState::new();

        let _ = OrderLedgerReducer.reduce(&mut state, fx.place(order_id, SeatLockId::new()), &fx.env);
        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::Cancel { order_id }, &fx.env);
        let first = state.last_outcome.clone().unwrap().unwrap();
        let effects = OrderLedgerReducer.reduce(&mut state, OrderAction::Cancel { order_id }, &fx.env);
        let second = state.last_outcome.clone().unwrap().unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(first.order, second.order);
        assert_eq!(second.order.state(), (OrderStatus::Cancelled, TicketStatus::Unissued));
        assertions::assert_no_effects(&effects);
    }

    #[test]
    fn expire_waits_for_deadline_and_skips_paid_orders() {
        let fx = Fixture::new();
        let pending = OrderId::new();
        let mut state = fx.paid_state(OrderId::new());
        let paid = *state.orders.keys().next().unwrap();
        let _ = OrderLedgerReducer.reduce(&mut state, fx.place(pending, SeatLockId::new()), &fx.env);

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::Expire { order_id: pending }, &fx.env);
        assert!(!state.last_outcome.clone().unwrap().unwrap().changed);

        fx.clock.advance(chrono::Duration::minutes(31));
        assert_eq!(state.overdue(fx.clock.now()).len(), 1);

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::Expire { order_id: pending }, &fx.env);
        assert_eq!(order_of(&state).status, OrderStatus::Cancelled);

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::Expire { order_id: paid }, &fx.env);
        assert_eq!(order_of(&state).status, OrderStatus::Paid);
    }

    #[test]
    fn refund_respects_cutoff() {
        let fx = Fixture::new();
        let order_id = OrderId::new();
        let state = fx.paid_state(order_id);
        fx.clock.advance(chrono::Duration::hours(3) + chrono::Duration::minutes(1));

        ReducerTest::new(OrderLedgerReducer)
            .with_env(fx.env.clone())
            .given_state(state)
            .when_action(OrderAction::Refund { order_id })
            .then_state(move |state| {
                assert_eq!(
                    state.last_outcome,
                    Some(Err(BookingError::RefundWindowClosed { order_id }))
                );
            })
            .run();
    }

    #[test]
    fn refund_then_record() {
        let fx = Fixture::new();
        let order_id = OrderId::new();
        let mut state = fx.paid_state(order_id);

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::Refund { order_id }, &fx.env);
        let order = order_of(&state);
        assert_eq!(order.state(), (OrderStatus::Cancelled, TicketStatus::Refunded));

        let refund = RefundRecord {
            id: RefundId::new(),
            order_id,
            amount: order.amount,
            method: order.payment_method,
            status: RefundStatus::Completed,
            gateway_reference: Some("refund-1".to_string()),
            created_at: fx.clock.now(),
        };
        let effects = OrderLedgerReducer.reduce(
            &mut state,
            OrderAction::RecordRefund {
                refund: refund.clone(),
            },
            &fx.env,
        );
        assertions::assert_journaled(&effects, &["RefundRecorded.v1"]);
        assert_eq!(state.refunds_for(order_id), vec![refund.clone()]);

        // Records are immutable once written
        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::RecordRefund { refund }, &fx.env);
        assert!(matches!(
            state.last_outcome,
            Some(Err(BookingError::InvalidStateTransition { .. }))
        ));
    }

    #[test]
    fn used_order_cannot_be_cancelled_or_used_again() {
        let fx = Fixture::new();
        let order_id = OrderId::new();
        let mut state = fx.paid_state(order_id);

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::MarkUsed { order_id }, &fx.env);
        assert_eq!(order_of(&state).ticket_status, TicketStatus::Used);

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::Refund { order_id }, &fx.env);
        assert_eq!(
            state.last_outcome,
            Some(Err(BookingError::AlreadyConsumed { order_id }))
        );

        let _ = OrderLedgerReducer.reduce(&mut state, OrderAction::MarkUsed { order_id }, &fx.env);
        assert!(matches!(
            state.last_outcome,
            Some(Err(BookingError::InvalidStateTransition { .. }))
        ));
    }

    #[test]
    fn unknown_order_is_not_found() {
        let fx = Fixture::new();

        ReducerTest::new(OrderLedgerReducer)
            .with_env(fx.env)
            .given_state(OrderLedgerState::new())
            .when_action(OrderAction::Cancel {
                order_id: OrderId::new(),
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_outcome,
                    Some(Err(BookingError::NotFound { entity: "order", .. }))
                ));
            })
            .run();
    }
}
