//! Booking core - the operations callers use.
//!
//! `BookingCore` owns one store per screening, one per group ticket type,
//! and single stores for the order ledger, verification tickets and
//! memberships. Each store serializes the commands sent to it. Operations
//! that touch several stores for one order (pay, cancel, verify, expiry)
//! also hold that order's guard, so they are linearized against each other.

use crate::aggregates::group_ticket::{GroupTicketEnvironment, GroupTicketOutcome, GroupTicketStore};
use crate::aggregates::membership::{MembershipEnvironment, MembershipStore};
use crate::aggregates::order_ledger::{OrderLedgerEnvironment, OrderLedgerStore, OrderOutcome};
use crate::aggregates::seat_inventory::{
    InventoryOutcome, SeatInventoryEnvironment, SeatInventoryStore,
};
use crate::aggregates::verification::{
    VerificationEnvironment, VerificationOutcome, VerificationStore,
};
use crate::aggregates::{
    GroupTicketAction, GroupTicketReducer, GroupTicketState, MembershipAction, MembershipReducer,
    MembershipState, OrderAction, OrderLedgerReducer, OrderLedgerState, SeatInventoryAction,
    SeatInventoryReducer, SeatInventoryState, VerificationAction, VerificationReducer,
    VerificationState, dispatch,
};
use crate::app::registry::{KeyedLocks, StoreRegistry};
use crate::codes::RandomCodeGenerator;
use crate::config::BookingConfig;
use crate::error::{BookingError, BookingResult};
use crate::metrics;
use crate::payment_gateway::{MockPaymentGateway, PaymentGateway, PaymentTransaction};
use crate::types::{
    CinemaId, GroupTicketType, GroupTicketTypeId, Membership, Money, Order, OrderId, OrderStatus,
    PaymentMethod, PurchaseSource, PurchasedGroupTicket, PurchasedTicketId, RefundId,
    RefundRecord, RefundStatus, Screening, ScreeningId, SeatCounts, SeatLockHandle, SeatLockId,
    SeatMap, SeatRef, UserId, VerificationCode, VerificationTicket, VerifiedSeat,
};
use cinema_core::environment::{Clock, CodeGenerator, SystemClock};
use cinema_core::journal::EventJournal;
use cinema_core::stream::StreamId;
use cinema_runtime::InMemoryJournal;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Stream of one screening's seat inventory
fn screening_stream(screening_id: ScreeningId) -> StreamId {
    StreamId::new(format!("screening-{screening_id}"))
}

/// Stream of one group ticket type
fn group_ticket_stream(type_id: GroupTicketTypeId) -> StreamId {
    StreamId::new(format!("group-ticket-{type_id}"))
}

fn unexpected(outcome: &impl Debug) -> BookingError {
    BookingError::Storage(format!("unexpected outcome {outcome:?}"))
}

/// Builder for [`BookingCore`]
///
/// Unset collaborators fall back to the system clock, an in-memory journal,
/// the mock payment gateway and random verification codes.
#[derive(Default)]
pub struct BookingCoreBuilder {
    config: Option<BookingConfig>,
    clock: Option<Arc<dyn Clock>>,
    journal: Option<Arc<dyn EventJournal>>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    codes: Option<Arc<dyn CodeGenerator>>,
}

impl BookingCoreBuilder {
    /// Configuration (defaults otherwise)
    #[must_use]
    pub fn config(mut self, config: BookingConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Clock for every deadline
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Event journal
    #[must_use]
    pub fn journal(mut self, journal: Arc<dyn EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Payment gateway
    #[must_use]
    pub fn gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Verification code source
    #[must_use]
    pub fn codes(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = Some(codes);
        self
    }

    /// Validates the configuration and wires the stores.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::InvalidConfig`] if a setting is out of range.
    pub fn build(self) -> BookingResult<BookingCore> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(InMemoryJournal::new()));
        let gateway = self.gateway.unwrap_or_else(MockPaymentGateway::shared);
        let codes = self.codes.unwrap_or_else(|| {
            Arc::new(RandomCodeGenerator::new(config.verification.code_length))
        });

        let orders = OrderLedgerStore::new(
            OrderLedgerState::new(),
            OrderLedgerReducer::new(),
            OrderLedgerEnvironment {
                clock: Arc::clone(&clock),
                journal: Arc::clone(&journal),
                stream_id: StreamId::new("orders"),
                payment_timeout: config.payment_timeout(),
                refund_cutoff: config.refund_cutoff(),
            },
        );
        let verification = VerificationStore::new(
            VerificationState::new(),
            VerificationReducer::new(),
            VerificationEnvironment {
                clock: Arc::clone(&clock),
                journal: Arc::clone(&journal),
                stream_id: StreamId::new("verification-tickets"),
                codes,
            },
        );
        let memberships = MembershipStore::new(
            MembershipState::new(),
            MembershipReducer::new(),
            MembershipEnvironment {
                clock: Arc::clone(&clock),
                journal: Arc::clone(&journal),
                stream_id: StreamId::new("memberships"),
            },
        );

        tracing::info!(
            hold_minutes = config.seats.hold_minutes,
            payment_timeout_minutes = config.orders.payment_timeout_minutes,
            "Booking core ready"
        );

        Ok(BookingCore {
            config,
            clock,
            journal,
            gateway,
            screenings: StoreRegistry::new(),
            group_tickets: StoreRegistry::new(),
            orders,
            verification,
            memberships,
            order_locks: KeyedLocks::new(),
        })
    }
}

/// Entry point of the booking core
pub struct BookingCore {
    config: BookingConfig,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn EventJournal>,
    gateway: Arc<dyn PaymentGateway>,
    screenings: StoreRegistry<ScreeningId, SeatInventoryStore>,
    group_tickets: StoreRegistry<GroupTicketTypeId, GroupTicketStore>,
    orders: OrderLedgerStore,
    verification: VerificationStore,
    memberships: MembershipStore,
    order_locks: KeyedLocks<OrderId>,
}

impl BookingCore {
    /// Start building a booking core
    #[must_use]
    pub fn builder() -> BookingCoreBuilder {
        BookingCoreBuilder::default()
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &BookingConfig {
        &self.config
    }

    // ========================================================================
    // Screenings and seats
    // ========================================================================

    /// Put a screening on sale with every seat available.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidStateTransition`] if the screening is already
    /// scheduled, [`BookingError::InvalidSeatSelection`] for an empty hall.
    #[tracing::instrument(skip(self, screening), fields(screening_id = %screening.id))]
    pub async fn schedule_screening(&self, screening: Screening) -> BookingResult<SeatCounts> {
        let screening_id = screening.id;
        let created = self
            .screenings
            .insert_new(screening_id, || {
                SeatInventoryStore::new(
                    SeatInventoryState::new(),
                    SeatInventoryReducer::new(),
                    SeatInventoryEnvironment::new(
                        Arc::clone(&self.clock),
                        Arc::clone(&self.journal),
                        screening_stream(screening_id),
                        self.config.seats.max_seats_per_order,
                    ),
                )
            })
            .await;
        let Some(store) = created else {
            return Err(BookingError::InvalidStateTransition {
                entity: "screening",
                id: screening_id.to_string(),
                from: "Scheduled".to_string(),
                attempted: "schedule",
            });
        };

        if let Err(error) =
            dispatch(&*store, SeatInventoryAction::InitializeScreening { screening }).await
        {
            self.screenings.remove(&screening_id).await;
            return Err(error);
        }
        Ok(store.state(SeatInventoryState::counts).await)
    }

    /// Lock seats for `hold`.
    ///
    /// All requested seats are locked, or none are.
    ///
    /// # Errors
    ///
    /// [`BookingError::SeatConflict`] naming the seats that are taken,
    /// [`BookingError::InvalidSeatSelection`] for a malformed selection, or
    /// [`BookingError::NotFound`] for an unknown screening.
    #[tracing::instrument(skip(self, seats), fields(seats = seats.len()))]
    pub async fn lock_seats(
        &self,
        screening_id: ScreeningId,
        seats: Vec<SeatRef>,
        hold: Duration,
    ) -> BookingResult<SeatLockHandle> {
        let store = self.screening(screening_id).await?;
        let requested = seats.len();

        let result = dispatch(
            &*store,
            SeatInventoryAction::LockSeats {
                lock_id: SeatLockId::new(),
                seats,
                hold_seconds: hold.as_secs(),
            },
        )
        .await;

        match result {
            Ok(InventoryOutcome::Locked(handle)) => {
                metrics::record_seat_lock("granted", requested);
                tracing::debug!(lock_id = %handle.lock_id(), expires_at = %handle.expires_at(), "Seats locked");
                Ok(handle)
            },
            Ok(other) => Err(unexpected(&other)),
            Err(error) => {
                let outcome = if matches!(error, BookingError::SeatConflict { .. }) {
                    "conflict"
                } else {
                    "rejected"
                };
                metrics::record_seat_lock(outcome, requested);
                tracing::debug!(%error, "Seat lock refused");
                Err(error)
            },
        }
    }

    /// Lock seats for the configured hold
    ///
    /// # Errors
    ///
    /// Same as [`BookingCore::lock_seats`].
    pub async fn lock_seats_default(
        &self,
        screening_id: ScreeningId,
        seats: Vec<SeatRef>,
    ) -> BookingResult<SeatLockHandle> {
        self.lock_seats(screening_id, seats, self.config.seat_hold())
            .await
    }

    /// Give back a hold that no order uses. Releasing twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidStateTransition`] if an order owns the lock;
    /// cancel the order instead.
    pub async fn release_lock(&self, handle: &SeatLockHandle) -> BookingResult<()> {
        let store = self.screening(handle.screening_id()).await?;
        match dispatch(
            &*store,
            SeatInventoryAction::AbandonLock {
                lock_id: handle.lock_id(),
            },
        )
        .await?
        {
            InventoryOutcome::Released { .. } | InventoryOutcome::AlreadyReleased => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Turn a seat lock into a pending order.
    ///
    /// # Errors
    ///
    /// [`BookingError::LockExpired`] if the hold has lapsed,
    /// [`BookingError::HandleAlreadyConsumed`] if it already backs an order.
    #[tracing::instrument(skip(self, handle), fields(lock_id = %handle.lock_id()))]
    pub async fn create_order(
        &self,
        user_id: UserId,
        handle: SeatLockHandle,
        payment_method: PaymentMethod,
    ) -> BookingResult<Order> {
        if !payment_method.uses_gateway() {
            return Err(BookingError::PaymentFailed {
                reason: "group ticket payment is only available through redemption".to_string(),
            });
        }
        self.place_order(user_id, handle, payment_method, PurchaseSource::Regular)
            .await
    }

    /// Claims the lock for a new order, then records the order
    async fn place_order(
        &self,
        user_id: UserId,
        handle: SeatLockHandle,
        payment_method: PaymentMethod,
        source: PurchaseSource,
    ) -> BookingResult<Order> {
        let store = self.screening(handle.screening_id()).await?;
        let screening = store
            .state(|s| s.screening.clone())
            .await
            .ok_or_else(|| BookingError::not_found("screening", handle.screening_id()))?;
        let unit_price = match source {
            PurchaseSource::Regular => screening.ticket_price,
            PurchaseSource::GroupTicket { .. } => Money::ZERO,
        };

        let order_id = OrderId::new();
        let lock_id = handle.lock_id();
        dispatch(&*store, SeatInventoryAction::ClaimLock { lock_id, order_id }).await?;

        let placed = dispatch(
            &self.orders,
            OrderAction::PlaceOrder {
                order_id,
                user_id,
                screening: Box::new(screening),
                lock: handle,
                payment_method,
                unit_price,
                source,
            },
        )
        .await;

        match placed {
            Ok(OrderOutcome { order, .. }) => {
                metrics::record_order("created");
                tracing::info!(%order_id, order_number = %order.order_number, amount = %order.amount, "Order created");
                Ok(order)
            },
            Err(error) => {
                // The claim is spent; give the seats back
                self.release_seats(&store, lock_id).await;
                Err(error)
            },
        }
    }

    /// Pay a pending order.
    ///
    /// Charges the gateway (unless prepaid), sells the seats, issues one
    /// verification code per seat, marks the order paid and accrues
    /// membership points.
    ///
    /// # Errors
    ///
    /// [`BookingError::PaymentFailed`] if the charge is declined (the order
    /// stays pending) or the seat hold lapsed (the order is cancelled and
    /// any charge refunded). [`BookingError::InvalidStateTransition`] if the
    /// order is not pending.
    #[tracing::instrument(skip(self))]
    pub async fn pay(&self, order_id: OrderId, payment_method: PaymentMethod) -> BookingResult<Order> {
        let _guard = self.order_locks.lock(order_id).await;
        let order = self.find_order(order_id).await?;

        if !order.is_pending() {
            return Err(OrderLedgerReducer::invalid(&order, "pay"));
        }
        let prepaid = matches!(order.source, PurchaseSource::GroupTicket { .. });
        if prepaid != (payment_method == PaymentMethod::GroupTicket) {
            return Err(BookingError::PaymentFailed {
                reason: format!("{payment_method} cannot pay order {}", order.order_number),
            });
        }

        let now = self.clock.now();
        if order.payment_deadline <= now {
            self.expire_locked(&order).await?;
            metrics::record_order("payment_failed");
            return Err(BookingError::PaymentFailed {
                reason: "payment deadline passed".to_string(),
            });
        }

        let store = self.screening(order.screening_id).await?;

        // A lapsed hold fails below without charging
        let transaction = if payment_method.uses_gateway()
            && !order.amount.is_zero()
            && order.lock.expires_at() > now
        {
            match self
                .gateway
                .charge(&order.order_number, order.amount, payment_method)
                .await
            {
                Ok(transaction) => Some(transaction),
                Err(error) => {
                    tracing::warn!(%error, "Charge declined; order stays pending");
                    metrics::record_order("payment_failed");
                    return Err(BookingError::PaymentFailed {
                        reason: error.to_string(),
                    });
                },
            }
        } else {
            None
        };

        let lock_id = order.lock.lock_id();
        match dispatch(&*store, SeatInventoryAction::ConfirmSale { lock_id }).await {
            Ok(_) => {},
            Err(BookingError::LockExpired { .. }) => {
                tracing::warn!(order_id = %order.id, "Seat hold lapsed before payment completed");
                return self
                    .fail_payment(&order, &store, transaction.as_ref(), "seat hold expired")
                    .await;
            },
            Err(error) => {
                if let Some(transaction) = &transaction {
                    if let Err(refund_error) = self.refund_charge(transaction, order.amount).await {
                        tracing::error!(%refund_error, "Refund after failed sale failed");
                    }
                }
                return Err(error);
            },
        }

        // A paid order always has its codes
        let issued = dispatch(
            &self.verification,
            VerificationAction::IssueTickets {
                order_id,
                user_id: order.user_id,
                screening_id: order.screening_id,
                screening_starts_at: order.screening_starts_at,
                seats: order.seats.clone(),
            },
        )
        .await
        .and_then(|outcome| match outcome {
            VerificationOutcome::Issued(tickets) => Ok(tickets),
            other => Err(unexpected(&other)),
        });
        match issued {
            Ok(tickets) => tracing::debug!(count = tickets.len(), "Verification codes issued"),
            Err(error) => {
                tracing::error!(%error, %order_id, "Issuing verification codes failed; undoing sale");
                return self
                    .fail_payment(
                        &order,
                        &store,
                        transaction.as_ref(),
                        "verification codes could not be issued",
                    )
                    .await;
            },
        }

        let order = match dispatch(
            &self.orders,
            OrderAction::MarkPaid {
                order_id,
                payment_method,
                payment_reference: transaction.as_ref().map(|t| t.transaction_id.clone()),
            },
        )
        .await
        {
            Ok(OrderOutcome { order, .. }) => order,
            Err(error) => {
                tracing::error!(%error, %order_id, "Seats sold and codes issued but order not marked paid");
                return Err(error);
            },
        };
        metrics::record_order("paid");
        if transaction.is_some() {
            metrics::record_payment(order.amount.cents());
        }

        let points = order.amount.percent(self.config.membership.points_percent);
        if points > 0 {
            if let Err(error) = dispatch(
                &self.memberships,
                MembershipAction::Accrue {
                    user_id: order.user_id,
                    cinema_id: order.cinema_id,
                    points,
                },
            )
            .await
            {
                tracing::warn!(%error, points, "Membership accrual failed");
            }
        }

        Ok(order)
    }

    /// Refunds any charge, cancels the order and returns its seats
    async fn fail_payment(
        &self,
        order: &Order,
        store: &SeatInventoryStore,
        transaction: Option<&PaymentTransaction>,
        reason: &str,
    ) -> BookingResult<Order> {
        if let Some(transaction) = transaction {
            if let Err(error) = self.refund_charge(transaction, order.amount).await {
                tracing::error!(%error, transaction_id = %transaction.transaction_id, "Refund of failed payment failed");
            }
        }

        dispatch(
            &self.orders,
            OrderAction::FailPayment {
                order_id: order.id,
                reason: reason.to_string(),
            },
        )
        .await?;
        self.release_seats(store, order.lock.lock_id()).await;
        metrics::record_order("payment_failed");

        Err(BookingError::PaymentFailed {
            reason: format!("{reason} before payment completed"),
        })
    }

    /// Cancel an order.
    ///
    /// A pending order is cancelled and its seats released. A paid order
    /// that has not been used is refunded: seats go back on sale, its codes
    /// are revoked and a [`RefundRecord`] is returned. Cancelling a
    /// cancelled order returns it unchanged.
    ///
    /// # Errors
    ///
    /// [`BookingError::AlreadyConsumed`] if the tickets were used,
    /// [`BookingError::RefundWindowClosed`] too close to the screening.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
    ) -> BookingResult<(Order, Option<RefundRecord>)> {
        let _guard = self.order_locks.lock(order_id).await;
        let order = self.find_order(order_id).await?;

        match order.state() {
            (OrderStatus::Paid, _) => self.refund_order(order).await,
            (OrderStatus::Cancelled, _) => {
                let refund = self.refunds_for_order(order_id).await.pop();
                Ok((order, refund))
            },
            (OrderStatus::Pending, _) => {
                let outcome = dispatch(&self.orders, OrderAction::Cancel { order_id }).await?;
                if outcome.changed {
                    let store = self.screening(order.screening_id).await?;
                    self.release_seats(&store, order.lock.lock_id()).await;
                    metrics::record_order("cancelled");
                    tracing::info!(%order_id, "Order cancelled");
                }
                Ok((outcome.order, None))
            },
        }
    }

    async fn refund_order(&self, order: Order) -> BookingResult<(Order, Option<RefundRecord>)> {
        let order_id = order.id;
        let OrderOutcome { order, .. } =
            dispatch(&self.orders, OrderAction::Refund { order_id }).await?;

        let store = self.screening(order.screening_id).await?;
        self.release_seats(&store, order.lock.lock_id()).await;

        if let Err(error) =
            dispatch(&self.verification, VerificationAction::RevokeForOrder { order_id }).await
        {
            tracing::error!(%error, %order_id, "Revoking verification codes failed");
        }

        let (status, gateway_reference) = match &order.payment_reference {
            Some(transaction_id) if !order.amount.is_zero() => {
                match self.gateway.refund(transaction_id, order.amount).await {
                    Ok(reference) => (RefundStatus::Completed, Some(reference)),
                    Err(error) => {
                        tracing::error!(%error, %order_id, "Gateway refused refund; needs manual follow-up");
                        (
                            RefundStatus::Failed {
                                reason: error.to_string(),
                            },
                            None,
                        )
                    },
                }
            },
            _ => (RefundStatus::Completed, None),
        };

        let refund = RefundRecord {
            id: RefundId::new(),
            order_id,
            amount: order.amount,
            method: order.payment_method,
            status,
            gateway_reference,
            created_at: self.clock.now(),
        };
        dispatch(
            &self.orders,
            OrderAction::RecordRefund {
                refund: refund.clone(),
            },
        )
        .await?;

        metrics::record_order("refunded");
        if refund.status == RefundStatus::Completed {
            metrics::record_refund(refund.amount.cents());
        }
        tracing::info!(%order_id, amount = %refund.amount, status = ?refund.status, "Order refunded");
        Ok((order, Some(refund)))
    }

    /// Cancel a pending order whose payment deadline has passed.
    ///
    /// Orders that are paid, cancelled or still within their deadline are
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for an unknown order.
    pub async fn expire_order(&self, order_id: OrderId) -> BookingResult<Order> {
        self.expire_guarded(order_id).await.map(|outcome| outcome.order)
    }

    async fn expire_guarded(&self, order_id: OrderId) -> BookingResult<OrderOutcome> {
        let _guard = self.order_locks.lock(order_id).await;
        let order = self.find_order(order_id).await?;
        self.expire_locked(&order).await
    }

    /// Expiry under an order guard already held by the caller
    async fn expire_locked(&self, order: &Order) -> BookingResult<OrderOutcome> {
        let outcome = dispatch(&self.orders, OrderAction::Expire { order_id: order.id }).await?;
        if outcome.changed {
            let store = self.screening(order.screening_id).await?;
            self.release_seats(&store, order.lock.lock_id()).await;
            metrics::record_order("expired");
            tracing::info!(order_id = %order.id, "Unpaid order expired");
        }
        Ok(outcome)
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Admit one seat at the entrance.
    ///
    /// The first code used for an order marks the order used.
    ///
    /// # Errors
    ///
    /// [`BookingError::AlreadyUsed`] on a repeat, [`BookingError::NotFound`]
    /// for an unknown code, [`BookingError::TicketExpired`] after the
    /// screening has started.
    #[tracing::instrument(skip(self))]
    pub async fn verify_ticket(&self, code: &str) -> BookingResult<VerifiedSeat> {
        let code = VerificationCode::new(code);
        let result = self.redeem_code(code).await;

        let outcome = match &result {
            Ok(_) => "admitted",
            Err(BookingError::AlreadyUsed { .. }) => "already_used",
            Err(BookingError::TicketExpired { .. }) => "expired",
            Err(BookingError::NotFound { .. }) => "not_found",
            Err(_) => "rejected",
        };
        metrics::record_verification(outcome);
        result
    }

    async fn redeem_code(&self, code: VerificationCode) -> BookingResult<VerifiedSeat> {
        let Some(order_id) = self.verification.state(|s| s.order_of(&code)).await else {
            return Err(BookingError::not_found("verification code", &code));
        };
        let _guard = self.order_locks.lock(order_id).await;

        let (ticket, first_for_order) =
            match dispatch(&self.verification, VerificationAction::Redeem { code }).await? {
                VerificationOutcome::Redeemed {
                    ticket,
                    first_for_order,
                } => (ticket, first_for_order),
                other => return Err(unexpected(&other)),
            };

        // Later codes of the same party find the order already used
        if first_for_order {
            dispatch(&self.orders, OrderAction::MarkUsed { order_id }).await?;
        }

        tracing::info!(%order_id, seat = %ticket.seat, "Ticket verified");
        Ok(VerifiedSeat {
            code: ticket.code,
            order_id,
            screening_id: ticket.screening_id,
            seat: ticket.seat,
        })
    }

    // ========================================================================
    // Group tickets
    // ========================================================================

    /// Put a group ticket type on sale
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidConfig`] for bad quantity bounds,
    /// [`BookingError::InvalidStateTransition`] if the id is taken.
    pub async fn register_group_ticket_type(
        &self,
        ticket_type: GroupTicketType,
    ) -> BookingResult<GroupTicketType> {
        let type_id = ticket_type.id;
        let created = self
            .group_tickets
            .insert_new(type_id, || {
                GroupTicketStore::new(
                    GroupTicketState::new(),
                    GroupTicketReducer::new(),
                    GroupTicketEnvironment {
                        clock: Arc::clone(&self.clock),
                        journal: Arc::clone(&self.journal),
                        stream_id: group_ticket_stream(type_id),
                    },
                )
            })
            .await;
        let Some(store) = created else {
            return Err(BookingError::InvalidStateTransition {
                entity: "group ticket type",
                id: type_id.to_string(),
                from: "Registered".to_string(),
                attempted: "register",
            });
        };

        match dispatch(&*store, GroupTicketAction::RegisterType { ticket_type }).await {
            Ok(GroupTicketOutcome::Registered(ticket_type)) => Ok(ticket_type),
            Ok(other) => Err(unexpected(&other)),
            Err(error) => {
                self.group_tickets.remove(&type_id).await;
                Err(error)
            },
        }
    }

    /// Buy `quantity` units of a group ticket type.
    ///
    /// The buyer is charged first; if the stock is gone by the time the
    /// purchase is recorded, the charge is refunded.
    ///
    /// # Errors
    ///
    /// [`BookingError::StockExhausted`], [`BookingError::InvalidQuantityRange`],
    /// [`BookingError::GroupTicketUnavailable`] or [`BookingError::PaymentFailed`].
    #[tracing::instrument(skip(self))]
    pub async fn purchase_group_ticket(
        &self,
        user_id: UserId,
        type_id: GroupTicketTypeId,
        quantity: u32,
        payment_method: PaymentMethod,
    ) -> BookingResult<PurchasedGroupTicket> {
        if !payment_method.uses_gateway() {
            return Err(BookingError::PaymentFailed {
                reason: "group tickets cannot be paid with group tickets".to_string(),
            });
        }
        let store = self.group_ticket(type_id).await?;
        let now = self.clock.now();
        let ticket_type = store
            .state(|s| s.ticket_type.clone())
            .await
            .ok_or_else(|| BookingError::not_found("group ticket type", type_id))?;
        let total_price = GroupTicketReducer::check_purchase(&ticket_type, quantity, now)?;

        let purchase_id = PurchasedTicketId::new();
        let transaction = if total_price.is_zero() {
            None
        } else {
            let charged = self
                .gateway
                .charge(&purchase_id.to_string(), total_price, payment_method)
                .await
                .map_err(|error| BookingError::PaymentFailed {
                    reason: error.to_string(),
                })?;
            Some(charged)
        };

        let purchased = dispatch(
            &*store,
            GroupTicketAction::Purchase {
                purchase_id,
                user_id,
                quantity,
            },
        )
        .await;

        match purchased {
            Ok(GroupTicketOutcome::Purchased(purchase)) => {
                metrics::record_group_tickets_sold(quantity);
                if let Some(transaction) = &transaction {
                    metrics::record_payment(transaction.amount.cents());
                }
                tracing::info!(%purchase_id, quantity, price = %purchase.total_price, "Group ticket purchased");
                Ok(purchase)
            },
            other => {
                if let Some(transaction) = &transaction {
                    if let Err(error) = self.refund_charge(transaction, total_price).await {
                        tracing::error!(%error, %purchase_id, "Refund of failed group purchase failed");
                    }
                }
                match other {
                    Ok(outcome) => Err(unexpected(&outcome)),
                    Err(error) => Err(error),
                }
            },
        }
    }

    /// Add stock to a group ticket type; returns the new stock
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidConfig`] for a zero quantity or overflow.
    pub async fn restock_group_ticket(
        &self,
        type_id: GroupTicketTypeId,
        quantity: u32,
    ) -> BookingResult<u32> {
        let store = self.group_ticket(type_id).await?;
        match dispatch(&*store, GroupTicketAction::Restock { quantity }).await? {
            GroupTicketOutcome::Restocked { stock } => Ok(stock),
            other => Err(unexpected(&other)),
        }
    }

    /// Take a group ticket type off sale
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for an unknown type.
    pub async fn deactivate_group_ticket(&self, type_id: GroupTicketTypeId) -> BookingResult<()> {
        let store = self.group_ticket(type_id).await?;
        dispatch(&*store, GroupTicketAction::Deactivate).await?;
        Ok(())
    }

    /// Redeem a purchased group ticket for seats of a screening.
    ///
    /// The seat count must equal the ticket count and the screening must be
    /// for the ticket's movie and cinema. The resulting order is prepaid and
    /// comes back paid with its verification codes issued.
    ///
    /// # Errors
    ///
    /// [`BookingError::AlreadyUsed`] if the ticket was redeemed,
    /// [`BookingError::InvalidSeatSelection`], [`BookingError::GroupTicketUnavailable`]
    /// or any seat locking error.
    #[tracing::instrument(skip(self, seats), fields(seats = seats.len()))]
    pub async fn redeem_group_ticket(
        &self,
        purchase_id: PurchasedTicketId,
        screening_id: ScreeningId,
        seats: Vec<SeatRef>,
    ) -> BookingResult<Order> {
        let (group_store, purchase) = self.find_purchase(purchase_id).await?;
        let screening = self
            .screening(screening_id)
            .await?
            .state(|s| s.screening.clone())
            .await
            .ok_or_else(|| BookingError::not_found("screening", screening_id))?;

        if seats.len() != purchase.ticket_count as usize {
            return Err(BookingError::InvalidSeatSelection(format!(
                "group ticket covers {} seats, {} selected",
                purchase.ticket_count,
                seats.len()
            )));
        }
        if screening.movie_id != purchase.movie_id || screening.cinema_id != purchase.cinema_id {
            return Err(BookingError::GroupTicketUnavailable(
                "screening is not for the ticket's movie and cinema".to_string(),
            ));
        }

        dispatch(&*group_store, GroupTicketAction::BeginRedemption { purchase_id }).await?;

        let order = match self.redeem_into_order(purchase.user_id, purchase_id, screening_id, seats).await {
            Ok(order) => order,
            Err(error) => {
                if let Err(abandon_error) =
                    dispatch(&*group_store, GroupTicketAction::AbandonRedemption { purchase_id }).await
                {
                    tracing::error!(%abandon_error, %purchase_id, "Abandoning redemption failed");
                }
                return Err(error);
            },
        };

        dispatch(
            &*group_store,
            GroupTicketAction::CompleteRedemption {
                purchase_id,
                order_id: order.id,
            },
        )
        .await?;
        tracing::info!(%purchase_id, order_id = %order.id, "Group ticket redeemed");
        Ok(order)
    }

    async fn redeem_into_order(
        &self,
        user_id: UserId,
        purchase_id: PurchasedTicketId,
        screening_id: ScreeningId,
        seats: Vec<SeatRef>,
    ) -> BookingResult<Order> {
        let handle = self.lock_seats_default(screening_id, seats).await?;
        let lock_id = handle.lock_id();

        let order = match self
            .place_order(
                user_id,
                handle,
                PaymentMethod::GroupTicket,
                PurchaseSource::GroupTicket {
                    purchased_ticket: purchase_id,
                },
            )
            .await
        {
            Ok(order) => order,
            Err(error) => {
                let store = self.screening(screening_id).await?;
                self.release_seats(&store, lock_id).await;
                return Err(error);
            },
        };

        match self.pay(order.id, PaymentMethod::GroupTicket).await {
            Ok(order) => Ok(order),
            Err(error) => {
                // Settlement failed; make sure nothing stays held
                if let Err(cancel_error) = self.cancel_order(order.id).await {
                    tracing::error!(%cancel_error, order_id = %order.id, "Cancelling unsettled redemption failed");
                }
                Err(error)
            },
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Seats still available for a screening
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for an unknown screening.
    pub async fn available_count(&self, screening_id: ScreeningId) -> BookingResult<u32> {
        let store = self.screening(screening_id).await?;
        Ok(store.state(SeatInventoryState::available_count).await)
    }

    /// Availability of every seat of a screening
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for an unknown screening.
    pub async fn seat_map(&self, screening_id: ScreeningId) -> BookingResult<SeatMap> {
        let store = self.screening(screening_id).await?;
        Ok(store.state(SeatInventoryState::seat_map).await)
    }

    /// Available, locked and sold counts of a screening
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for an unknown screening.
    pub async fn screening_counts(&self, screening_id: ScreeningId) -> BookingResult<SeatCounts> {
        let store = self.screening(screening_id).await?;
        Ok(store.state(SeatInventoryState::counts).await)
    }

    /// Scheduled screenings
    pub async fn screenings(&self) -> Vec<ScreeningId> {
        self.screenings
            .entries()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Look up an order
    pub async fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.state(|s| s.order(order_id).cloned()).await
    }

    /// Orders of a customer, oldest first
    pub async fn orders_for_user(&self, user_id: UserId) -> Vec<Order> {
        self.orders.state(|s| s.orders_for_user(user_id)).await
    }

    /// Verification codes of an order
    pub async fn tickets_for_order(&self, order_id: OrderId) -> Vec<VerificationTicket> {
        self.verification
            .state(|s| s.tickets_for_order(order_id))
            .await
    }

    /// Issued codes a customer has not used yet, soonest screening first
    pub async fn pending_tickets_for_user(&self, user_id: UserId) -> Vec<VerificationTicket> {
        self.verification
            .state(|s| s.pending_for_user(user_id))
            .await
    }

    /// Group tickets a customer bought, across every type
    pub async fn purchased_group_tickets_for_user(
        &self,
        user_id: UserId,
    ) -> Vec<PurchasedGroupTicket> {
        let mut purchases = Vec::new();
        for (_, store) in self.group_tickets.entries().await {
            purchases.extend(store.state(|s| s.purchases_for_user(user_id)).await);
        }
        purchases.sort_by_key(|p| p.purchased_at);
        purchases
    }

    /// Remaining stock of a group ticket type
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] for an unknown type.
    pub async fn group_ticket_stock(&self, type_id: GroupTicketTypeId) -> BookingResult<u32> {
        let store = self.group_ticket(type_id).await?;
        Ok(store.state(GroupTicketState::stock).await)
    }

    /// Refund records of an order
    pub async fn refunds_for_order(&self, order_id: OrderId) -> Vec<RefundRecord> {
        self.orders.state(|s| s.refunds_for(order_id)).await
    }

    /// Membership of a customer at a cinema
    pub async fn membership(&self, user_id: UserId, cinema_id: CinemaId) -> Option<Membership> {
        self.memberships
            .state(|s| s.membership(user_id, cinema_id).cloned())
            .await
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Frees every seat hold past its deadline; returns how many locks were freed
    pub(crate) async fn release_expired_locks(&self) -> usize {
        let mut released = 0;
        for (screening_id, store) in self.screenings.entries().await {
            match dispatch(&*store, SeatInventoryAction::ReleaseExpired).await {
                Ok(InventoryOutcome::Swept { locks }) => released += locks.len(),
                Ok(other) => tracing::warn!(%screening_id, outcome = ?other, "Unexpected sweep outcome"),
                Err(error) => tracing::warn!(%screening_id, %error, "Releasing expired locks failed"),
            }
        }
        released
    }

    /// Cancels every pending order past its payment deadline; returns how many were cancelled
    pub(crate) async fn expire_overdue_orders(&self) -> usize {
        let now = self.clock.now();
        let overdue = self.orders.state(|s| s.overdue(now)).await;

        let mut cancelled = 0;
        for (order_id, _) in overdue {
            match self.expire_guarded(order_id).await {
                Ok(outcome) if outcome.changed => cancelled += 1,
                // Paid or cancelled in the meantime
                Ok(_) => {},
                Err(error) => tracing::warn!(%order_id, %error, "Expiring order failed"),
            }
        }
        cancelled
    }

    /// Stop accepting commands and wait for pending journal writes
    ///
    /// # Errors
    ///
    /// [`BookingError::Storage`] if effects are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> BookingResult<()> {
        tracing::info!("Shutting down booking core");
        for (_, store) in self.screenings.entries().await {
            store.shutdown(timeout).await?;
        }
        for (_, store) in self.group_tickets.entries().await {
            store.shutdown(timeout).await?;
        }
        self.orders.shutdown(timeout).await?;
        self.verification.shutdown(timeout).await?;
        self.memberships.shutdown(timeout).await?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn screening(&self, screening_id: ScreeningId) -> BookingResult<Arc<SeatInventoryStore>> {
        self.screenings
            .get(&screening_id)
            .await
            .ok_or_else(|| BookingError::not_found("screening", screening_id))
    }

    async fn group_ticket(
        &self,
        type_id: GroupTicketTypeId,
    ) -> BookingResult<Arc<GroupTicketStore>> {
        self.group_tickets
            .get(&type_id)
            .await
            .ok_or_else(|| BookingError::not_found("group ticket type", type_id))
    }

    async fn find_order(&self, order_id: OrderId) -> BookingResult<Order> {
        self.order(order_id)
            .await
            .ok_or_else(|| BookingError::not_found("order", order_id))
    }

    async fn find_purchase(
        &self,
        purchase_id: PurchasedTicketId,
    ) -> BookingResult<(Arc<GroupTicketStore>, PurchasedGroupTicket)> {
        for (_, store) in self.group_tickets.entries().await {
            if let Some(purchase) = store.state(|s| s.purchases.get(&purchase_id).cloned()).await {
                return Ok((store, purchase));
            }
        }
        Err(BookingError::not_found("group ticket", purchase_id))
    }

    /// Releases a lock's seats; failures are logged, the sweeper retries expired holds
    async fn release_seats(&self, store: &SeatInventoryStore, lock_id: SeatLockId) {
        if let Err(error) = dispatch(store, SeatInventoryAction::Release { lock_id }).await {
            tracing::error!(%lock_id, %error, "Releasing seats failed");
        }
    }

    async fn refund_charge(
        &self,
        transaction: &PaymentTransaction,
        amount: Money,
    ) -> BookingResult<String> {
        self.gateway
            .refund(&transaction.transaction_id, amount)
            .await
            .map_err(|error| BookingError::PaymentFailed {
                reason: error.to_string(),
            })
    }
}
