//! Group ticket stock aggregate: one instance per group ticket type.
//!
//! Stock only shrinks through purchases and only grows through an explicit
//! restock. Purchase validation and the stock decrement happen in one reducer
//! run, so concurrent purchases are linearized on the stock counter and can
//! never oversell.
//!
//! The aggregate also owns the purchases made from its type and their
//! single-use redemption: `Available → InProgress → Redeemed`, with
//! `InProgress → Available` when a redemption attempt is abandoned.

use crate::aggregates::{RecordsOutcome, journal_events};
use crate::error::{BookingError, BookingResult};
use crate::events::BookingEvent;
use crate::types::{
    GroupTicketType, Money, OrderId, PurchasedGroupTicket, PurchasedTicketId, Redemption, UserId,
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

/// Actions for the group ticket stock aggregate
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GroupTicketAction {
    // Commands
    /// Put a group ticket type on sale
    RegisterType {
        /// Type with its initial stock
        ticket_type: GroupTicketType,
    },

    /// Buy `quantity` units
    Purchase {
        /// New purchase ID
        purchase_id: PurchasedTicketId,
        /// Buyer
        user_id: UserId,
        /// Party size
        quantity: u32,
    },

    /// Add stock
    Restock {
        /// Units to add
        quantity: u32,
    },

    /// Stop selling the type
    Deactivate,

    /// Start redeeming a purchase
    BeginRedemption {
        /// Purchase
        purchase_id: PurchasedTicketId,
    },

    /// Finish a redemption with the resulting order
    CompleteRedemption {
        /// Purchase
        purchase_id: PurchasedTicketId,
        /// Order created by the redemption
        order_id: OrderId,
    },

    /// Give up a redemption attempt
    AbandonRedemption {
        /// Purchase
        purchase_id: PurchasedTicketId,
    },

    // Events
    /// Type registered
    TypeRegistered {
        /// Type
        ticket_type: GroupTicketType,
    },

    /// Units sold
    GroupTicketPurchased {
        /// The purchase
        purchase: PurchasedGroupTicket,
    },

    /// Stock added
    Restocked {
        /// Units added
        quantity: u32,
        /// Stock afterwards
        stock: u32,
    },

    /// Type taken off sale
    TypeDeactivated {
        /// When
        deactivated_at: DateTime<Utc>,
    },

    /// Redemption started
    RedemptionStarted {
        /// Purchase
        purchase_id: PurchasedTicketId,
    },

    /// Purchase redeemed into an order
    GroupTicketRedeemed {
        /// Purchase
        purchase_id: PurchasedTicketId,
        /// Order
        order_id: OrderId,
        /// When
        redeemed_at: DateTime<Utc>,
    },

    /// Redemption attempt abandoned
    RedemptionAbandoned {
        /// Purchase
        purchase_id: PurchasedTicketId,
    },

    /// Journal append failed
    JournalWriteFailed {
        /// Journal error
        error: String,
    },
}

impl GroupTicketAction {
    /// Versioned journal name of an event
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::TypeRegistered { .. } => "GroupTicketTypeRegistered.v1",
            Self::GroupTicketPurchased { .. } => "GroupTicketPurchased.v1",
            Self::Restocked { .. } => "GroupTicketRestocked.v1",
            Self::TypeDeactivated { .. } => "GroupTicketTypeDeactivated.v1",
            Self::RedemptionStarted { .. } => "GroupTicketRedemptionStarted.v1",
            Self::GroupTicketRedeemed { .. } => "GroupTicketRedeemed.v1",
            Self::RedemptionAbandoned { .. } => "GroupTicketRedemptionAbandoned.v1",
            Self::JournalWriteFailed { .. } => "GroupTicketJournalWriteFailed.v1",
            Self::RegisterType { .. }
            | Self::Purchase { .. }
            | Self::Restock { .. }
            | Self::Deactivate
            | Self::BeginRedemption { .. }
            | Self::CompleteRedemption { .. }
            | Self::AbandonRedemption { .. } => "GroupTicketCommand",
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Result of a successful group ticket command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupTicketOutcome {
    /// Type registered
    Registered(GroupTicketType),
    /// Units sold
    Purchased(PurchasedGroupTicket),
    /// Stock after a restock
    Restocked {
        /// Remaining stock
        stock: u32,
    },
    /// Type off sale
    Deactivated,
    /// Purchase after a redemption step
    Redemption(PurchasedGroupTicket),
}

/// State of one group ticket type
#[derive(Clone, Debug, Default)]
pub struct GroupTicketState {
    /// The type, once registered
    pub ticket_type: Option<GroupTicketType>,
    /// Purchases made from this type
    pub purchases: HashMap<PurchasedTicketId, PurchasedGroupTicket>,
    /// Journal appends that failed
    pub journal_failures: u32,
    /// Outcome of the last command
    pub last_outcome: Option<BookingResult<GroupTicketOutcome>>,
}

impl GroupTicketState {
    /// Creates an unregistered type
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining stock, 0 before registration
    #[must_use]
    pub fn stock(&self) -> u32 {
        self.ticket_type.as_ref().map_or(0, |t| t.stock)
    }

    /// Units sold so far
    #[must_use]
    pub fn sold(&self) -> u64 {
        self.purchases
            .values()
            .map(|p| u64::from(p.ticket_count))
            .sum()
    }

    /// Purchases of a customer
    #[must_use]
    pub fn purchases_for_user(&self, user_id: UserId) -> Vec<PurchasedGroupTicket> {
        self.purchases
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl RecordsOutcome for GroupTicketState {
    type Outcome = GroupTicketOutcome;

    fn last_outcome(&self) -> Option<BookingResult<GroupTicketOutcome>> {
        self.last_outcome.clone()
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the group ticket stock aggregate
#[derive(Clone)]
pub struct GroupTicketEnvironment {
    /// Clock for expiry checks
    pub clock: Arc<dyn Clock>,
    /// Audit journal
    pub journal: Arc<dyn EventJournal>,
    /// Stream of this type
    pub stream_id: StreamId,
}

/// Store running one group ticket type
pub type GroupTicketStore =
    Store<GroupTicketState, GroupTicketAction, GroupTicketEnvironment, GroupTicketReducer>;

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the group ticket stock aggregate
#[derive(Clone, Debug, Default)]
pub struct GroupTicketReducer;

type Effects = SmallVec<[Effect<GroupTicketAction>; 4]>;

impl GroupTicketReducer {
    /// Creates a new `GroupTicketReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn reject(state: &mut GroupTicketState, error: BookingError) -> Effects {
        tracing::debug!(%error, "Group ticket command rejected");
        state.last_outcome = Some(Err(error));
        SmallVec::new()
    }

    fn succeed(
        state: &mut GroupTicketState,
        outcome: GroupTicketOutcome,
        event: GroupTicketAction,
        env: &GroupTicketEnvironment,
    ) -> Effects {
        Self::apply_event(state, &event);
        state.last_outcome = Some(Ok(outcome));
        journal_events(
            vec![BookingEvent::GroupTicket(event)],
            &env.journal,
            &env.stream_id,
            |error| GroupTicketAction::JournalWriteFailed { error },
        )
    }

    fn register(
        state: &mut GroupTicketState,
        ticket_type: GroupTicketType,
        env: &GroupTicketEnvironment,
    ) -> Effects {
        if state.ticket_type.is_some() {
            return Self::reject(
                state,
                BookingError::InvalidStateTransition {
                    entity: "group ticket type",
                    id: ticket_type.id.to_string(),
                    from: "Registered".to_string(),
                    attempted: "register",
                },
            );
        }
        if ticket_type.min_quantity == 0 || ticket_type.min_quantity > ticket_type.max_quantity {
            return Self::reject(
                state,
                BookingError::InvalidConfig(format!(
                    "group ticket quantity bounds {}..={} are invalid",
                    ticket_type.min_quantity, ticket_type.max_quantity
                )),
            );
        }

        tracing::info!(
            type_id = %ticket_type.id,
            kind = %ticket_type.kind,
            stock = ticket_type.stock,
            "Group ticket type registered"
        );
        Self::succeed(
            state,
            GroupTicketOutcome::Registered(ticket_type.clone()),
            GroupTicketAction::TypeRegistered { ticket_type },
            env,
        )
    }

    /// Price of buying `quantity` units now, or why the purchase is refused.
    ///
    /// Checks run in order: active, not expired, party size, stock.
    pub(crate) fn check_purchase(
        ticket_type: &GroupTicketType,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> BookingResult<Money> {
        if !ticket_type.active {
            return Err(BookingError::GroupTicketUnavailable(format!(
                "{} is not on sale",
                ticket_type.name
            )));
        }
        if ticket_type.is_expired(now) {
            return Err(BookingError::GroupTicketUnavailable(format!(
                "{} expired on {}",
                ticket_type.name, ticket_type.valid_until
            )));
        }
        let out_of_range = BookingError::InvalidQuantityRange {
            requested: quantity,
            min: ticket_type.min_quantity,
            max: ticket_type.max_quantity,
        };
        if !(ticket_type.min_quantity..=ticket_type.max_quantity).contains(&quantity) {
            return Err(out_of_range);
        }
        if ticket_type.stock < quantity {
            return Err(BookingError::StockExhausted {
                type_id: ticket_type.id,
                requested: quantity,
                remaining: ticket_type.stock,
            });
        }
        ticket_type
            .unit_price
            .checked_mul(u64::from(quantity))
            .ok_or(out_of_range)
    }

    fn purchase(
        state: &mut GroupTicketState,
        purchase_id: PurchasedTicketId,
        user_id: UserId,
        quantity: u32,
        env: &GroupTicketEnvironment,
    ) -> Effects {
        let now = env.clock.now();
        let Some(ticket_type) = state.ticket_type.as_ref() else {
            return Self::reject(state, BookingError::not_found("group ticket type", &env.stream_id));
        };

        let checked = Self::check_purchase(ticket_type, quantity, now).and_then(|total_price| {
            if state.purchases.contains_key(&purchase_id) {
                Err(BookingError::InvalidStateTransition {
                    entity: "group ticket",
                    id: purchase_id.to_string(),
                    from: "Purchased".to_string(),
                    attempted: "purchase",
                })
            } else {
                Ok(total_price)
            }
        });
        let total_price = match checked {
            Ok(total_price) => total_price,
            Err(error) => return Self::reject(state, error),
        };

        let purchase = PurchasedGroupTicket {
            id: purchase_id,
            type_id: ticket_type.id,
            user_id,
            movie_id: ticket_type.movie_id,
            cinema_id: ticket_type.cinema_id,
            ticket_count: quantity,
            total_price,
            purchased_at: now,
            redemption: Redemption::Available,
        };

        tracing::debug!(
            type_id = %ticket_type.id,
            %purchase_id,
            quantity,
            remaining = ticket_type.stock - quantity,
            "Group ticket purchased"
        );
        Self::succeed(
            state,
            GroupTicketOutcome::Purchased(purchase.clone()),
            GroupTicketAction::GroupTicketPurchased { purchase },
            env,
        )
    }

    fn restock(
        state: &mut GroupTicketState,
        quantity: u32,
        env: &GroupTicketEnvironment,
    ) -> Effects {
        let Some(ticket_type) = state.ticket_type.as_ref() else {
            return Self::reject(state, BookingError::not_found("group ticket type", &env.stream_id));
        };
        if quantity == 0 {
            return Self::reject(
                state,
                BookingError::InvalidConfig("restock quantity must be positive".to_string()),
            );
        }
        let Some(stock) = ticket_type.stock.checked_add(quantity) else {
            return Self::reject(
                state,
                BookingError::InvalidConfig("stock would overflow".to_string()),
            );
        };

        tracing::info!(type_id = %ticket_type.id, quantity, stock, "Group ticket restocked");
        Self::succeed(
            state,
            GroupTicketOutcome::Restocked { stock },
            GroupTicketAction::Restocked { quantity, stock },
            env,
        )
    }

    fn redemption_step(
        state: &mut GroupTicketState,
        purchase_id: PurchasedTicketId,
        step: RedemptionStep,
        env: &GroupTicketEnvironment,
    ) -> Effects {
        let Some(purchase) = state.purchases.get(&purchase_id) else {
            return Self::reject(state, BookingError::not_found("group ticket", purchase_id));
        };

        let event = match (step, purchase.redemption) {
            (RedemptionStep::Begin, Redemption::Available) => {
                GroupTicketAction::RedemptionStarted { purchase_id }
            },
            (RedemptionStep::Complete(order_id), Redemption::InProgress) => {
                GroupTicketAction::GroupTicketRedeemed {
                    purchase_id,
                    order_id,
                    redeemed_at: env.clock.now(),
                }
            },
            (RedemptionStep::Abandon, Redemption::InProgress) => {
                GroupTicketAction::RedemptionAbandoned { purchase_id }
            },
            (RedemptionStep::Abandon, Redemption::Available | Redemption::Redeemed { .. }) => {
                state.last_outcome = Some(Ok(GroupTicketOutcome::Redemption(purchase.clone())));
                return SmallVec::new();
            },
            (RedemptionStep::Begin | RedemptionStep::Complete(_), Redemption::Redeemed { .. }) => {
                return Self::reject(
                    state,
                    BookingError::AlreadyUsed {
                        reference: format!("group ticket {purchase_id}"),
                    },
                );
            },
            (_, current) => {
                return Self::reject(
                    state,
                    BookingError::InvalidStateTransition {
                        entity: "group ticket",
                        id: purchase_id.to_string(),
                        from: format!("{current:?}"),
                        attempted: step.name(),
                    },
                );
            },
        };

        Self::apply_event(state, &event);
        state.last_outcome = Some(
            state
                .purchases
                .get(&purchase_id)
                .cloned()
                .map(GroupTicketOutcome::Redemption)
                .ok_or_else(|| BookingError::not_found("group ticket", purchase_id)),
        );
        journal_events(
            vec![BookingEvent::GroupTicket(event)],
            &env.journal,
            &env.stream_id,
            |error| GroupTicketAction::JournalWriteFailed { error },
        )
    }

    /// Applies an event to state
    fn apply_event(state: &mut GroupTicketState, action: &GroupTicketAction) {
        match action {
            GroupTicketAction::TypeRegistered { ticket_type } => {
                state.ticket_type = Some(ticket_type.clone());
            },

            GroupTicketAction::GroupTicketPurchased { purchase } => {
                if let Some(ticket_type) = state.ticket_type.as_mut() {
                    ticket_type.stock = ticket_type.stock.saturating_sub(purchase.ticket_count);
                }
                state.purchases.insert(purchase.id, purchase.clone());
            },

            GroupTicketAction::Restocked { stock, .. } => {
                if let Some(ticket_type) = state.ticket_type.as_mut() {
                    ticket_type.stock = *stock;
                }
            },

            GroupTicketAction::TypeDeactivated { .. } => {
                if let Some(ticket_type) = state.ticket_type.as_mut() {
                    ticket_type.active = false;
                }
            },

            GroupTicketAction::RedemptionStarted { purchase_id } => {
                if let Some(purchase) = state.purchases.get_mut(purchase_id) {
                    purchase.redemption = Redemption::InProgress;
                }
            },

            GroupTicketAction::GroupTicketRedeemed {
                purchase_id,
                order_id,
                ..
            } => {
                if let Some(purchase) = state.purchases.get_mut(purchase_id) {
                    purchase.redemption = Redemption::Redeemed {
                        order_id: *order_id,
                    };
                }
            },

            GroupTicketAction::RedemptionAbandoned { purchase_id } => {
                if let Some(purchase) = state.purchases.get_mut(purchase_id) {
                    purchase.redemption = Redemption::Available;
                }
            },

            GroupTicketAction::JournalWriteFailed { error } => {
                state.journal_failures += 1;
                tracing::warn!(%error, "Group ticket journal write failed");
            },

            // Commands don't modify state
            GroupTicketAction::RegisterType { .. }
            | GroupTicketAction::Purchase { .. }
            | GroupTicketAction::Restock { .. }
            | GroupTicketAction::Deactivate
            | GroupTicketAction::BeginRedemption { .. }
            | GroupTicketAction::CompleteRedemption { .. }
            | GroupTicketAction::AbandonRedemption { .. } => {},
        }
    }
}

#[derive(Clone, Copy)]
enum RedemptionStep {
    Begin,
    Complete(OrderId),
    Abandon,
}

impl RedemptionStep {
    const fn name(self) -> &'static str {
        match self {
            Self::Begin => "redeem",
            Self::Complete(_) => "complete redemption of",
            Self::Abandon => "abandon redemption of",
        }
    }
}

impl Reducer for GroupTicketReducer {
    type State = GroupTicketState;
    type Action = GroupTicketAction;
    type Environment = GroupTicketEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            GroupTicketAction::RegisterType { ticket_type } => Self::register(state, ticket_type, env),

            GroupTicketAction::Purchase {
                purchase_id,
                user_id,
                quantity,
            } => Self::purchase(state, purchase_id, user_id, quantity, env),

            GroupTicketAction::Restock { quantity } => Self::restock(state, quantity, env),

            GroupTicketAction::Deactivate => {
                let Some(ticket_type) = state.ticket_type.as_ref() else {
                    return Self::reject(
                        state,
                        BookingError::not_found("group ticket type", &env.stream_id),
                    );
                };
                if !ticket_type.active {
                    state.last_outcome = Some(Ok(GroupTicketOutcome::Deactivated));
                    return SmallVec::new();
                }
                Self::succeed(
                    state,
                    GroupTicketOutcome::Deactivated,
                    GroupTicketAction::TypeDeactivated {
                        deactivated_at: env.clock.now(),
                    },
                    env,
                )
            },

            GroupTicketAction::BeginRedemption { purchase_id } => {
                Self::redemption_step(state, purchase_id, RedemptionStep::Begin, env)
            },

            GroupTicketAction::CompleteRedemption {
                purchase_id,
                order_id,
            } => Self::redemption_step(state, purchase_id, RedemptionStep::Complete(order_id), env),

            GroupTicketAction::AbandonRedemption { purchase_id } => {
                Self::redemption_step(state, purchase_id, RedemptionStep::Abandon, env)
            },

            // ========== Events ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
