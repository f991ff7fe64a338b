//! Verification ticket issuer.
//!
//! One code per seat of a paid order. A code flips from unused to used
//! exactly once; refunds revoke the unused codes of an order.

use crate::aggregates::{RecordsOutcome, journal_events};
use crate::error::{BookingError, BookingResult};
use crate::events::BookingEvent;
use crate::types::{
    OrderId, ScreeningId, SeatRef, UserId, VerificationCode, VerificationTicket,
};
use chrono::{DateTime, Utc};
use cinema_core::{
    SmallVec,
    effect::Effect,
    environment::{Clock, CodeGenerator},
    journal::EventJournal,
    reducer::Reducer,
    stream::StreamId,
};
use cinema_runtime::Store;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Attempts per seat before giving up on finding an unused code
const MAX_CODE_ATTEMPTS: usize = 16;

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the verification ticket issuer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VerificationAction {
    // Commands
    /// Issue one code per seat of a paid order
    IssueTickets {
        /// Order
        order_id: OrderId,
        /// Ticket holder
        user_id: UserId,
        /// Screening
        screening_id: ScreeningId,
        /// Start of the screening
        screening_starts_at: DateTime<Utc>,
        /// Seats of the order
        seats: Vec<SeatRef>,
    },

    /// Redeem a code at the entrance
    Redeem {
        /// Code presented
        code: VerificationCode,
    },

    /// Revoke the unused codes of a refunded order
    RevokeForOrder {
        /// Order
        order_id: OrderId,
    },

    // Events
    /// Codes issued
    TicketsIssued {
        /// New tickets
        tickets: Vec<VerificationTicket>,
    },

    /// Code used
    TicketRedeemed {
        /// Code
        code: VerificationCode,
        /// When
        used_at: DateTime<Utc>,
    },

    /// Codes revoked
    TicketsRevoked {
        /// Order
        order_id: OrderId,
        /// Revoked codes
        codes: Vec<VerificationCode>,
    },

    /// Journal append failed
    JournalWriteFailed {
        /// Journal error
        error: String,
    },
}

impl VerificationAction {
    /// Versioned journal name of an event
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::TicketsIssued { .. } => "TicketsIssued.v1",
            Self::TicketRedeemed { .. } => "TicketRedeemed.v1",
            Self::TicketsRevoked { .. } => "TicketsRevoked.v1",
            Self::JournalWriteFailed { .. } => "VerificationJournalWriteFailed.v1",
            Self::IssueTickets { .. } | Self::Redeem { .. } | Self::RevokeForOrder { .. } => {
                "VerificationCommand"
            },
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Result of a successful verification command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Tickets of the order (new, or already issued)
    Issued(Vec<VerificationTicket>),
    /// Code redeemed
    Redeemed {
        /// Ticket after redemption
        ticket: VerificationTicket,
        /// No other code of the order had been used before
        first_for_order: bool,
    },
    /// Codes revoked
    Revoked(Vec<VerificationCode>),
}

/// State of the verification ticket issuer
#[derive(Clone, Debug, Default)]
pub struct VerificationState {
    /// Every issued ticket
    pub tickets: HashMap<VerificationCode, VerificationTicket>,
    /// Codes of each order, in seat order
    pub by_order: HashMap<OrderId, Vec<VerificationCode>>,
    /// Journal appends that failed
    pub journal_failures: u32,
    /// Outcome of the last command
    pub last_outcome: Option<BookingResult<VerificationOutcome>>,
}

impl VerificationState {
    /// Creates an empty issuer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tickets of an order
    #[must_use]
    pub fn tickets_for_order(&self, order_id: OrderId) -> Vec<VerificationTicket> {
        self.by_order
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|code| self.tickets.get(code))
            .cloned()
            .collect()
    }

    /// Issued, unused, unrevoked tickets of a customer
    #[must_use]
    pub fn pending_for_user(&self, user_id: UserId) -> Vec<VerificationTicket> {
        let mut pending: Vec<VerificationTicket> = self
            .tickets
            .values()
            .filter(|t| t.user_id == user_id && !t.used && !t.revoked)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            (a.screening_starts_at, a.seat).cmp(&(b.screening_starts_at, b.seat))
        });
        pending
    }

    /// Order a code belongs to
    #[must_use]
    pub fn order_of(&self, code: &VerificationCode) -> Option<OrderId> {
        self.tickets.get(code).map(|t| t.order_id)
    }
}

impl RecordsOutcome for VerificationState {
    type Outcome = VerificationOutcome;

    fn last_outcome(&self) -> Option<BookingResult<VerificationOutcome>> {
        self.last_outcome.clone()
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the verification ticket issuer
#[derive(Clone)]
pub struct VerificationEnvironment {
    /// Clock for expiry checks
    pub clock: Arc<dyn Clock>,
    /// Audit journal
    pub journal: Arc<dyn EventJournal>,
    /// Ticket stream
    pub stream_id: StreamId,
    /// Source of unguessable codes
    pub codes: Arc<dyn CodeGenerator>,
}

/// Store running the verification ticket issuer
pub type VerificationStore =
    Store<VerificationState, VerificationAction, VerificationEnvironment, VerificationReducer>;

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the verification ticket issuer
#[derive(Clone, Debug, Default)]
pub struct VerificationReducer;

type Effects = SmallVec<[Effect<VerificationAction>; 4]>;

impl VerificationReducer {
    /// Creates a new `VerificationReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn reject(state: &mut VerificationState, error: BookingError) -> Effects {
        state.last_outcome = Some(Err(error));
        SmallVec::new()
    }

    fn succeed(
        state: &mut VerificationState,
        outcome: VerificationOutcome,
        event: VerificationAction,
        env: &VerificationEnvironment,
    ) -> Effects {
        Self::apply_event(state, &event);
        state.last_outcome = Some(Ok(outcome));
        journal_events(
            vec![BookingEvent::Verification(event)],
            &env.journal,
            &env.stream_id,
            |error| VerificationAction::JournalWriteFailed { error },
        )
    }

    /// Draws a code that is neither issued nor already taken in this batch
    fn fresh_code(
        state: &VerificationState,
        batch: &HashSet<VerificationCode>,
        codes: &dyn CodeGenerator,
    ) -> Option<VerificationCode> {
        (0..MAX_CODE_ATTEMPTS)
            .map(|_| VerificationCode::new(codes.generate()))
            .find(|code| {
                !code.as_str().is_empty()
                    && !state.tickets.contains_key(code)
                    && !batch.contains(code)
            })
    }

    fn issue(
        state: &mut VerificationState,
        order_id: OrderId,
        user_id: UserId,
        screening_id: ScreeningId,
        screening_starts_at: DateTime<Utc>,
        seats: Vec<SeatRef>,
        env: &VerificationEnvironment,
    ) -> Effects {
        if state.by_order.contains_key(&order_id) {
            state.last_outcome = Some(Ok(VerificationOutcome::Issued(
                state.tickets_for_order(order_id),
            )));
            return SmallVec::new();
        }
        if seats.is_empty() {
            return Self::reject(
                state,
                BookingError::InvalidSeatSelection("order has no seats".to_string()),
            );
        }

        let now = env.clock.now();
        let mut batch = HashSet::with_capacity(seats.len());
        let mut tickets = Vec::with_capacity(seats.len());
        for seat in seats {
            let Some(code) = Self::fresh_code(state, &batch, env.codes.as_ref()) else {
                tracing::error!(%order_id, "Could not draw an unused verification code");
                return Self::reject(
                    state,
                    BookingError::Storage("verification code space exhausted".to_string()),
                );
            };
            batch.insert(code.clone());
            tickets.push(VerificationTicket {
                code,
                order_id,
                user_id,
                screening_id,
                seat,
                screening_starts_at,
                issued_at: now,
                used: false,
                used_at: None,
                revoked: false,
            });
        }

        tracing::debug!(%order_id, count = tickets.len(), "Verification tickets issued");
        Self::succeed(
            state,
            VerificationOutcome::Issued(tickets.clone()),
            VerificationAction::TicketsIssued { tickets },
            env,
        )
    }

    fn redeem(
        state: &mut VerificationState,
        code: VerificationCode,
        env: &VerificationEnvironment,
    ) -> Effects {
        let now = env.clock.now();
        let Some(ticket) = state.tickets.get(&code) else {
            return Self::reject(state, BookingError::not_found("verification code", &code));
        };

        let rejection = if ticket.revoked {
            Some(BookingError::InvalidStateTransition {
                entity: "verification ticket",
                id: code.to_string(),
                from: "Revoked".to_string(),
                attempted: "verify",
            })
        } else if ticket.used {
            Some(BookingError::AlreadyUsed {
                reference: code.to_string(),
            })
        } else if now > ticket.screening_starts_at {
            Some(BookingError::TicketExpired {
                code: code.to_string(),
            })
        } else {
            None
        };
        if let Some(error) = rejection {
            return Self::reject(state, error);
        }

        let order_id = ticket.order_id;
        let first_for_order = !state
            .tickets_for_order(order_id)
            .iter()
            .any(|other| other.used);

        let mut redeemed = ticket.clone();
        redeemed.used = true;
        redeemed.used_at = Some(now);

        tracing::debug!(%order_id, seat = %redeemed.seat, "Verification code redeemed");
        Self::succeed(
            state,
            VerificationOutcome::Redeemed {
                ticket: redeemed,
                first_for_order,
            },
            VerificationAction::TicketRedeemed { code, used_at: now },
            env,
        )
    }

    fn revoke(
        state: &mut VerificationState,
        order_id: OrderId,
        env: &VerificationEnvironment,
    ) -> Effects {
        let codes: Vec<VerificationCode> = state
            .tickets_for_order(order_id)
            .into_iter()
            .filter(|t| !t.used && !t.revoked)
            .map(|t| t.code)
            .collect();

        if codes.is_empty() {
            state.last_outcome = Some(Ok(VerificationOutcome::Revoked(Vec::new())));
            return SmallVec::new();
        }

        Self::succeed(
            state,
            VerificationOutcome::Revoked(codes.clone()),
            VerificationAction::TicketsRevoked { order_id, codes },
            env,
        )
    }

    /// Applies an event to state
    fn apply_event(state: &mut VerificationState, action: &VerificationAction) {
        match action {
            VerificationAction::TicketsIssued { tickets } => {
                for ticket in tickets {
                    state
                        .by_order
                        .entry(ticket.order_id)
                        .or_default()
                        .push(ticket.code.clone());
                    state.tickets.insert(ticket.code.clone(), ticket.clone());
                }
            },

            VerificationAction::TicketRedeemed { code, used_at } => {
                if let Some(ticket) = state.tickets.get_mut(code) {
                    ticket.used = true;
                    ticket.used_at = Some(*used_at);
                }
            },

            VerificationAction::TicketsRevoked { codes, .. } => {
                for code in codes {
                    if let Some(ticket) = state.tickets.get_mut(code) {
                        ticket.revoked = true;
                    }
                }
            },

            VerificationAction::JournalWriteFailed { error } => {
                state.journal_failures += 1;
                tracing::warn!(%error, "Verification journal write failed");
            },

            // Commands don't modify state
            VerificationAction::IssueTickets { .. }
            | VerificationAction::Redeem { .. }
            | VerificationAction::RevokeForOrder { .. } => {},
        }
    }
}

impl Reducer for VerificationReducer {
    type State = VerificationState;
    type Action = VerificationAction;
    type Environment = VerificationEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            VerificationAction::IssueTickets {
                order_id,
                user_id,
                screening_id,
                screening_starts_at,
                seats,
            } => Self::issue(
                state,
                order_id,
                user_id,
                screening_id,
                screening_starts_at,
                seats,
                env,
            ),

            VerificationAction::Redeem { code } => Self::redeem(state, code, env),

            VerificationAction::RevokeForOrder { order_id } => Self::revoke(state, order_id, env),

            // ========== Events ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use cinema_runtime::InMemoryJournal;
    use cinema_testing::{ManualClock, ReducerTest, SequentialCodes, assertions, test_clock};

    fn env_with(clock: &ManualClock, codes: Arc<SequentialCodes>) -> VerificationEnvironment {
        VerificationEnvironment {
            clock: Arc::new(clock.clone()),
            journal: Arc::new(InMemoryJournal::new()),
            stream_id: StreamId::new("verification-tickets"),
            codes,
        }
    }

    fn issue(order_id: OrderId, seats: &[(u16, u16)]) -> VerificationAction {
        VerificationAction::IssueTickets {
            order_id,
            user_id: UserId::new(),
            screening_id: ScreeningId::new(),
            screening_starts_at: test_clock().now() + chrono::Duration::hours(2),
            seats: seats.iter().map(|(r, c)| SeatRef::new(*r, *c)).collect(),
        }
    }

    fn redeem(code: &str) -> VerificationAction {
        VerificationAction::Redeem {
            code: VerificationCode::new(code),
        }
    }

    #[test]
    fn one_code_per_seat() {
        let clock = ManualClock::starting_at(test_clock().now());
        let order_id = OrderId::new();

        ReducerTest::new(VerificationReducer)
            .with_env(env_with(&clock, Arc::new(SequentialCodes::default())))
            .given_state(VerificationState::new())
            .when_action(issue(order_id, &[(3, 4), (3, 5)]))
            .then_state(move |state| {
                let tickets = state.tickets_for_order(order_id);
                assert_eq!(tickets.len(), 2);
                assert_eq!(tickets[0].code.as_str(), "TKT00000001");
                assert_eq!(tickets[1].seat, SeatRef::new(3, 5));
                assert!(tickets.iter().all(|t| !t.used));
            })
            .then_effects(|effects| assertions::assert_journaled(effects, &["TicketsIssued.v1"]))
            .run();
    }

    #[test]
    fn colliding_codes_are_redrawn() {
        let clock = ManualClock::starting_at(test_clock().now());
        let codes = Arc::new(SequentialCodes::default());
        let env = env_with(&clock, Arc::clone(&codes));
        let mut state = VerificationState::new();

        let _ = VerificationReducer.reduce(&mut state, issue(OrderId::new(), &[(1, 1)]), &env);
        codes.rewind();
        let second = OrderId::new();
        let _ = VerificationReducer.reduce(&mut state, issue(second, &[(1, 2)]), &env);

        assert_eq!(
            state.tickets_for_order(second)[0].code.as_str(),
            "TKT00000002"
        );
    }

    #[test]
    fn issuing_twice_returns_existing_codes() {
        let clock = ManualClock::starting_at(test_clock().now());
        let env = env_with(&clock, Arc::new(SequentialCodes::default()));
        let order_id = OrderId::new();
        let mut state = VerificationState::new();

        let _ = VerificationReducer.reduce(&mut state, issue(order_id, &[(1, 1)]), &env);
        let effects = VerificationReducer.reduce(&mut state, issue(order_id, &[(1, 1)]), &env);

        assertions::assert_no_effects(&effects);
        assert_eq!(state.tickets.len(), 1);
    }

    #[test]
    fn second_redemption_is_already_used() {
        let clock = ManualClock::starting_at(test_clock().now());
        let env = env_with(&clock, Arc::new(SequentialCodes::default()));
        let mut state = VerificationState::new();
        let _ = VerificationReducer.reduce(&mut state, issue(OrderId::new(), &[(2, 2), (2, 3)]), &env);

        let _ = VerificationReducer.reduce(&mut state, redeem("TKT00000001"), &env);
        match state.last_outcome.clone().unwrap().unwrap() {
            VerificationOutcome::Redeemed {
                ticket,
                first_for_order,
            } => {
                assert_eq!(ticket.seat, SeatRef::new(2, 2));
                assert!(first_for_order);
                assert!(ticket.used_at.is_some());
            },
            other => panic!("unexpected outcome {other:?}"),
        }

        let _ = VerificationReducer.reduce(&mut state, redeem("TKT00000001"), &env);
        assert_eq!(
            state.last_outcome,
            Some(Err(BookingError::AlreadyUsed {
                reference: "TKT00000001".to_string()
            }))
        );

        let _ = VerificationReducer.reduce(&mut state, redeem("TKT00000002"), &env);
        assert!(matches!(
            state.last_outcome,
            Some(Ok(VerificationOutcome::Redeemed {
                first_for_order: false,
                ..
            }))
        ));
    }

    #[test]
    fn unknown_code_is_not_found() {
        let clock = ManualClock::starting_at(test_clock().now());

        ReducerTest::new(VerificationReducer)
            .with_env(env_with(&clock, Arc::new(SequentialCodes::default())))
            .given_state(VerificationState::new())
            .when_action(redeem("NOPE"))
            .then_state(|state| {
                assert!(matches!(
                    state.last_outcome,
                    Some(Err(BookingError::NotFound { .. }))
                ));
            })
            .run();
    }

    #[test]
    fn code_expires_after_screening_start() {
        let clock = ManualClock::starting_at(test_clock().now());
        let env = env_with(&clock, Arc::new(SequentialCodes::default()));
        let mut state = VerificationState::new();
        let _ = VerificationReducer.reduce(&mut state, issue(OrderId::new(), &[(1, 1)]), &env);

        clock.advance(chrono::Duration::hours(2) + chrono::Duration::seconds(1));
        let _ = VerificationReducer.reduce(&mut state, redeem("TKT00000001"), &env);

        assert!(matches!(
            state.last_outcome,
            Some(Err(BookingError::TicketExpired { .. }))
        ));
        assert!(!state.tickets[&VerificationCode::new("TKT00000001")].used);
    }

    #[test]
    fn revoked_codes_cannot_be_redeemed() {
        let clock = ManualClock::starting_at(test_clock().now());
        let env = env_with(&clock, Arc::new(SequentialCodes::default()));
        let order_id = OrderId::new();
        let mut state = VerificationState::new();
        let _ = VerificationReducer.reduce(&mut state, issue(order_id, &[(1, 1), (1, 2)]), &env);

        let _ = VerificationReducer.reduce(&mut state, VerificationAction::RevokeForOrder { order_id }, &env);
        assert!(state.pending_for_user(state.tickets_for_order(order_id)[0].user_id).is_empty());

        let _ = VerificationReducer.reduce(&mut state, redeem("TKT00000002"), &env);
        assert!(matches!(
            state.last_outcome,
            Some(Err(BookingError::InvalidStateTransition { .. }))
        ));
    }
}
