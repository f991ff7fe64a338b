//! Membership ledger: loyalty points per (customer, cinema).
//!
//! Points only grow. The level is recomputed from the balance on every
//! accrual.

use crate::aggregates::{RecordsOutcome, journal_events};
use crate::error::BookingResult;
use crate::events::BookingEvent;
use crate::types::{CinemaId, Membership, MembershipLevel, UserId};
use chrono::{DateTime, Utc};
use cinema_core::{
    SmallVec, effect::Effect, environment::Clock, journal::EventJournal, reducer::Reducer,
    stream::StreamId,
};
use cinema_runtime::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Actions for the membership ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MembershipAction {
    // Commands
    /// Add points, creating the membership on first accrual
    Accrue {
        /// Customer
        user_id: UserId,
        /// Cinema
        cinema_id: CinemaId,
        /// Points to add
        points: u64,
    },

    // Events
    /// Points added
    PointsAccrued {
        /// Customer
        user_id: UserId,
        /// Cinema
        cinema_id: CinemaId,
        /// Points added
        points: u64,
        /// Balance afterwards
        balance: u64,
        /// When
        accrued_at: DateTime<Utc>,
    },

    /// Journal append failed
    JournalWriteFailed {
        /// Journal error
        error: String,
    },
}

impl MembershipAction {
    /// Versioned journal name of an event
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::PointsAccrued { .. } => "PointsAccrued.v1",
            Self::JournalWriteFailed { .. } => "MembershipJournalWriteFailed.v1",
            Self::Accrue { .. } => "MembershipCommand",
        }
    }
}

/// State of the membership ledger
#[derive(Clone, Debug, Default)]
pub struct MembershipState {
    /// Memberships by (customer, cinema)
    pub memberships: HashMap<(UserId, CinemaId), Membership>,
    /// Journal appends that failed
    pub journal_failures: u32,
    /// Outcome of the last command
    pub last_outcome: Option<BookingResult<Membership>>,
}

impl MembershipState {
    /// Creates an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership of a customer at a cinema
    #[must_use]
    pub fn membership(&self, user_id: UserId, cinema_id: CinemaId) -> Option<&Membership> {
        self.memberships.get(&(user_id, cinema_id))
    }
}

impl RecordsOutcome for MembershipState {
    type Outcome = Membership;

    fn last_outcome(&self) -> Option<BookingResult<Membership>> {
        self.last_outcome.clone()
    }
}

/// Environment dependencies for the membership ledger
#[derive(Clone)]
pub struct MembershipEnvironment {
    /// Clock
    pub clock: Arc<dyn Clock>,
    /// Audit journal
    pub journal: Arc<dyn EventJournal>,
    /// Membership stream
    pub stream_id: StreamId,
}

/// Store running the membership ledger
pub type MembershipStore =
    Store<MembershipState, MembershipAction, MembershipEnvironment, MembershipReducer>;

/// Reducer for the membership ledger
#[derive(Clone, Debug, Default)]
pub struct MembershipReducer;

impl MembershipReducer {
    /// Creates a new `MembershipReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply_event(state: &mut MembershipState, action: &MembershipAction) {
        match action {
            MembershipAction::PointsAccrued {
                user_id,
                cinema_id,
                balance,
                accrued_at,
                ..
            } => {
                state.memberships.insert(
                    (*user_id, *cinema_id),
                    Membership {
                        user_id: *user_id,
                        cinema_id: *cinema_id,
                        points: *balance,
                        level: MembershipLevel::from_points(*balance),
                        updated_at: *accrued_at,
                    },
                );
            },
            MembershipAction::JournalWriteFailed { error } => {
                state.journal_failures += 1;
                tracing::warn!(%error, "Membership journal write failed");
            },
            MembershipAction::Accrue { .. } => {},
        }
    }
}

impl Reducer for MembershipReducer {
    type State = MembershipState;
    type Action = MembershipAction;
    type Environment = MembershipEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            MembershipAction::Accrue {
                user_id,
                cinema_id,
                points,
            } => {
                let previous = state.membership(user_id, cinema_id).map(|m| (m.points, m.level));
                let balance = previous.map_or(0, |(p, _)| p).saturating_add(points);

                let event = MembershipAction::PointsAccrued {
                    user_id,
                    cinema_id,
                    points,
                    balance,
                    accrued_at: env.clock.now(),
                };
                Self::apply_event(state, &event);

                let membership = state.membership(user_id, cinema_id).cloned();
                if let Some(membership) = &membership {
                    if previous.is_some_and(|(_, level)| level != membership.level) {
                        tracing::info!(
                            %user_id,
                            %cinema_id,
                            level = ?membership.level,
                            "Membership level changed"
                        );
                    }
                }
                state.last_outcome = membership.map(Ok);

                journal_events(
                    vec![BookingEvent::Membership(event)],
                    &env.journal,
                    &env.stream_id,
                    |error| MembershipAction::JournalWriteFailed { error },
                )
            },

            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
