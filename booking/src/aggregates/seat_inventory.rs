//! Seat inventory aggregate: the seat grid of one screening.
//!
//! Every seat is `Available`, `Locked` by exactly one seat lock, or `Sold`
//! under exactly one seat lock. Locking is all-or-nothing: a request for N
//! seats either holds all N under a new lock or changes nothing. Because the
//! store runs each action under its write lock, the availability check and the
//! state change of a lock request are one atomic step; two overlapping
//! requests can never both win a seat.
//!
//! Seat counts are never stored. [`SeatInventoryState::counts`] derives them
//! from seat states, so `available + locked + sold == capacity` holds by
//! construction.
//!
//! A lock whose deadline has passed is still `Locked` until the sweeper sends
//! [`SeatInventoryAction::ReleaseExpired`] or a `ConfirmSale` for it fails.
//! Nothing else acts on a lapsed hold.

use crate::aggregates::{RecordsOutcome, journal_events};
use crate::error::{BookingError, BookingResult};
use crate::events::BookingEvent;
use crate::types::{
    OrderId, Screening, SeatAvailability, SeatCounts, SeatLockHandle, SeatLockId, SeatMap,
    SeatRef, SeatState,
};
use chrono::{DateTime, Utc};
use cinema_core::{
    SmallVec, effect::Effect, environment::Clock, journal::EventJournal, reducer::Reducer,
    stream::StreamId,
};
use cinema_runtime::Store;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the seat inventory aggregate
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SeatInventoryAction {
    // Commands
    /// Set up the seat grid of a screening
    InitializeScreening {
        /// Screening to sell
        screening: Screening,
    },

    /// Hold seats under a new lock
    LockSeats {
        /// Identifier for the new lock
        lock_id: SeatLockId,
        /// Requested seats
        seats: Vec<SeatRef>,
        /// Hold length in seconds
        hold_seconds: u64,
    },

    /// Bind a live lock to an order (once per lock)
    ClaimLock {
        /// Lock to claim
        lock_id: SeatLockId,
        /// Order taking the lock
        order_id: OrderId,
    },

    /// Turn locked seats into sold seats
    ConfirmSale {
        /// Lock being paid for
        lock_id: SeatLockId,
    },

    /// Free the seats of a lock (locked or sold)
    Release {
        /// Lock to release
        lock_id: SeatLockId,
    },

    /// Give up a hold that no order has claimed
    AbandonLock {
        /// Lock to give up
        lock_id: SeatLockId,
    },

    /// Free every lock whose deadline has passed
    ReleaseExpired,

    // Events
    /// The seat grid was created
    ScreeningInitialized {
        /// Screening
        screening: Screening,
        /// When
        initialized_at: DateTime<Utc>,
    },

    /// Seats were locked
    SeatsLocked {
        /// New lock
        lock_id: SeatLockId,
        /// Seats held, sorted
        seats: Vec<SeatRef>,
        /// Hold deadline
        expires_at: DateTime<Utc>,
        /// When
        locked_at: DateTime<Utc>,
    },

    /// A lock was bound to an order
    LockClaimed {
        /// Lock
        lock_id: SeatLockId,
        /// Order
        order_id: OrderId,
        /// When
        claimed_at: DateTime<Utc>,
    },

    /// Locked seats were sold
    SeatsSold {
        /// Lock
        lock_id: SeatLockId,
        /// Seats sold
        seats: Vec<SeatRef>,
        /// When
        sold_at: DateTime<Utc>,
    },

    /// Seats went back to available
    SeatsReleased {
        /// Lock
        lock_id: SeatLockId,
        /// Seats freed
        seats: Vec<SeatRef>,
        /// Why
        reason: ReleaseReason,
        /// When
        released_at: DateTime<Utc>,
    },

    /// Journal append failed
    JournalWriteFailed {
        /// Journal error
        error: String,
    },
}

impl SeatInventoryAction {
    /// Versioned journal name of an event
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::ScreeningInitialized { .. } => "ScreeningInitialized.v1",
            Self::SeatsLocked { .. } => "SeatsLocked.v1",
            Self::LockClaimed { .. } => "LockClaimed.v1",
            Self::SeatsSold { .. } => "SeatsSold.v1",
            Self::SeatsReleased { .. } => "SeatsReleased.v1",
            Self::JournalWriteFailed { .. } => "SeatInventoryJournalWriteFailed.v1",
            Self::InitializeScreening { .. }
            | Self::LockSeats { .. }
            | Self::ClaimLock { .. }
            | Self::ConfirmSale { .. }
            | Self::Release { .. }
            | Self::AbandonLock { .. }
            | Self::ReleaseExpired => "SeatInventoryCommand",
        }
    }
}

/// Why seats were released
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    /// Holder cancelled
    Cancelled,
    /// Hold deadline passed
    Expired,
    /// Sold seats returned after a refund
    Refunded,
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a seat lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    /// Holding seats, not yet bound to an order
    Active,
    /// Holding seats for an order
    Claimed {
        /// Order
        order_id: OrderId,
    },
    /// Seats sold
    Sold,
    /// Seats given back
    Released {
        /// Why
        reason: ReleaseReason,
    },
}

/// A seat lock and the seats it covers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeatLock {
    /// Lock ID
    pub lock_id: SeatLockId,
    /// Seats, sorted
    pub seats: Vec<SeatRef>,
    /// Hold deadline
    pub expires_at: DateTime<Utc>,
    /// Lifecycle
    pub status: LockStatus,
}

impl SeatLock {
    const fn is_holding(&self) -> bool {
        matches!(self.status, LockStatus::Active | LockStatus::Claimed { .. })
    }
}

/// Result of a successful seat inventory command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InventoryOutcome {
    /// Grid created
    Initialized,
    /// Seats locked
    Locked(SeatLockHandle),
    /// Lock bound to an order
    Claimed,
    /// Seats sold
    Sold,
    /// Sale had already been confirmed
    AlreadySold,
    /// Seats freed
    Released {
        /// Freed seats
        seats: Vec<SeatRef>,
    },
    /// Lock had already been released
    AlreadyReleased,
    /// Expired locks freed by a sweep
    Swept {
        /// Released locks
        locks: Vec<SeatLockId>,
    },
}

/// State of one screening's seat inventory
#[derive(Clone, Debug, Default)]
pub struct SeatInventoryState {
    /// Screening, once initialized
    pub screening: Option<Screening>,
    /// Every seat of the hall
    pub seats: BTreeMap<SeatRef, SeatState>,
    /// Every lock ever issued for this screening
    pub locks: HashMap<SeatLockId, SeatLock>,
    /// Journal appends that failed
    pub journal_failures: u32,
    /// Outcome of the last command
    pub last_outcome: Option<BookingResult<InventoryOutcome>>,
}

impl SeatInventoryState {
    /// Creates an empty, uninitialized inventory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat counts derived from seat states
    #[must_use]
    pub fn counts(&self) -> SeatCounts {
        let mut counts = SeatCounts {
            capacity: self.screening.as_ref().map_or(0, Screening::capacity),
            ..SeatCounts::default()
        };
        for seat in self.seats.values() {
            match seat {
                SeatState::Available => counts.available += 1,
                SeatState::Locked { .. } => counts.locked += 1,
                SeatState::Sold { .. } => counts.sold += 1,
            }
        }
        counts
    }

    /// Public seat map
    #[must_use]
    pub fn seat_map(&self) -> SeatMap {
        self.seats
            .iter()
            .map(|(seat, state)| (*seat, state.availability()))
            .collect()
    }

    /// Seats currently held by a lock that is still holding
    #[must_use]
    pub fn held_by(&self, lock_id: SeatLockId) -> Vec<SeatRef> {
        self.seats
            .iter()
            .filter(|(_, state)| matches!(state, SeatState::Locked { lock_id: id, .. } if *id == lock_id))
            .map(|(seat, _)| *seat)
            .collect()
    }

    /// Locks that are holding seats past their deadline
    #[must_use]
    pub fn expired_locks(&self, now: DateTime<Utc>) -> Vec<SeatLockId> {
        let mut expired: Vec<SeatLockId> = self
            .locks
            .values()
            .filter(|lock| lock.is_holding() && lock.expires_at <= now)
            .map(|lock| lock.lock_id)
            .collect();
        expired.sort();
        expired
    }

    /// Number of seats that are `Available`
    #[must_use]
    pub fn available_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)] // grid size fits u32
        let available = self
            .seats
            .values()
            .filter(|s| s.availability() == SeatAvailability::Available)
            .count() as u32;
        available
    }
}

impl RecordsOutcome for SeatInventoryState {
    type Outcome = InventoryOutcome;

    fn last_outcome(&self) -> Option<BookingResult<InventoryOutcome>> {
        self.last_outcome.clone()
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the seat inventory aggregate
#[derive(Clone)]
pub struct SeatInventoryEnvironment {
    /// Clock for hold deadlines
    pub clock: Arc<dyn Clock>,
    /// Audit journal
    pub journal: Arc<dyn EventJournal>,
    /// Stream ID for this screening
    pub stream_id: StreamId,
    /// Largest seat selection per lock
    pub max_seats_per_order: usize,
}

impl SeatInventoryEnvironment {
    /// Creates a new `SeatInventoryEnvironment`
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        journal: Arc<dyn EventJournal>,
        stream_id: StreamId,
        max_seats_per_order: usize,
    ) -> Self {
        Self {
            clock,
            journal,
            stream_id,
            max_seats_per_order,
        }
    }
}

/// Store running one screening's inventory
pub type SeatInventoryStore =
    Store<SeatInventoryState, SeatInventoryAction, SeatInventoryEnvironment, SeatInventoryReducer>;

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the seat inventory aggregate
#[derive(Clone, Debug, Default)]
pub struct SeatInventoryReducer;

type Effects = SmallVec<[Effect<SeatInventoryAction>; 4]>;

impl SeatInventoryReducer {
    /// Creates a new `SeatInventoryReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn reject(state: &mut SeatInventoryState, error: BookingError) -> Effects {
        state.last_outcome = Some(Err(error));
        SmallVec::new()
    }

    fn succeed(
        state: &mut SeatInventoryState,
        outcome: InventoryOutcome,
        events: Vec<SeatInventoryAction>,
        env: &SeatInventoryEnvironment,
    ) -> Effects {
        for event in &events {
            Self::apply_event(state, event);
        }
        state.last_outcome = Some(Ok(outcome));
        Self::journal(events, env)
    }

    fn journal(events: Vec<SeatInventoryAction>, env: &SeatInventoryEnvironment) -> Effects {
        journal_events(
            events.into_iter().map(BookingEvent::SeatInventory).collect(),
            &env.journal,
            &env.stream_id,
            |error| SeatInventoryAction::JournalWriteFailed { error },
        )
    }

    /// Validates a seat selection and returns it sorted
    fn validate_selection(
        screening: &Screening,
        seats: &[SeatRef],
        max_seats: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeatRef>, BookingError> {
        if now >= screening.starts_at {
            return Err(BookingError::InvalidSeatSelection(
                "screening has already started".to_string(),
            ));
        }
        if seats.is_empty() {
            return Err(BookingError::InvalidSeatSelection(
                "no seats selected".to_string(),
            ));
        }
        if seats.len() > max_seats {
            return Err(BookingError::InvalidSeatSelection(format!(
                "at most {max_seats} seats per order, {} requested",
                seats.len()
            )));
        }

        let unique: BTreeSet<SeatRef> = seats.iter().copied().collect();
        if unique.len() != seats.len() {
            return Err(BookingError::InvalidSeatSelection(
                "seat selected twice".to_string(),
            ));
        }
        if let Some(outside) = unique.iter().find(|seat| !screening.contains(**seat)) {
            return Err(BookingError::InvalidSeatSelection(format!(
                "seat {outside} is not in this hall"
            )));
        }

        Ok(unique.into_iter().collect())
    }

    fn lock_seats(
        state: &mut SeatInventoryState,
        lock_id: SeatLockId,
        seats: &[SeatRef],
        hold_seconds: u64,
        env: &SeatInventoryEnvironment,
    ) -> Effects {
        let Some(screening) = state.screening.as_ref() else {
            return Self::reject(state, BookingError::not_found("screening", &env.stream_id));
        };
        let screening_id = screening.id;
        let now = env.clock.now();

        let seats = match Self::validate_selection(screening, seats, env.max_seats_per_order, now) {
            Ok(seats) => seats,
            Err(error) => return Self::reject(state, error),
        };

        let Some(expires_at) = i64::try_from(hold_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(chrono::Duration::try_seconds)
            .and_then(|hold| now.checked_add_signed(hold))
        else {
            return Self::reject(
                state,
                BookingError::InvalidSeatSelection("hold duration must be positive".to_string()),
            );
        };

        if state.locks.contains_key(&lock_id) {
            return Self::reject(
                state,
                BookingError::HandleAlreadyConsumed { lock_id },
            );
        }

        // All-or-nothing: any seat that is not free fails the whole request
        let conflicts: Vec<SeatRef> = seats
            .iter()
            .filter(|seat| !state.seats.get(seat).is_some_and(SeatState::is_available))
            .copied()
            .collect();
        if !conflicts.is_empty() {
            tracing::debug!(%screening_id, ?conflicts, "Seat lock rejected");
            return Self::reject(
                state,
                BookingError::SeatConflict {
                    screening_id,
                    seats: conflicts,
                },
            );
        }

        let handle = SeatLockHandle::new(lock_id, screening_id, seats.clone(), expires_at);
        tracing::debug!(%screening_id, %lock_id, seats = seats.len(), %expires_at, "Seats locked");

        Self::succeed(
            state,
            InventoryOutcome::Locked(handle),
            vec![SeatInventoryAction::SeatsLocked {
                lock_id,
                seats,
                expires_at,
                locked_at: now,
            }],
            env,
        )
    }

    fn claim_lock(
        state: &mut SeatInventoryState,
        lock_id: SeatLockId,
        order_id: OrderId,
        env: &SeatInventoryEnvironment,
    ) -> Effects {
        let now = env.clock.now();
        let Some(lock) = state.locks.get(&lock_id) else {
            return Self::reject(state, BookingError::not_found("seat lock", lock_id));
        };

        let error = match lock.status {
            LockStatus::Active if now < lock.expires_at => None,
            LockStatus::Active | LockStatus::Released { reason: ReleaseReason::Expired } => {
                Some(BookingError::LockExpired { lock_id })
            },
            LockStatus::Claimed { .. } | LockStatus::Sold | LockStatus::Released { .. } => {
                Some(BookingError::HandleAlreadyConsumed { lock_id })
            },
        };
        if let Some(error) = error {
            return Self::reject(state, error);
        }

        Self::succeed(
            state,
            InventoryOutcome::Claimed,
            vec![SeatInventoryAction::LockClaimed {
                lock_id,
                order_id,
                claimed_at: now,
            }],
            env,
        )
    }

    fn confirm_sale(
        state: &mut SeatInventoryState,
        lock_id: SeatLockId,
        env: &SeatInventoryEnvironment,
    ) -> Effects {
        let now = env.clock.now();
        let Some(lock) = state.locks.get(&lock_id) else {
            return Self::reject(state, BookingError::not_found("seat lock", lock_id));
        };

        match lock.status {
            LockStatus::Sold => {
                state.last_outcome = Some(Ok(InventoryOutcome::AlreadySold));
                SmallVec::new()
            },
            LockStatus::Released { reason: ReleaseReason::Expired } => {
                Self::reject(state, BookingError::LockExpired { lock_id })
            },
            LockStatus::Released { .. } => {
                Self::reject(state, BookingError::HandleAlreadyConsumed { lock_id })
            },
            LockStatus::Active | LockStatus::Claimed { .. } if now >= lock.expires_at => {
                // A failed confirmation reclaims the lapsed hold on the spot
                let released = SeatInventoryAction::SeatsReleased {
                    lock_id,
                    seats: state.held_by(lock_id),
                    reason: ReleaseReason::Expired,
                    released_at: now,
                };
                Self::apply_event(state, &released);
                state.last_outcome = Some(Err(BookingError::LockExpired { lock_id }));
                Self::journal(vec![released], env)
            },
            LockStatus::Active | LockStatus::Claimed { .. } => {
                let seats = lock.seats.clone();
                Self::succeed(
                    state,
                    InventoryOutcome::Sold,
                    vec![SeatInventoryAction::SeatsSold {
                        lock_id,
                        seats,
                        sold_at: now,
                    }],
                    env,
                )
            },
        }
    }

    fn release(
        state: &mut SeatInventoryState,
        lock_id: SeatLockId,
        unclaimed_only: bool,
        env: &SeatInventoryEnvironment,
    ) -> Effects {
        let Some(lock) = state.locks.get(&lock_id) else {
            return Self::reject(state, BookingError::not_found("seat lock", lock_id));
        };

        let reason = match lock.status {
            LockStatus::Released { .. } => {
                state.last_outcome = Some(Ok(InventoryOutcome::AlreadyReleased));
                return SmallVec::new();
            },
            LockStatus::Claimed { .. } | LockStatus::Sold if unclaimed_only => {
                let from = if lock.status == LockStatus::Sold { "Sold" } else { "Claimed" };
                return Self::reject(
                    state,
                    BookingError::InvalidStateTransition {
                        entity: "seat lock",
                        id: lock_id.to_string(),
                        from: from.to_string(),
                        attempted: "abandon",
                    },
                );
            },
            LockStatus::Sold => ReleaseReason::Refunded,
            LockStatus::Active | LockStatus::Claimed { .. } => ReleaseReason::Cancelled,
        };

        let seats: Vec<SeatRef> = lock
            .seats
            .iter()
            .filter(|seat| state.seats.get(seat).and_then(SeatState::holder) == Some(lock_id))
            .copied()
            .collect();

        Self::succeed(
            state,
            InventoryOutcome::Released {
                seats: seats.clone(),
            },
            vec![SeatInventoryAction::SeatsReleased {
                lock_id,
                seats,
                reason,
                released_at: env.clock.now(),
            }],
            env,
        )
    }

    fn release_expired(state: &mut SeatInventoryState, env: &SeatInventoryEnvironment) -> Effects {
        let now = env.clock.now();
        let expired = state.expired_locks(now);

        let events: Vec<SeatInventoryAction> = expired
            .iter()
            .map(|lock_id| SeatInventoryAction::SeatsReleased {
                lock_id: *lock_id,
                seats: state.held_by(*lock_id),
                reason: ReleaseReason::Expired,
                released_at: now,
            })
            .collect();

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Releasing expired seat locks");
        }

        Self::succeed(state, InventoryOutcome::Swept { locks: expired }, events, env)
    }

    /// Applies an event to state
    fn apply_event(state: &mut SeatInventoryState, action: &SeatInventoryAction) {
        match action {
            SeatInventoryAction::ScreeningInitialized { screening, .. } => {
                state.seats = screening
                    .seats()
                    .map(|seat| (seat, SeatState::Available))
                    .collect();
                state.screening = Some(screening.clone());
            },

            SeatInventoryAction::SeatsLocked {
                lock_id,
                seats,
                expires_at,
                ..
            } => {
                for seat in seats {
                    state.seats.insert(
                        *seat,
                        SeatState::Locked {
                            lock_id: *lock_id,
                            expires_at: *expires_at,
                        },
                    );
                }
                state.locks.insert(
                    *lock_id,
                    SeatLock {
                        lock_id: *lock_id,
                        seats: seats.clone(),
                        expires_at: *expires_at,
                        status: LockStatus::Active,
                    },
                );
            },

            SeatInventoryAction::LockClaimed {
                lock_id, order_id, ..
            } => {
                if let Some(lock) = state.locks.get_mut(lock_id) {
                    lock.status = LockStatus::Claimed {
                        order_id: *order_id,
                    };
                }
            },

            SeatInventoryAction::SeatsSold { lock_id, seats, .. } => {
                for seat in seats {
                    if let Some(state) = state.seats.get_mut(seat) {
                        if state.holder() == Some(*lock_id) {
                            *state = SeatState::Sold { lock_id: *lock_id };
                        }
                    }
                }
                if let Some(lock) = state.locks.get_mut(lock_id) {
                    lock.status = LockStatus::Sold;
                }
            },

            SeatInventoryAction::SeatsReleased {
                lock_id,
                seats,
                reason,
                ..
            } => {
                // Only seats still owned by this lock go back
                for seat in seats {
                    if let Some(state) = state.seats.get_mut(seat) {
                        if state.holder() == Some(*lock_id) {
                            *state = SeatState::Available;
                        }
                    }
                }
                if let Some(lock) = state.locks.get_mut(lock_id) {
                    lock.status = LockStatus::Released { reason: *reason };
                }
            },

            SeatInventoryAction::JournalWriteFailed { error } => {
                state.journal_failures += 1;
                tracing::warn!(%error, "Seat inventory journal write failed");
            },

            // Commands don't modify state
            SeatInventoryAction::InitializeScreening { .. }
            | SeatInventoryAction::LockSeats { .. }
            | SeatInventoryAction::ClaimLock { .. }
            | SeatInventoryAction::ConfirmSale { .. }
            | SeatInventoryAction::Release { .. }
            | SeatInventoryAction::AbandonLock { .. }
            | SeatInventoryAction::ReleaseExpired => {},
        }
    }
}

impl Reducer for SeatInventoryReducer {
    type State = SeatInventoryState;
    type Action = SeatInventoryAction;
    type Environment = SeatInventoryEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            SeatInventoryAction::InitializeScreening { screening } => {
                if let Some(existing) = &state.screening {
                    let id = existing.id.to_string();
                    return Self::reject(
                        state,
                        BookingError::InvalidStateTransition {
                            entity: "screening",
                            id,
                            from: "Scheduled".to_string(),
                            attempted: "schedule",
                        },
                    );
                }
                if screening.rows == 0 || screening.cols == 0 {
                    return Self::reject(
                        state,
                        BookingError::InvalidSeatSelection("hall has no seats".to_string()),
                    );
                }

                tracing::info!(
                    screening_id = %screening.id,
                    capacity = screening.capacity(),
                    "Screening initialized"
                );
                let initialized_at = env.clock.now();
                Self::succeed(
                    state,
                    InventoryOutcome::Initialized,
                    vec![SeatInventoryAction::ScreeningInitialized {
                        screening,
                        initialized_at,
                    }],
                    env,
                )
            },

            SeatInventoryAction::LockSeats {
                lock_id,
                seats,
                hold_seconds,
            } => Self::lock_seats(state, lock_id, &seats, hold_seconds, env),

            SeatInventoryAction::ClaimLock { lock_id, order_id } => {
                Self::claim_lock(state, lock_id, order_id, env)
            },

            SeatInventoryAction::ConfirmSale { lock_id } => Self::confirm_sale(state, lock_id, env),

            SeatInventoryAction::Release { lock_id } => Self::release(state, lock_id, false, env),

            SeatInventoryAction::AbandonLock { lock_id } => {
                Self::release(state, lock_id, true, env)
            },

            SeatInventoryAction::ReleaseExpired => Self::release_expired(state, env),

            // ========== Events ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
