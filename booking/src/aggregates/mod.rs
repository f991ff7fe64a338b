//! Booking aggregates.
//!
//! Each aggregate is a reducer run by its own [`Store`]. The store's write lock
//! is the transaction scope: one screening's seats, one group ticket type's
//! stock, the order ledger, the verification codes, the memberships.

pub mod group_ticket;
pub mod membership;
pub mod order_ledger;
pub mod seat_inventory;
pub mod verification;

pub use group_ticket::{GroupTicketAction, GroupTicketReducer, GroupTicketState};
pub use membership::{MembershipAction, MembershipReducer, MembershipState};
pub use order_ledger::{OrderAction, OrderLedgerReducer, OrderLedgerState};
pub use seat_inventory::{SeatInventoryAction, SeatInventoryReducer, SeatInventoryState};
pub use verification::{VerificationAction, VerificationReducer, VerificationState};

use crate::error::{BookingError, BookingResult};
use crate::events::BookingEvent;
use cinema_core::{
    SmallVec, append_events, effect::Effect, journal::EventJournal, reducer::Reducer,
    smallvec, stream::StreamId,
};
use cinema_runtime::Store;
use std::sync::Arc;

/// State that remembers the result of the last command it processed
pub trait RecordsOutcome {
    /// Successful result type
    type Outcome;

    /// Result of the most recent command, if any
    fn last_outcome(&self) -> Option<BookingResult<Self::Outcome>>;
}

/// Send a command and return the outcome the reducer recorded for it.
///
/// The outcome is read under the same write lock as the reducer run.
pub(crate) async fn dispatch<S, A, E, R>(
    store: &Store<S, A, E, R>,
    action: A,
) -> BookingResult<S::Outcome>
where
    S: RecordsOutcome + Send + Sync + 'static,
    A: Send + 'static,
    E: Clone + Send + Sync + 'static,
    R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
{
    let (outcome, _effects) = store
        .send_and_inspect(action, |state: &S| state.last_outcome())
        .await?;

    outcome.unwrap_or_else(|| Err(BookingError::Storage("reducer recorded no outcome".to_string())))
}

/// Journal append effect for a batch of events, or nothing for an empty batch
pub(crate) fn journal_events<A>(
    events: Vec<BookingEvent>,
    journal: &Arc<dyn EventJournal>,
    stream_id: &StreamId,
    on_error: fn(String) -> A,
) -> SmallVec<[Effect<A>; 4]>
where
    A: Send + 'static,
{
    if events.is_empty() {
        return SmallVec::new();
    }

    let serialized: Result<Vec<_>, _> = events.iter().map(BookingEvent::serialize).collect();
    match serialized {
        Ok(events) => {
            let journal = Arc::clone(journal);
            smallvec![append_events! {
                journal: journal,
                stream: stream_id.clone(),
                events: events,
                on_success: |_version| None,
                on_error: |error| Some(on_error(error.to_string()))
            }]
        },
        Err(error) => {
            tracing::warn!(%stream_id, %error, "Failed to serialize events for the journal");
            smallvec![Effect::None]
        },
    }
}
