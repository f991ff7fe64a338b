//! Error taxonomy of the booking core.
//!
//! Every fallible operation returns [`BookingError`]. Apart from
//! [`BookingError::Storage`], each variant describes a business rule that
//! rejected the request and leaves state unchanged.

use crate::types::{GroupTicketTypeId, OrderId, ScreeningId, SeatLockId, SeatRef};
use cinema_runtime::StoreError;
use thiserror::Error;

/// Result alias for booking operations
pub type BookingResult<T> = Result<T, BookingError>;

/// Errors returned by booking operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Some requested seats are locked or sold
    #[error("Seats unavailable for screening {screening_id}: {}", format_seats(.seats))]
    SeatConflict {
        /// Screening
        screening_id: ScreeningId,
        /// Seats that were not available, sorted
        seats: Vec<SeatRef>,
    },

    /// The seat hold expired before it was used
    #[error("Seat lock {lock_id} has expired")]
    LockExpired {
        /// Expired lock
        lock_id: SeatLockId,
    },

    /// The seat hold already backs another order, or was cancelled
    #[error("Seat lock {lock_id} was already used")]
    HandleAlreadyConsumed {
        /// Consumed lock
        lock_id: SeatLockId,
    },

    /// The order's tickets were already used
    #[error("Order {order_id} was already consumed")]
    AlreadyConsumed {
        /// Order
        order_id: OrderId,
    },

    /// Not enough group tickets left
    #[error("Group ticket type {type_id} has {remaining} left, {requested} requested")]
    StockExhausted {
        /// Group ticket type
        type_id: GroupTicketTypeId,
        /// Requested quantity
        requested: u32,
        /// Remaining stock
        remaining: u32,
    },

    /// Quantity outside the type's allowed party size
    #[error("Quantity {requested} outside allowed range {min}..={max}")]
    InvalidQuantityRange {
        /// Requested quantity
        requested: u32,
        /// Minimum party size
        min: u32,
        /// Maximum party size
        max: u32,
    },

    /// The entity is not in a state that allows the operation
    #[error("Cannot {attempted} {entity} {id} in state {from}")]
    InvalidStateTransition {
        /// Entity kind ("order", "screening", ...)
        entity: &'static str,
        /// Entity id
        id: String,
        /// Current state
        from: String,
        /// Attempted operation
        attempted: &'static str,
    },

    /// The verification code or group ticket was already redeemed
    #[error("{reference} was already used")]
    AlreadyUsed {
        /// Code or purchase id
        reference: String,
    },

    /// The screening of the ticket has started
    #[error("Ticket {code} has expired")]
    TicketExpired {
        /// Verification code
        code: String,
    },

    /// Unknown id
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// The payment did not go through; the order stays payable unless stated otherwise
    #[error("Payment failed: {reason}")]
    PaymentFailed {
        /// Gateway or booking reason
        reason: String,
    },

    /// Seat selection rejected (empty, duplicated, outside the hall, too many, too late)
    #[error("Invalid seat selection: {0}")]
    InvalidSeatSelection(String),

    /// Group ticket type inactive, expired or not valid for the screening
    #[error("Group ticket unavailable: {0}")]
    GroupTicketUnavailable(String),

    /// Too close to the screening to refund
    #[error("Refund window closed for order {order_id}")]
    RefundWindowClosed {
        /// Order
        order_id: OrderId,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime or storage failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BookingError {
    /// Whether the caller can act on this error (pick other seats, re-lock, retry)
    ///
    /// Storage failures and reuse of a spent lock are not recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::HandleAlreadyConsumed { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(error: StoreError) -> Self {
        Self::Storage(error.to_string())
    }
}

fn format_seats(seats: &[SeatRef]) -> String {
    seats
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_conflict_lists_seats() {
        let error = BookingError::SeatConflict {
            screening_id: ScreeningId::new(),
            seats: vec![SeatRef::new(1, 2), SeatRef::new(1, 3)],
        };
        assert!(error.to_string().ends_with("1-2, 1-3"));
        assert!(error.is_recoverable());
    }

    #[test]
    fn spent_lock_is_not_recoverable() {
        let error = BookingError::HandleAlreadyConsumed {
            lock_id: SeatLockId::new(),
        };
        assert!(!error.is_recoverable());
        assert!(BookingError::LockExpired { lock_id: SeatLockId::new() }.is_recoverable());
    }

    #[test]
    fn store_errors_become_storage() {
        let error: BookingError = StoreError::ShutdownInProgress.into();
        assert_eq!(error, BookingError::Storage("Store is shutting down".to_string()));
        assert!(!error.is_recoverable());
    }
}
