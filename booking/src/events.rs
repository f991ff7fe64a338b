//! Unified event type for the audit journal.
//!
//! Each aggregate journals its own events; wrapping them in [`BookingEvent`]
//! gives every stream one decodable payload type.

use crate::aggregates::{
    group_ticket::GroupTicketAction, membership::MembershipAction, order_ledger::OrderAction,
    seat_inventory::SeatInventoryAction, verification::VerificationAction,
};
use cinema_core::event::{Event, EventError, SerializedEvent};
use serde::{Deserialize, Serialize};

/// Events of every booking aggregate
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BookingEvent {
    /// Seat inventory event
    SeatInventory(SeatInventoryAction),
    /// Order ledger event
    Order(OrderAction),
    /// Group ticket stock event
    GroupTicket(GroupTicketAction),
    /// Verification ticket event
    Verification(VerificationAction),
    /// Membership event
    Membership(MembershipAction),
}

impl BookingEvent {
    /// Aggregate the event belongs to
    #[must_use]
    pub const fn aggregate(&self) -> &'static str {
        match self {
            Self::SeatInventory(_) => "seat_inventory",
            Self::Order(_) => "order_ledger",
            Self::GroupTicket(_) => "group_ticket_stock",
            Self::Verification(_) => "verification",
            Self::Membership(_) => "membership",
        }
    }

    /// Serialize for the journal, tagging the aggregate in metadata
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if bincode fails.
    pub fn serialize(&self) -> Result<SerializedEvent, EventError> {
        SerializedEvent::from_event(
            self,
            Some(serde_json::json!({ "aggregate": self.aggregate() })),
        )
    }
}

impl Event for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::SeatInventory(action) => action.event_name(),
            Self::Order(action) => action.event_name(),
            Self::GroupTicket(action) => action.event_name(),
            Self::Verification(action) => action.event_name(),
            Self::Membership(action) => action.event_name(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::{CinemaId, UserId};
    use cinema_testing::test_clock;
    use cinema_core::environment::Clock;

    #[test]
    fn journal_payload_decodes_back() {
        let event = BookingEvent::Membership(MembershipAction::PointsAccrued {
            user_id: UserId::new(),
            cinema_id: CinemaId::new(),
            points: 90,
            balance: 1_090,
            accrued_at: test_clock().now(),
        });

        let serialized = event.serialize().unwrap();
        assert_eq!(serialized.event_type, "PointsAccrued.v1");
        assert_eq!(
            serialized.metadata,
            Some(serde_json::json!({ "aggregate": "membership" }))
        );

        match BookingEvent::from_bytes(&serialized.data).unwrap() {
            BookingEvent::Membership(MembershipAction::PointsAccrued { balance, .. }) => {
                assert_eq!(balance, 1_090);
            },
            other => panic!("unexpected event {other:?}"),
        }
    }
}
