//! Application layer - wires the aggregate stores into the booking operations.

mod coordinator;
mod registry;

pub use coordinator::{BookingCore, BookingCoreBuilder};
