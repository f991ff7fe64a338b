//! Append-only audit journal abstraction.
//!
//! Aggregates keep their authoritative state in memory and describe every
//! change as an event. The journal records those events per stream so the
//! history of a screening, an order or a group ticket type can be inspected
//! or replayed. Appends are issued as effects, after the state change has
//! been committed, so a journal outage never blocks a booking; the failure is
//! fed back to the aggregate instead.
//!
//! The trait returns boxed futures so it can be used as `Arc<dyn EventJournal>`.

use crate::event::SerializedEvent;
use crate::stream::{StreamId, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during journal operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    /// The journal backend could not be reached.
    #[error("Journal unavailable: {0}")]
    Unavailable(String),

    /// Stream not found in the journal.
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Event could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Journal of serialized events grouped by stream.
pub trait EventJournal: Send + Sync {
    /// Append events to a stream, returning the stream version afterwards.
    ///
    /// # Errors
    ///
    /// Returns `JournalError::Unavailable` if the backend cannot accept writes.
    fn append(
        &self,
        stream_id: StreamId,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, JournalError>> + Send + '_>>;

    /// Load every event of a stream, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `JournalError::StreamNotFound` if nothing was ever appended.
    fn load(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, JournalError>> + Send + '_>>;
}
