//! In-memory [`EventJournal`] used by the booking core when no durable
//! journal is configured, and by tests.

use cinema_core::event::SerializedEvent;
use cinema_core::journal::{EventJournal, JournalError};
use cinema_core::stream::{StreamId, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// HashMap-backed journal.
///
/// Can be switched unavailable to exercise the journal-failure path.
///
/// # Example
///
/// ```
/// use cinema_runtime::InMemoryJournal;
///
/// let journal = InMemoryJournal::new();
/// assert_eq!(journal.total_events(), 0);
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryJournal {
    streams: Arc<RwLock<HashMap<StreamId, Vec<SerializedEvent>>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryJournal {
    /// Create an empty journal
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle whether appends succeed
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of events across all streams
    #[must_use]
    pub fn total_events(&self) -> usize {
        self.streams
            .read()
            .map(|streams| streams.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Event types recorded on a stream, oldest first
    #[must_use]
    pub fn event_types(&self, stream_id: &StreamId) -> Vec<String> {
        self.streams
            .read()
            .ok()
            .and_then(|streams| {
                streams
                    .get(stream_id)
                    .map(|events| events.iter().map(|e| e.event_type.clone()).collect())
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl EventJournal for InMemoryJournal {
    fn append(
        &self,
        stream_id: StreamId,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, JournalError>> + Send + '_>> {
        Box::pin(async move {
            if !self.available.load(Ordering::SeqCst) {
                return Err(JournalError::Unavailable("journal switched off".to_string()));
            }

            let mut streams = self
                .streams
                .write()
                .map_err(|_| JournalError::Unavailable("journal lock poisoned".to_string()))?;
            let stream = streams.entry(stream_id).or_default();
            stream.extend(events);

            Ok(Version::new(stream.len() as u64))
        })
    }

    fn load(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, JournalError>> + Send + '_>> {
        Box::pin(async move {
            let streams = self
                .streams
                .read()
                .map_err(|_| JournalError::Unavailable("journal lock poisoned".to_string()))?;

            streams
                .get(&stream_id)
                .cloned()
                .ok_or(JournalError::StreamNotFound(stream_id))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(name: &str) -> SerializedEvent {
        SerializedEvent::new(name.to_string(), vec![1], None)
    }

    #[tokio::test]
    async fn append_returns_stream_length() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new("screening-1");

        let v1 = journal.append(stream.clone(), vec![event("A.v1")]).await.unwrap();
        let v2 = journal
            .append(stream.clone(), vec![event("B.v1"), event("C.v1")])
            .await
            .unwrap();

        assert_eq!(v1, Version::new(1));
        assert_eq!(v2, Version::new(3));
        assert_eq!(journal.event_types(&stream), vec!["A.v1", "B.v1", "C.v1"]);
    }

    #[tokio::test]
    async fn unknown_stream_is_not_found() {
        let journal = InMemoryJournal::new();
        let result = journal.load(StreamId::new("missing")).await;
        assert!(matches!(result, Err(JournalError::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn unavailable_journal_rejects_appends() {
        let journal = InMemoryJournal::new();
        journal.set_available(false);

        let result = journal.append(StreamId::new("orders"), vec![event("A.v1")]).await;

        assert!(matches!(result, Err(JournalError::Unavailable(_))));
        assert_eq!(journal.total_events(), 0);
    }
}
