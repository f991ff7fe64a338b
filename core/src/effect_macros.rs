//! Declarative macros for ergonomic effect construction
//!
//! Every aggregate emits a journal append after a state change; the macro
//! here keeps that effect construction to one expression.

/// Create an `Effect::Journal` that appends events to a stream
///
/// # Example
///
/// ```rust,ignore
/// use cinema_core::append_events;
///
/// append_events! {
///     journal: env.journal,
///     stream: env.stream_id.clone(),
///     events: vec![serialized_event],
///     on_success: |_version| None,
///     on_error: |error| Some(SeatInventoryAction::JournalWriteFailed { error: error.to_string() })
/// }
/// ```
#[macro_export]
macro_rules! append_events {
    (
        journal: $journal:expr,
        stream: $stream:expr,
        events: $events:expr,
        on_success: |$success_param:ident| $success_body:expr,
        on_error: |$error_param:ident| $error_body:expr
    ) => {
        $crate::effect::Effect::Journal($crate::effect::JournalOperation {
            journal: ::std::sync::Arc::clone(&$journal),
            stream_id: $crate::stream::StreamId::from($stream),
            events: $events,
            on_success: ::std::boxed::Box::new(move |$success_param| $success_body),
            on_error: ::std::boxed::Box::new(move |$error_param| $error_body),
        })
    };
}
