//! # Cinema Core
//!
//! Core traits and types shared by every aggregate of the cinema booking core.
//!
//! Each aggregate (seat inventory, orders, group tickets, verification codes,
//! memberships) is written as a reducer: a deterministic function that validates
//! an action, mutates its state in place and returns descriptions of the side
//! effects it wants performed. The runtime crate executes those descriptions.
//!
//! ## Core Concepts
//!
//! - **State**: Domain state owned by one aggregate instance
//! - **Action**: Commands and the events they produce, in one enum
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: Side effect descriptions, executed by the runtime
//! - **Environment**: Injected dependencies (clock, journal, code generator)
//!
//! ## Example
//!
//! ```ignore
//! use cinema_core::{reducer::Reducer, effect::Effect, SmallVec, smallvec};
//!
//! impl Reducer for CounterReducer {
//!     type State = CounterState;
//!     type Action = CounterAction;
//!     type Environment = ();
//!
//!     fn reduce(
//!         &self,
//!         state: &mut CounterState,
//!         action: CounterAction,
//!         _env: &(),
//!     ) -> SmallVec<[Effect<CounterAction>; 4]> {
//!         state.count += 1;
//!         smallvec![Effect::None]
//!     }
//! }
//! ```

pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

pub mod effect_macros;
pub mod event;
pub mod journal;
pub mod stream;

/// Reducer module - the pure business logic abstraction
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Implementations validate the action, update state in place and
        /// return the effects to execute. They never perform I/O directly.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Reducers never touch the journal themselves. They return an [`Effect`]
/// and the store performs the append after the state lock is released.
pub mod effect {
    use crate::event::SerializedEvent;
    use crate::journal::{EventJournal, JournalError};
    use crate::stream::{StreamId, Version};
    use std::sync::Arc;

    /// A side effect requested by a reducer
    pub enum Effect<Action> {
        /// Nothing to do
        None,

        /// Append events to the audit journal
        Journal(JournalOperation<Action>),
    }

    /// A journal append described by a reducer.
    ///
    /// The callbacks turn the journal result into an optional feedback action.
    pub struct JournalOperation<Action> {
        /// Journal to append to
        pub journal: Arc<dyn EventJournal>,
        /// Stream the events belong to
        pub stream_id: StreamId,
        /// Serialized events, in order
        pub events: Vec<SerializedEvent>,
        /// Feedback on success
        pub on_success: Box<dyn FnOnce(Version) -> Option<Action> + Send>,
        /// Feedback on failure
        pub on_error: Box<dyn FnOnce(JournalError) -> Option<Action> + Send>,
    }

    impl<Action> std::fmt::Debug for Effect<Action> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Journal(op) => f
                    .debug_struct("Effect::Journal")
                    .field("stream_id", &op.stream_id)
                    .field("events", &op.events.len())
                    .finish(),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Whether this effect does nothing
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }

        /// Event types carried by a journal effect, empty otherwise
        #[must_use]
        pub fn event_types(&self) -> Vec<&str> {
            match self {
                Effect::None => Vec::new(),
                Effect::Journal(op) => op.events.iter().map(|e| e.event_type.as_str()).collect(),
            }
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies of a reducer are abstracted behind traits and
/// injected through its environment.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Every expiry decision in the booking core (seat holds, payment
    /// deadlines, refund cutoffs, screening start) reads this clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock implementation.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of verification codes.
    ///
    /// Implementations only need to be unpredictable; reducers retry on
    /// collision with an already issued code.
    pub trait CodeGenerator: Send + Sync {
        /// Produce a fresh candidate code
        fn generate(&self) -> String;
    }
}
