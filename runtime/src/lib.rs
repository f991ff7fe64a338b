//! # Cinema Runtime
//!
//! Store runtime for the cinema booking core.
//!
//! A [`Store`] owns the state of one aggregate instance behind an async
//! `RwLock`. Every action runs the reducer under the write lock, so all
//! check-and-mutate logic inside a reducer is atomic with respect to other
//! actions on the same store. Effects returned by the reducer run on spawned
//! tasks and may feed actions back into the store.
//!
//! ## Example
//!
//! ```ignore
//! use cinema_runtime::Store;
//!
//! let store = Store::new(SeatInventoryState::default(), SeatInventoryReducer, env);
//!
//! let (outcome, _handle) = store
//!     .send_and_inspect(action, |s| s.last_outcome.clone())
//!     .await?;
//! ```

use cinema_core::{effect::Effect, reducer::Reducer};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};

pub mod journal;

pub use journal::InMemoryJournal;

/// Store failures
pub mod error {
    use thiserror::Error;

    /// Why a store refused or failed an operation
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Effects did not finish in time
        ///
        /// Effects are fire-and-forget; this is only reported to callers that
        /// explicitly wait on a handle.
        #[error("Effect execution failed: {0}")]
        EffectFailed(String),

        /// `shutdown` was called; no more actions are accepted
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Effects were still running when the shutdown deadline passed
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),
    }
}

pub use error::StoreError;

/// Completion tracker for the effects of one action
///
/// Returned by [`Store::send()`] so callers (mostly tests) can wait for the
/// journal writes and feedback actions triggered by an action.
#[derive(Clone)]
pub struct EffectHandle {
    effects: Arc<AtomicUsize>,
    completion: watch::Receiver<()>,
}

impl EffectHandle {
    fn new() -> (Self, EffectTracking) {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(());

        let handle = Self {
            effects: Arc::clone(&counter),
            completion: rx,
        };

        let tracking = EffectTracking {
            counter,
            notifier: Arc::new(tx),
        };

        (handle, tracking)
    }

    /// A handle with nothing to wait for
    #[must_use]
    pub fn completed() -> Self {
        let (tx, rx) = watch::channel(());
        let _ = tx.send(());

        Self {
            effects: Arc::new(AtomicUsize::new(0)),
            completion: rx,
        }
    }

    /// Number of effects still running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.effects.load(Ordering::SeqCst)
    }

    /// Resolve once every effect of the action has finished
    pub async fn wait(&mut self) {
        while self.effects.load(Ordering::SeqCst) > 0 {
            if self.completion.changed().await.is_err() {
                break;
            }
        }
    }

    /// Like [`EffectHandle::wait`], bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EffectFailed`] if the timeout expires before all
    /// effects complete.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| StoreError::EffectFailed(format!("effects still running after {timeout:?}")))
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle")
            .field("pending_effects", &self.effects.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Counter shared between an [`EffectHandle`] and the tasks it tracks
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: Arc<watch::Sender<()>>,
}

impl EffectTracking {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.notifier.send(());
        }
    }
}

/// Internal: RAII guard that decrements the effect counter on drop
///
/// Keeps the counter correct even if an effect panics.
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Store-wide pending counter, decremented on drop
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The store and its effect execution.
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicUsize, DecrementGuard, Duration, Effect, EffectHandle,
        EffectTracking, Ordering, PendingGuard, Reducer, RwLock, StoreError,
    };

    /// One aggregate instance: its state, reducer and environment
    ///
    /// # Type Parameters
    ///
    /// - `S`: State type
    /// - `A`: Action type
    /// - `E`: Environment type
    /// - `R`: Reducer implementation
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: R,
        environment: E,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
        A: Send + 'static,
        S: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        /// Wrap `initial_state` in a new store
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Reduce `action` and start its effects
        ///
        /// Runs the reducer under the write lock, then starts the returned
        /// effects. Returns once the effects are started, not finished.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
            let ((), handle) = self.dispatch(action, |_| ()).await?;
            Ok(handle)
        }

        /// Send an action and read the resulting state before the lock is released
        ///
        /// The inspection runs under the same write lock as the reducer, so it
        /// observes exactly the state this action produced. Aggregates use it
        /// to read the outcome of a command without racing other senders.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action, inspect), name = "store_send_and_inspect")]
        pub async fn send_and_inspect<F, T>(
            &self,
            action: A,
            inspect: F,
        ) -> Result<(T, EffectHandle), StoreError>
        where
            F: FnOnce(&S) -> T,
        {
            self.dispatch(action, inspect).await
        }

        async fn dispatch<F, T>(&self, action: A, inspect: F) -> Result<(T, EffectHandle), StoreError>
        where
            F: FnOnce(&S) -> T,
        {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Store closed, action rejected");
                metrics::counter!("store.shutdown.rejected_actions").increment(1);
                return Err(StoreError::ShutdownInProgress);
            }

            metrics::counter!("store.commands.total").increment(1);

            let (handle, tracking) = EffectHandle::new();

            let (effects, inspected) = {
                let mut state = self.state.write().await;

                let start = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut *state, action, &self.environment);
                metrics::histogram!("store.reducer.duration_seconds")
                    .record(start.elapsed().as_secs_f64());

                // Precision loss acceptable for metrics
                #[allow(clippy::cast_precision_loss)]
                metrics::histogram!("store.effects.count").record(effects.len() as f64);

                (effects, inspect(&*state))
            };

            tracing::trace!(count = effects.len(), "Starting effects");
            for effect in effects {
                self.execute_effect(effect, &tracking);
            }

            Ok((inspected, handle))
        }

        /// Read state under the read lock
        ///
        /// ```ignore
        /// let available = store.state(|s| s.counts().available).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&*state)
        }

        /// Number of effects currently running on this store
        #[must_use]
        pub fn pending_effects(&self) -> usize {
            self.pending_effects.load(Ordering::Acquire)
        }

        /// Stop accepting actions and wait for running effects
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if the timeout expires before
        /// all pending effects complete.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating store shutdown");
            self.shutdown.store(true, Ordering::Release);

            let start = std::time::Instant::now();
            let poll_interval = Duration::from_millis(10);

            loop {
                let pending = self.pending_effects.load(Ordering::Acquire);
                if pending == 0 {
                    tracing::debug!("All effects completed, shutdown successful");
                    return Ok(());
                }
                if start.elapsed() >= timeout {
                    tracing::error!(pending_effects = pending, "Shutdown timeout");
                    return Err(StoreError::ShutdownTimeout(pending));
                }
                tokio::time::sleep(poll_interval).await;
            }
        }

        /// Run a journal append on a tracked task and feed its callback's
        /// action back into the store.
        fn execute_effect(&self, effect: Effect<A>, tracking: &EffectTracking) {
            let op = match effect {
                Effect::None => return,
                Effect::Journal(op) => op,
            };

            tracking.increment();
            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            let pending_guard = PendingGuard(Arc::clone(&self.pending_effects));
            let guard = DecrementGuard(tracking.clone());
            let store = self.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let _pending_guard = pending_guard;

                let stream_id = op.stream_id.clone();
                let event_count = op.events.len();
                let feedback = match op.journal.append(op.stream_id, op.events).await {
                    Ok(version) => {
                        tracing::trace!(%stream_id, %version, event_count, "Journal append succeeded");
                        metrics::counter!("store.journal.appends").increment(1);
                        (op.on_success)(version)
                    },
                    Err(error) => {
                        tracing::warn!(%stream_id, %error, event_count, "Journal append failed");
                        metrics::counter!("store.journal.failures").increment(1);
                        (op.on_error)(error)
                    },
                };

                if let Some(action) = feedback {
                    if let Err(error) = store.send(action).await {
                        tracing::warn!(%error, "Dropped feedback action");
                    }
                }
            });
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone,
        E: Clone,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: self.reducer.clone(),
                environment: self.environment.clone(),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
            }
        }
    }
}

pub use store::Store;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cinema_core::append_events;
    use cinema_core::event::SerializedEvent;
    use cinema_core::journal::EventJournal;
    use cinema_core::stream::StreamId;
    use cinema_core::{SmallVec, smallvec};

    #[derive(Debug, Clone, PartialEq)]
    enum GateAction {
        Admit,
        Record,
        Recorded { version: u64 },
        RecordFailed,
    }

    #[derive(Debug, Default)]
    struct GateState {
        admitted: i64,
        recorded: Vec<u64>,
        failures: usize,
    }

    #[derive(Clone)]
    struct GateEnv {
        journal: Arc<dyn EventJournal>,
    }

    #[derive(Clone)]
    struct GateReducer;

    impl Reducer for GateReducer {
        type State = GateState;
        type Action = GateAction;
        type Environment = GateEnv;

        fn reduce(
            &self,
            state: &mut GateState,
            action: GateAction,
            env: &GateEnv,
        ) -> SmallVec<[Effect<GateAction>; 4]> {
            match action {
                GateAction::Admit => {
                    state.admitted += 1;
                    smallvec![Effect::None]
                },
                GateAction::Record => smallvec![append_events! {
                    journal: env.journal,
                    stream: "gate",
                    events: vec![SerializedEvent::new("GateOpened.v1".to_string(), vec![0], None)],
                    on_success: |version| Some(GateAction::Recorded { version: version.value() }),
                    on_error: |_error| Some(GateAction::RecordFailed)
                }],
                GateAction::Recorded { version } => {
                    state.recorded.push(version);
                    SmallVec::new()
                },
                GateAction::RecordFailed => {
                    state.failures += 1;
                    SmallVec::new()
                },
            }
        }
    }

    fn store_with(journal: Arc<InMemoryJournal>) -> Store<GateState, GateAction, GateEnv, GateReducer> {
        Store::new(GateState::default(), GateReducer, GateEnv { journal })
    }

    #[tokio::test]
    async fn send_and_inspect_sees_own_state() {
        let store = store_with(Arc::new(InMemoryJournal::new()));

        let (admitted, _) = store
            .send_and_inspect(GateAction::Admit, |s| s.admitted)
            .await
            .unwrap();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn concurrent_sends_are_serialized() {
        let store = store_with(Arc::new(InMemoryJournal::new()));

        let tasks = (0..100).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.send(GateAction::Admit).await })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.state(|s| s.admitted).await, 100);
    }

    #[tokio::test]
    async fn none_effect_leaves_nothing_pending() {
        let store = store_with(Arc::new(InMemoryJournal::new()));

        let handle = store.send(GateAction::Admit).await.unwrap();
        assert_eq!(handle.pending(), 0);
        assert_eq!(store.pending_effects(), 0);
    }

    #[tokio::test]
    async fn journal_effect_reports_success_and_failure() {
        let journal = Arc::new(InMemoryJournal::new());
        let store = store_with(Arc::clone(&journal));

        let mut handle = store.send(GateAction::Record).await.unwrap();
        handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.state(|s| s.recorded.clone()).await, vec![1]);
        assert_eq!(journal.load(StreamId::new("gate")).await.unwrap().len(), 1);

        journal.set_available(false);
        let mut handle = store.send(GateAction::Record).await.unwrap();
        handle.wait_with_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.state(|s| s.failures).await, 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_actions() {
        let store = store_with(Arc::new(InMemoryJournal::new()));

        store.shutdown(Duration::from_secs(1)).await.unwrap();
        let result = store.send(GateAction::Admit).await;

        assert_eq!(result.unwrap_err(), StoreError::ShutdownInProgress);
    }

    #[tokio::test]
    async fn completed_handle_does_not_block() {
        let mut handle = EffectHandle::completed();
        assert_eq!(handle.pending(), 0);
        handle.wait_with_timeout(Duration::from_millis(10)).await.unwrap();
    }
}
