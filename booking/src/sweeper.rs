//! Expiration sweeper.
//!
//! Periodically frees seat holds past their deadline and cancels pending
//! orders past their payment deadline. Both steps go through the same
//! idempotent commands as explicit cancellation, so a sweep racing a payment
//! or a manual cancel only ever observes the already-settled state.

use crate::app::BookingCore;
use crate::metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one sweep reclaimed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Seat locks released
    pub locks_released: usize,
    /// Pending orders cancelled
    pub orders_cancelled: usize,
}

/// Reclaims expired seat holds and unpaid orders
#[derive(Clone)]
pub struct ExpirationSweeper {
    core: Arc<BookingCore>,
    interval: Duration,
}

impl ExpirationSweeper {
    /// Sweeper running every `sweep_interval` of the core's configuration
    #[must_use]
    pub fn new(core: Arc<BookingCore>) -> Self {
        let interval = core.config().sweep_interval();
        Self { core, interval }
    }

    /// Override the interval between sweeps
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep now.
    ///
    /// Locks go first; the orders whose deadline passed then release
    /// whatever their locks still hold.
    pub async fn sweep_once(&self) -> SweepReport {
        let started = Instant::now();

        let report = SweepReport {
            locks_released: self.core.release_expired_locks().await,
            orders_cancelled: self.core.expire_overdue_orders().await,
        };

        metrics::record_sweep(
            report.locks_released,
            report.orders_cancelled,
            started.elapsed().as_secs_f64(),
        );
        if report == SweepReport::default() {
            tracing::trace!("Sweep found nothing to reclaim");
        } else {
            tracing::info!(
                locks_released = report.locks_released,
                orders_cancelled = report.orders_cancelled,
                "Sweep reclaimed expired holds"
            );
        }
        report
    }

    /// Sweep on a fixed interval until the returned handle is shut down
    #[must_use]
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            tracing::info!(interval = ?self.interval, "Expiration sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !*shutdown_rx.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Expiration sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle of a running sweeper
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop after the sweep in progress, if any, and wait for the task
    pub async fn shutdown(self) {
        // The task may already be gone; nothing to signal then
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::error!(%error, "Expiration sweeper task failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CinemaId, HallId, Money, MovieId, Screening, ScreeningId, SeatRef};
    use cinema_testing::{ManualClock, test_clock};
    use cinema_core::environment::Clock;

    async fn core_with_screening(clock: &ManualClock) -> (Arc<BookingCore>, ScreeningId) {
        let core = BookingCore::builder()
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let screening = Screening {
            id: ScreeningId::new(),
            movie_id: MovieId::new(),
            cinema_id: CinemaId::new(),
            hall_id: HallId::new(),
            starts_at: test_clock().now() + chrono::Duration::days(1),
            ticket_price: Money::from_cents(4_000),
            rows: 2,
            cols: 2,
        };
        let screening_id = screening.id;
        core.schedule_screening(screening).await.unwrap();
        (Arc::new(core), screening_id)
    }

    #[tokio::test]
    async fn sweep_reclaims_lapsed_holds_only() {
        let clock = ManualClock::starting_at(test_clock().now());
        let (core, screening_id) = core_with_screening(&clock).await;
        let sweeper = ExpirationSweeper::new(Arc::clone(&core));

        core.lock_seats(screening_id, vec![SeatRef::new(1, 1)], Duration::from_secs(300))
            .await
            .unwrap();
        core.lock_seats(screening_id, vec![SeatRef::new(2, 2)], Duration::from_secs(900))
            .await
            .unwrap();

        assert_eq!(sweeper.sweep_once().await, SweepReport::default());

        clock.advance(chrono::Duration::minutes(6));
        let report = sweeper.sweep_once().await;

        assert_eq!(report.locks_released, 1);
        assert_eq!(core.available_count(screening_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_shutdown() {
        let clock = ManualClock::starting_at(test_clock().now());
        let (core, _) = core_with_screening(&clock).await;

        let handle = ExpirationSweeper::new(core)
            .with_interval(Duration::from_millis(10))
            .spawn();
        tokio::time::sleep(Duration::from_millis(35)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
