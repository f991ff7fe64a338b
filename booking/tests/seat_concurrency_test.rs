//! Concurrency tests for seat locking.
//!
//! Many callers race for the same seats through one `BookingCore`; exactly
//! one may win each seat and the seat counts must stay consistent.
//!
//! Run with: `cargo test --test seat_concurrency_test -- --nocapture`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/expect

use chrono::Duration;
use cinema_core::environment::Clock;
use cinema_booking::{
    BookingCore, BookingError, CinemaId, HallId, Money, MovieId, Screening, ScreeningId,
    SeatAvailability, SeatLockHandle, SeatRef,
};
use cinema_testing::{ManualClock, test_clock};
use std::collections::HashSet;
use std::sync::Arc;

async fn core_with_screening(rows: u16, cols: u16) -> (Arc<BookingCore>, ScreeningId) {
    let clock = ManualClock::starting_at(test_clock().now());
    let core = BookingCore::builder()
        .clock(Arc::new(clock))
        .build()
        .unwrap();
    let screening = Screening {
        id: ScreeningId::new(),
        movie_id: MovieId::new(),
        cinema_id: CinemaId::new(),
        hall_id: HallId::new(),
        starts_at: test_clock().now() + Duration::days(1),
        ticket_price: Money::from_cents(4_000),
        rows,
        cols,
    };
    let screening_id = screening.id;
    core.schedule_screening(screening).await.unwrap();
    (Arc::new(core), screening_id)
}

/// 100 concurrent requests for one seat: one lock, 99 conflicts.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_seat_concurrency_100_requests() {
    println!("🧪 100 concurrent requests for r1-c1");
    let (core, screening_id) = core_with_screening(1, 1).await;

    let attempts = (0..100).map(|_| {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            core.lock_seats_default(screening_id, vec![SeatRef::new(1, 1)])
                .await
        })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    println!("  ✓ {winners} winner(s)");
    assert_eq!(winners, 1);

    for result in results.iter().filter(|r| r.is_err()) {
        match result {
            Err(BookingError::SeatConflict { seats, .. }) => {
                assert_eq!(seats, &vec![SeatRef::new(1, 1)]);
            },
            other => panic!("expected SeatConflict, got {other:?}"),
        }
    }

    let counts = core.screening_counts(screening_id).await.unwrap();
    assert_eq!((counts.available, counts.locked, counts.sold), (0, 1, 0));
    assert!(counts.is_consistent());
}

/// Overlapping pairs along one row: no seat ends up in two locks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_requests_never_share_a_seat() {
    let (core, screening_id) = core_with_screening(1, 10).await;

    let attempts = (1..10_u16).map(|col| {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            core.lock_seats_default(
                screening_id,
                vec![SeatRef::new(1, col), SeatRef::new(1, col + 1)],
            )
            .await
        })
    });
    let handles: Vec<SeatLockHandle> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().ok())
        .collect();

    assert!(!handles.is_empty());

    let mut held = HashSet::new();
    for handle in &handles {
        for seat in handle.seats() {
            assert!(held.insert(*seat), "{seat} locked twice");
        }
    }

    let counts = core.screening_counts(screening_id).await.unwrap();
    assert_eq!(counts.locked as usize, held.len());
    assert_eq!(counts.available as usize, 10 - held.len());
    assert!(counts.is_consistent());
}

#[tokio::test]
async fn test_partial_conflict_locks_nothing() {
    let (core, screening_id) = core_with_screening(2, 2).await;

    core.lock_seats_default(screening_id, vec![SeatRef::new(1, 2)])
        .await
        .unwrap();

    let error = core
        .lock_seats_default(screening_id, vec![SeatRef::new(1, 1), SeatRef::new(1, 2)])
        .await
        .unwrap_err();
    assert_eq!(
        error,
        BookingError::SeatConflict {
            screening_id,
            seats: vec![SeatRef::new(1, 2)],
        }
    );

    // The free seat of the refused request stays free
    let seat_map = core.seat_map(screening_id).await.unwrap();
    assert_eq!(seat_map[&SeatRef::new(1, 1)], SeatAvailability::Available);
    assert_eq!(seat_map[&SeatRef::new(1, 2)], SeatAvailability::Locked);
}

#[tokio::test]
async fn test_abandoned_hold_is_reusable() {
    let (core, screening_id) = core_with_screening(1, 2).await;

    let handle = core
        .lock_seats_default(screening_id, vec![SeatRef::new(1, 1)])
        .await
        .unwrap();
    core.release_lock(&handle).await.unwrap();
    // Releasing again is a no-op
    core.release_lock(&handle).await.unwrap();

    assert_eq!(core.available_count(screening_id).await.unwrap(), 2);
    core.lock_seats_default(screening_id, vec![SeatRef::new(1, 1)])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invalid_selections_are_rejected() {
    let (core, screening_id) = core_with_screening(2, 2).await;

    for seats in [
        vec![],
        vec![SeatRef::new(3, 1)],
        vec![SeatRef::new(1, 1), SeatRef::new(1, 1)],
    ] {
        let error = core
            .lock_seats_default(screening_id, seats)
            .await
            .unwrap_err();
        assert!(matches!(error, BookingError::InvalidSeatSelection(_)), "{error:?}");
    }

    let error = core
        .lock_seats_default(ScreeningId::new(), vec![SeatRef::new(1, 1)])
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::NotFound { .. }));
    assert_eq!(core.available_count(screening_id).await.unwrap(), 4);
}
