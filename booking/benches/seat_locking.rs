//! Seat locking benchmarks
//!
//! - Reducer: lock and release on one screening, no store overhead
//! - Core: lock and release through `BookingCore`
//! - Contention: concurrent requests for the same seats
//!
//! Run with: `cargo bench --bench seat_locking`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::Duration;
use cinema_booking::aggregates::seat_inventory::SeatInventoryEnvironment;
use cinema_booking::{
    BookingCore, CinemaId, HallId, Money, MovieId, Screening, ScreeningId, SeatLockId, SeatRef,
    aggregates::{SeatInventoryAction, SeatInventoryReducer, SeatInventoryState},
};
use cinema_core::environment::{Clock, SystemClock};
use cinema_core::reducer::Reducer;
use cinema_core::stream::StreamId;
use cinema_runtime::InMemoryJournal;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

fn screening(rows: u16, cols: u16) -> Screening {
    Screening {
        id: ScreeningId::new(),
        movie_id: MovieId::new(),
        cinema_id: CinemaId::new(),
        hall_id: HallId::new(),
        starts_at: SystemClock.now() + Duration::days(1),
        ticket_price: Money::from_cents(4_000),
        rows,
        cols,
    }
}

/// Lock then release, straight through the reducer
fn benchmark_reducer_lock_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("seat_reducer");
    group.throughput(Throughput::Elements(1));

    let reducer = SeatInventoryReducer::new();
    let env = SeatInventoryEnvironment::new(
        Arc::new(SystemClock),
        Arc::new(InMemoryJournal::new()),
        StreamId::new("screening-bench"),
        6,
    );

    for seats in [1_u16, 4] {
        group.bench_with_input(BenchmarkId::new("lock_release", seats), &seats, |b, &seats| {
            let mut state = SeatInventoryState::new();
            reducer.reduce(
                &mut state,
                SeatInventoryAction::InitializeScreening {
                    screening: screening(20, 30),
                },
                &env,
            );
            let selection: Vec<SeatRef> = (1..=seats).map(|col| SeatRef::new(10, col)).collect();

            b.iter(|| {
                let lock_id = SeatLockId::new();
                let _effects = reducer.reduce(
                    &mut state,
                    black_box(SeatInventoryAction::LockSeats {
                        lock_id,
                        seats: selection.clone(),
                        hold_seconds: 900,
                    }),
                    &env,
                );
                let _effects =
                    reducer.reduce(&mut state, SeatInventoryAction::Release { lock_id }, &env);
            });
        });
    }

    group.finish();
}

/// Lock then release through the booking core
fn benchmark_core_lock_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("booking_core");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let core = BookingCore::builder().build().expect("default config is valid");
    let hall = screening(20, 30);
    let screening_id = hall.id;
    runtime
        .block_on(core.schedule_screening(hall))
        .expect("Failed to schedule screening");

    group.bench_function("lock_release", |b| {
        b.to_async(&runtime).iter(|| async {
            let handle = core
                .lock_seats_default(screening_id, black_box(vec![SeatRef::new(5, 5)]))
                .await
                .expect("seat is free");
            core.release_lock(&handle).await.expect("release succeeds");
        });
    });

    group.finish();
}

/// Many callers racing for the same two seats
fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("seat_contention");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for contenders in [8_usize, 64] {
        group.throughput(Throughput::Elements(contenders as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(contenders),
            &contenders,
            |b, &contenders| {
                b.to_async(&runtime).iter(|| async move {
                    let core = Arc::new(BookingCore::builder().build().expect("valid config"));
                    let hall = screening(2, 2);
                    let screening_id = hall.id;
                    core.schedule_screening(hall).await.expect("scheduled");

                    let attempts = (0..contenders).map(|_| {
                        let core = Arc::clone(&core);
                        tokio::spawn(async move {
                            core.lock_seats_default(
                                screening_id,
                                vec![SeatRef::new(1, 1), SeatRef::new(1, 2)],
                            )
                            .await
                            .is_ok()
                        })
                    });
                    let winners = futures::future::join_all(attempts)
                        .await
                        .into_iter()
                        .filter(|joined| matches!(joined, Ok(true)))
                        .count();
                    black_box(winners)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_reducer_lock_release,
    benchmark_core_lock_release,
    benchmark_contention
);
criterion_main!(benches);
