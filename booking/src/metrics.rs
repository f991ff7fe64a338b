//! Business metrics for the booking core.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `cinema_seat_locks_total{outcome}` - Seat lock attempts (granted, conflict, rejected)
//! - `cinema_orders_total{status}` - Order transitions (created, paid, cancelled, expired, refunded, payment_failed)
//! - `cinema_payment_revenue_cents_total` - Revenue from gateway payments in cents
//! - `cinema_refunds_cents_total` - Refunds issued in cents
//! - `cinema_group_tickets_sold_total` - Group ticket units sold
//! - `cinema_verifications_total{outcome}` - Entrance verifications (admitted, already_used, expired, not_found, rejected)
//! - `cinema_sweeper_reclaimed_total{kind}` - Locks and orders reclaimed by the sweeper
//!
//! ## Histograms
//! - `cinema_sweep_duration_seconds` - Duration of one sweep

use metrics::{describe_counter, describe_histogram};

/// Initialize and register all business metrics descriptions.
///
/// Call once at startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "cinema_seat_locks_total",
        "Seat lock attempts by outcome (granted, conflict, rejected)"
    );
    describe_counter!(
        "cinema_orders_total",
        "Order transitions by status (created, paid, cancelled, expired, refunded, payment_failed)"
    );
    describe_counter!(
        "cinema_payment_revenue_cents_total",
        "Revenue from successful gateway payments in cents"
    );
    describe_counter!("cinema_refunds_cents_total", "Refunds issued in cents");
    describe_counter!(
        "cinema_group_tickets_sold_total",
        "Group ticket units sold"
    );
    describe_counter!(
        "cinema_verifications_total",
        "Entrance verifications by outcome"
    );
    describe_counter!(
        "cinema_sweeper_reclaimed_total",
        "Resources reclaimed by the expiration sweeper (lock, order)"
    );
    describe_histogram!(
        "cinema_sweep_duration_seconds",
        "Time taken by one expiration sweep"
    );

    tracing::info!("Business metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a seat lock attempt.
pub fn record_seat_lock(outcome: &'static str, seats: usize) {
    metrics::counter!("cinema_seat_locks_total", "outcome" => outcome).increment(1);
    tracing::trace!(outcome, seats, "Recorded seat_lock metric");
}

/// Record an order transition.
pub fn record_order(status: &'static str) {
    metrics::counter!("cinema_orders_total", "status" => status).increment(1);
}

/// Record a successful gateway payment.
pub fn record_payment(amount_cents: u64) {
    metrics::counter!("cinema_orders_total", "status" => "paid").increment(1);
    metrics::counter!("cinema_payment_revenue_cents_total").increment(amount_cents);
}

/// Record a refund.
pub fn record_refund(amount_cents: u64) {
    metrics::counter!("cinema_orders_total", "status" => "refunded").increment(1);
    metrics::counter!("cinema_refunds_cents_total").increment(amount_cents);
}

/// Record group ticket units sold.
pub fn record_group_tickets_sold(quantity: u32) {
    metrics::counter!("cinema_group_tickets_sold_total").increment(u64::from(quantity));
}

/// Record an entrance verification.
pub fn record_verification(outcome: &'static str) {
    metrics::counter!("cinema_verifications_total", "outcome" => outcome).increment(1);
}

/// Record the result of one sweep.
pub fn record_sweep(locks_released: usize, orders_cancelled: usize, duration_secs: f64) {
    metrics::counter!("cinema_sweeper_reclaimed_total", "kind" => "lock")
        .increment(locks_released as u64);
    metrics::counter!("cinema_sweeper_reclaimed_total", "kind" => "order")
        .increment(orders_cancelled as u64);
    metrics::histogram!("cinema_sweep_duration_seconds").record(duration_secs);
    tracing::debug!(
        locks_released,
        orders_cancelled,
        duration_secs,
        "Recorded sweep metric"
    );
}
