//! Configuration for the booking core.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Values are range-checked by [`BookingConfig::validate`] before a
//! [`BookingCore`](crate::app::BookingCore) is built.

use crate::error::{BookingError, BookingResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Booking core configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConfig {
    /// Seat hold settings
    pub seats: SeatConfig,
    /// Order payment and refund settings
    pub orders: OrderConfig,
    /// Background expiration settings
    pub sweeper: SweeperConfig,
    /// Loyalty settings
    pub membership: MembershipConfig,
    /// Verification code settings
    pub verification: VerificationConfig,
}

/// Seat hold configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatConfig {
    /// Default hold length in minutes (5..=60)
    pub hold_minutes: u32,
    /// Most seats in one lock (1..=10)
    pub max_seats_per_order: usize,
}

/// Order configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfig {
    /// Minutes an order may stay unpaid (at least the hold length)
    pub payment_timeout_minutes: u32,
    /// Paid orders can no longer be refunded this many minutes before the screening.
    /// Zero allows refunds right up to the start.
    pub refund_cutoff_minutes: u32,
}

/// Expiration sweeper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps (at least 1)
    pub interval_seconds: u64,
}

/// Membership configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Points earned per 100 cents paid (points = cents × percent / 100)
    pub points_percent: u32,
}

/// Verification code configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Length of generated codes (8..=32)
    pub code_length: usize,
}

impl BookingConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            seats: SeatConfig {
                hold_minutes: env_or("SEAT_HOLD_MINUTES", defaults.seats.hold_minutes),
                max_seats_per_order: env_or(
                    "MAX_SEATS_PER_ORDER",
                    defaults.seats.max_seats_per_order,
                ),
            },
            orders: OrderConfig {
                payment_timeout_minutes: env_or(
                    "ORDER_PAYMENT_TIMEOUT_MINUTES",
                    defaults.orders.payment_timeout_minutes,
                ),
                refund_cutoff_minutes: env_or(
                    "REFUND_CUTOFF_MINUTES",
                    defaults.orders.refund_cutoff_minutes,
                ),
            },
            sweeper: SweeperConfig {
                interval_seconds: env_or(
                    "SWEEP_INTERVAL_SECONDS",
                    defaults.sweeper.interval_seconds,
                ),
            },
            membership: MembershipConfig {
                points_percent: env_or(
                    "MEMBER_POINTS_PERCENT",
                    defaults.membership.points_percent,
                ),
            },
            verification: VerificationConfig {
                code_length: env_or(
                    "VERIFICATION_CODE_LENGTH",
                    defaults.verification.code_length,
                ),
            },
        }
    }

    /// Check every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::InvalidConfig`] naming the first offending value.
    pub fn validate(&self) -> BookingResult<()> {
        if !(5..=60).contains(&self.seats.hold_minutes) {
            return Err(BookingError::InvalidConfig(format!(
                "seat hold must be 5..=60 minutes, got {}",
                self.seats.hold_minutes
            )));
        }
        if !(1..=10).contains(&self.seats.max_seats_per_order) {
            return Err(BookingError::InvalidConfig(format!(
                "max seats per order must be 1..=10, got {}",
                self.seats.max_seats_per_order
            )));
        }
        if self.orders.payment_timeout_minutes < self.seats.hold_minutes {
            return Err(BookingError::InvalidConfig(format!(
                "payment timeout ({} min) must not be shorter than the seat hold ({} min)",
                self.orders.payment_timeout_minutes, self.seats.hold_minutes
            )));
        }
        if self.sweeper.interval_seconds == 0 {
            return Err(BookingError::InvalidConfig(
                "sweep interval must be at least 1 second".to_string(),
            ));
        }
        if !(8..=32).contains(&self.verification.code_length) {
            return Err(BookingError::InvalidConfig(format!(
                "verification code length must be 8..=32, got {}",
                self.verification.code_length
            )));
        }
        Ok(())
    }

    /// Default seat hold
    #[must_use]
    pub fn seat_hold(&self) -> Duration {
        Duration::from_secs(u64::from(self.seats.hold_minutes) * 60)
    }

    /// Time an order may stay unpaid
    #[must_use]
    pub fn payment_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.orders.payment_timeout_minutes))
    }

    /// Refund cutoff before the screening
    #[must_use]
    pub fn refund_cutoff(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.orders.refund_cutoff_minutes))
    }

    /// Time between sweeps
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_seconds)
    }
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            seats: SeatConfig {
                hold_minutes: 15,
                max_seats_per_order: 6,
            },
            orders: OrderConfig {
                payment_timeout_minutes: 30,
                refund_cutoff_minutes: 0,
            },
            sweeper: SweeperConfig {
                interval_seconds: 30,
            },
            membership: MembershipConfig { points_percent: 1 },
            verification: VerificationConfig { code_length: 12 },
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
