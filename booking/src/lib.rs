//! Cinema Booking - the booking core of a cinema ticketing platform
//!
//! Reserves seats for screenings, turns reservations into paid orders, sells
//! prepaid group tickets, issues single-use verification codes and reclaims
//! holds that run out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │     Seat     │  │    Order     │  │ Group Ticket │  │ Verification │  │  Membership  │
//! │  Inventory   │  │    Ledger    │  │    Stock     │  │   Tickets    │  │    Ledger    │
//! │ (per screen) │  │              │  │  (per type)  │  │              │  │              │
//! └──────────────┘  └──────────────┘  └──────────────┘  └──────────────┘  └──────────────┘
//!        ▲                 ▲                  ▲                  ▲                 ▲
//!        └─────────────────┴─────── BookingCore ─────────────────┴─────────────────┘
//!                                       ▲
//!                               ExpirationSweeper
//! ```
//!
//! Every aggregate is a reducer run by its own `Store`. The store's write
//! lock is the transaction scope, so each check-and-mutate step (lock these
//! seats, take this stock, flip this code) is atomic:
//!
//! ```text
//! Seat lock race:
//!   caller A: LockSeats [r3-c4, r3-c5] ──▶ Locked(handle)
//!   caller B: LockSeats [r3-c5]         ──▶ SeatConflict [r3-c5]
//! ```
//!
//! Counts are derived from per-seat state, so
//! `available + locked + sold == capacity` holds after every command.
//!
//! # Order lifecycle
//!
//! ```text
//! lock_seats ─▶ create_order {Pending, Unissued} ─▶ pay {Paid, Issued} ─▶ verify_ticket {Paid, Used}
//!                      │                                   │
//!                      └─ cancel / expiry                  └─ cancel (refund)
//!                         {Cancelled, Unissued}               {Cancelled, Refunded}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let core = BookingCore::builder().config(BookingConfig::from_env()).build()?;
//! core.schedule_screening(screening).await?;
//!
//! let handle = core.lock_seats_default(screening_id, vec![SeatRef::new(3, 4)]).await?;
//! let order = core.create_order(user_id, handle, PaymentMethod::Alipay).await?;
//! let order = core.pay(order.id, PaymentMethod::Alipay).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod app;
pub mod codes;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod payment_gateway;
pub mod sweeper;
pub mod types;

pub use app::{BookingCore, BookingCoreBuilder};
pub use codes::RandomCodeGenerator;
pub use config::BookingConfig;
pub use error::{BookingError, BookingResult};
pub use events::BookingEvent;
pub use payment_gateway::{MockPaymentGateway, PaymentGateway, PaymentGatewayError};
pub use sweeper::{ExpirationSweeper, SweepReport, SweeperHandle};
pub use types::*;
