//! Domain types for the cinema booking core.
//!
//! Identifiers, money, the seat grid of a screening, orders, refunds, group
//! tickets, verification tickets and memberships.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a screening (one showing of a movie in a hall)
    ScreeningId
);
uuid_id!(
    /// Unique identifier for a movie
    MovieId
);
uuid_id!(
    /// Unique identifier for a cinema
    CinemaId
);
uuid_id!(
    /// Unique identifier for a hall inside a cinema
    HallId
);
uuid_id!(
    /// Unique identifier for a customer
    UserId
);
uuid_id!(
    /// Unique identifier for an order
    OrderId
);
uuid_id!(
    /// Unique identifier for a seat lock; doubles as the lock holder
    SeatLockId
);
uuid_id!(
    /// Unique identifier for a group ticket type
    GroupTicketTypeId
);
uuid_id!(
    /// Unique identifier for a purchased group ticket
    PurchasedTicketId
);
uuid_id!(
    /// Unique identifier for a refund record
    RefundId
);

// ============================================================================
// Money
// ============================================================================

/// Monetary amount in cents (fen)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole yuan, `None` on overflow
    #[must_use]
    pub const fn checked_from_yuan(yuan: u64) -> Option<Self> {
        match yuan.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Multiplies by a quantity with overflow checking
    #[must_use]
    pub const fn checked_mul(self, quantity: u64) -> Option<Self> {
        match self.0.checked_mul(quantity) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// `percent`% of this amount in cents, rounded down
    #[must_use]
    pub const fn percent(self, percent: u32) -> u64 {
        self.0.saturating_mul(percent as u64) / 100
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "¥{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Screenings and seats
// ============================================================================

/// A seat in a hall, addressed by 1-based row and column
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeatRef {
    /// Row number, starting at 1
    pub row: u16,
    /// Column number, starting at 1
    pub col: u16,
}

impl SeatRef {
    /// Creates a seat reference
    #[must_use]
    pub const fn new(row: u16, col: u16) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for SeatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.row, self.col)
    }
}

/// One showing of a movie in a hall
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screening {
    /// Screening ID
    pub id: ScreeningId,
    /// Movie being shown
    pub movie_id: MovieId,
    /// Cinema the hall belongs to
    pub cinema_id: CinemaId,
    /// Hall the screening takes place in
    pub hall_id: HallId,
    /// Start time
    pub starts_at: DateTime<Utc>,
    /// Price of one seat
    pub ticket_price: Money,
    /// Number of seat rows
    pub rows: u16,
    /// Number of seats per row
    pub cols: u16,
}

impl Screening {
    /// Total number of seats
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.rows as u32 * self.cols as u32
    }

    /// Whether the seat exists in this hall
    #[must_use]
    pub const fn contains(&self, seat: SeatRef) -> bool {
        seat.row >= 1 && seat.row <= self.rows && seat.col >= 1 && seat.col <= self.cols
    }

    /// Every seat of the hall in row-major order
    pub fn seats(&self) -> impl Iterator<Item = SeatRef> + '_ {
        (1..=self.rows).flat_map(move |row| (1..=self.cols).map(move |col| SeatRef::new(row, col)))
    }
}

/// State of a single seat
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeatState {
    /// Free to lock
    Available,
    /// Held by a lock until `expires_at`
    Locked {
        /// Holder
        lock_id: SeatLockId,
        /// Hold deadline
        expires_at: DateTime<Utc>,
    },
    /// Paid for under a lock
    Sold {
        /// Lock the sale went through
        lock_id: SeatLockId,
    },
}

impl SeatState {
    /// Whether the seat can be locked
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// The lock holding or owning this seat, if any
    #[must_use]
    pub const fn holder(&self) -> Option<SeatLockId> {
        match self {
            Self::Available => None,
            Self::Locked { lock_id, .. } | Self::Sold { lock_id } => Some(*lock_id),
        }
    }

    /// Public view of the seat, without holder details
    #[must_use]
    pub const fn availability(&self) -> SeatAvailability {
        match self {
            Self::Available => SeatAvailability::Available,
            Self::Locked { .. } => SeatAvailability::Locked,
            Self::Sold { .. } => SeatAvailability::Sold,
        }
    }
}

/// Seat status as shown on a seat map
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeatAvailability {
    /// Can be selected
    Available,
    /// Temporarily held by another customer
    Locked,
    /// Already sold
    Sold,
}

/// Seat map of a screening
pub type SeatMap = BTreeMap<SeatRef, SeatAvailability>;

/// Opaque proof of a seat hold
///
/// Only the seat inventory creates handles; callers pass them back to
/// create an order or release the hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatLockHandle {
    lock_id: SeatLockId,
    screening_id: ScreeningId,
    seats: Vec<SeatRef>,
    expires_at: DateTime<Utc>,
}

impl SeatLockHandle {
    pub(crate) const fn new(
        lock_id: SeatLockId,
        screening_id: ScreeningId,
        seats: Vec<SeatRef>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lock_id,
            screening_id,
            seats,
            expires_at,
        }
    }

    /// Lock identifier
    #[must_use]
    pub const fn lock_id(&self) -> SeatLockId {
        self.lock_id
    }

    /// Screening the seats belong to
    #[must_use]
    pub const fn screening_id(&self) -> ScreeningId {
        self.screening_id
    }

    /// Held seats, sorted
    #[must_use]
    pub fn seats(&self) -> &[SeatRef] {
        &self.seats
    }

    /// Hold deadline
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Seat counts of a screening, derived from seat states
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatCounts {
    /// Total seats
    pub capacity: u32,
    /// Free seats
    pub available: u32,
    /// Held seats
    pub locked: u32,
    /// Sold seats
    pub sold: u32,
}

impl SeatCounts {
    /// `available + locked + sold == capacity`
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.available + self.locked + self.sold == self.capacity
    }
}

// ============================================================================
// Orders
// ============================================================================

/// How an order was (or will be) paid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// Bank card
    CreditCard,
    /// WeChat Pay
    WeChatPay,
    /// Alipay
    Alipay,
    /// Covered by a prepaid group ticket
    GroupTicket,
}

impl PaymentMethod {
    /// Whether the payment goes through the external gateway
    #[must_use]
    pub const fn uses_gateway(&self) -> bool {
        !matches!(self, Self::GroupTicket)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreditCard => "credit_card",
            Self::WeChatPay => "wechat_pay",
            Self::Alipay => "alipay",
            Self::GroupTicket => "group_ticket",
        };
        f.write_str(name)
    }
}

/// Payment status of an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Awaiting payment
    Pending,
    /// Paid
    Paid,
    /// Cancelled (by the customer, by expiry or by a failed payment)
    Cancelled,
}

/// Status of the tickets of an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    /// No tickets issued yet
    Unissued,
    /// Verification codes issued
    Issued,
    /// At least one code redeemed at the entrance
    Used,
    /// Tickets refunded
    Refunded,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where an order came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseSource {
    /// Regular seat purchase
    Regular,
    /// Redemption of a purchased group ticket
    GroupTicket {
        /// The redeemed group ticket
        purchased_ticket: PurchasedTicketId,
    },
}

/// A ticket order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order ID
    pub id: OrderId,
    /// Human readable order number (`ORD<millis><8 hex>`)
    pub order_number: String,
    /// Customer
    pub user_id: UserId,
    /// Screening
    pub screening_id: ScreeningId,
    /// Cinema of the screening
    pub cinema_id: CinemaId,
    /// Start of the screening
    pub screening_starts_at: DateTime<Utc>,
    /// Ordered seats
    pub seats: Vec<SeatRef>,
    /// Seat hold backing this order
    pub lock: SeatLockHandle,
    /// Regular purchase or group ticket redemption
    pub source: PurchaseSource,
    /// Payment method chosen at creation, replaced by the one used at payment
    pub payment_method: PaymentMethod,
    /// Price × seat count, fixed at creation
    pub amount: Money,
    /// Payment status
    pub status: OrderStatus,
    /// Ticket status
    pub ticket_status: TicketStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Unpaid orders are cancelled after this instant
    pub payment_deadline: DateTime<Utc>,
    /// Payment time
    pub paid_at: Option<DateTime<Utc>>,
    /// Cancellation time
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Gateway transaction reference
    pub payment_reference: Option<String>,
}

impl Order {
    /// `(status, ticket_status)`
    #[must_use]
    pub const fn state(&self) -> (OrderStatus, TicketStatus) {
        (self.status, self.ticket_status)
    }

    /// Whether the order awaits payment
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == (OrderStatus::Pending, TicketStatus::Unissued)
    }

    /// Whether the order reached a state it can never leave
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, OrderStatus::Cancelled)
            || matches!(self.ticket_status, TicketStatus::Used)
    }
}

/// Outcome of a refund through the gateway
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundStatus {
    /// Money returned
    Completed,
    /// Gateway refused; needs manual follow-up
    Failed {
        /// Gateway message
        reason: String,
    },
}

/// Record of money returned for a cancelled paid order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    /// Refund ID
    pub id: RefundId,
    /// Refunded order
    pub order_id: OrderId,
    /// Refunded amount
    pub amount: Money,
    /// Method the money goes back to
    pub method: PaymentMethod,
    /// Gateway outcome
    pub status: RefundStatus,
    /// Gateway refund reference
    pub gateway_reference: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Group tickets
// ============================================================================

/// Kind of prepaid group ticket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupTicketKind {
    /// Student ticket
    Student,
    /// Parent-child ticket
    Family,
    /// Organisation group ticket
    Group,
}

impl fmt::Display for GroupTicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Student => "student",
            Self::Family => "family",
            Self::Group => "group",
        };
        f.write_str(name)
    }
}

/// A group ticket offer with finite stock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTicketType {
    /// Type ID
    pub id: GroupTicketTypeId,
    /// Kind
    pub kind: GroupTicketKind,
    /// Display name
    pub name: String,
    /// Movie the tickets are valid for
    pub movie_id: MovieId,
    /// Cinema the tickets are valid in
    pub cinema_id: CinemaId,
    /// Price per person
    pub unit_price: Money,
    /// Smallest party size
    pub min_quantity: u32,
    /// Largest party size
    pub max_quantity: u32,
    /// Last day the type can be bought
    pub valid_until: NaiveDate,
    /// Remaining units
    pub stock: u32,
    /// Whether the type is on sale
    pub active: bool,
}

impl GroupTicketType {
    /// Whether `now` is past the last valid day
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.date_naive() > self.valid_until
    }
}

/// Redemption progress of a purchased group ticket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Redemption {
    /// Not yet redeemed
    Available,
    /// A redemption is running
    InProgress,
    /// Redeemed into an order
    Redeemed {
        /// Resulting order
        order_id: OrderId,
    },
}

/// A group ticket bought by a customer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchasedGroupTicket {
    /// Purchase ID
    pub id: PurchasedTicketId,
    /// Type bought
    pub type_id: GroupTicketTypeId,
    /// Buyer
    pub user_id: UserId,
    /// Movie the ticket is valid for
    pub movie_id: MovieId,
    /// Cinema the ticket is valid in
    pub cinema_id: CinemaId,
    /// Number of people covered
    pub ticket_count: u32,
    /// Price paid
    pub total_price: Money,
    /// Purchase time
    pub purchased_at: DateTime<Utc>,
    /// Redemption progress
    pub redemption: Redemption,
}

// ============================================================================
// Verification
// ============================================================================

/// Code shown at the cinema entrance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerificationCode(String);

impl VerificationCode {
    /// Wraps a code
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The code as text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VerificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Single-use admission for one seat of a paid order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTicket {
    /// Code
    pub code: VerificationCode,
    /// Order the seat was bought in
    pub order_id: OrderId,
    /// Ticket holder
    pub user_id: UserId,
    /// Screening
    pub screening_id: ScreeningId,
    /// Seat
    pub seat: SeatRef,
    /// Start of the screening
    pub screening_starts_at: DateTime<Utc>,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Set once, when the code is redeemed
    pub used: bool,
    /// Redemption time
    pub used_at: Option<DateTime<Utc>>,
    /// Set when the order is refunded
    pub revoked: bool,
}

/// Result of a successful verification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedSeat {
    /// Redeemed code
    pub code: VerificationCode,
    /// Order
    pub order_id: OrderId,
    /// Screening
    pub screening_id: ScreeningId,
    /// Seat to show the guest to
    pub seat: SeatRef,
}

// ============================================================================
// Membership
// ============================================================================

/// Points needed for Silver
pub const SILVER_POINTS: u64 = 1_000;
/// Points needed for Gold
pub const GOLD_POINTS: u64 = 5_000;

/// Member tier, derived from points
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MembershipLevel {
    /// Default tier
    Regular,
    /// 1000+ points
    Silver,
    /// 5000+ points
    Gold,
}

impl MembershipLevel {
    /// Tier for a point balance
    #[must_use]
    pub const fn from_points(points: u64) -> Self {
        if points >= GOLD_POINTS {
            Self::Gold
        } else if points >= SILVER_POINTS {
            Self::Silver
        } else {
            Self::Regular
        }
    }
}

/// Loyalty account of a customer at one cinema
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Customer
    pub user_id: UserId,
    /// Cinema
    pub cinema_id: CinemaId,
    /// Point balance, never decreases
    pub points: u64,
    /// Tier
    pub level: MembershipLevel,
    /// Last accrual
    pub updated_at: DateTime<Utc>,
}
