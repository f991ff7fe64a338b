//! Cinema Booking Demo
//!
//! Walks one screening through the booking flow:
//! - Scheduling a screening and locking seats
//! - Seat conflicts between competing customers
//! - Order creation, payment and ticket verification
//! - Refunding a paid order
//! - Group ticket purchase and redemption
//! - Expiration sweeping in the background
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin demo
//! ```

use chrono::{Duration as ChronoDuration, Utc};
use cinema_booking::{
    BookingConfig, BookingCore, CinemaId, ExpirationSweeper, GroupTicketKind, GroupTicketType,
    GroupTicketTypeId, HallId, Money, MovieId, PaymentMethod, Screening, ScreeningId, SeatRef,
    UserId, metrics::register_business_metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cinema_booking=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    register_business_metrics();

    println!("\n🎬 ============================================");
    println!("   Cinema Booking - Live Demo");
    println!("============================================\n");

    let config = BookingConfig::from_env();
    let core = Arc::new(BookingCore::builder().config(config).build()?);
    let sweeper = ExpirationSweeper::new(Arc::clone(&core)).spawn();

    // ========== Screening ==========

    let movie_id = MovieId::new();
    let cinema_id = CinemaId::new();
    let screening = Screening {
        id: ScreeningId::new(),
        movie_id,
        cinema_id,
        hall_id: HallId::new(),
        starts_at: Utc::now() + ChronoDuration::days(2),
        ticket_price: Money::from_cents(4_500),
        rows: 8,
        cols: 12,
    };
    let screening_id = screening.id;

    println!("1️⃣  Scheduling screening (8 rows x 12 seats)...");
    let counts = core.schedule_screening(screening).await?;
    println!("   ✓ {} seats on sale\n", counts.available);

    // ========== Seat conflict ==========

    let alice = UserId::new();
    let bob = UserId::new();

    println!("2️⃣  Alice locks r4-c6 and r4-c7...");
    let handle = core
        .lock_seats_default(screening_id, vec![SeatRef::new(4, 6), SeatRef::new(4, 7)])
        .await?;
    println!("   ✓ Held until {}", handle.expires_at());

    println!("   Bob tries r4-c7 and r4-c8...");
    match core
        .lock_seats_default(screening_id, vec![SeatRef::new(4, 7), SeatRef::new(4, 8)])
        .await
    {
        Ok(_) => println!("   ✗ Bob should not have got r4-c7"),
        Err(error) => println!("   ✓ Refused: {error}"),
    }
    println!();

    // ========== Order, payment, verification ==========

    println!("3️⃣  Alice orders and pays with Alipay...");
    let order = core.create_order(alice, handle, PaymentMethod::Alipay).await?;
    println!("   Order {} for {}", order.order_number, order.amount);
    let order = core.pay(order.id, PaymentMethod::Alipay).await?;
    println!("   ✓ {:?}", order.state());

    let tickets = core.tickets_for_order(order.id).await;
    for ticket in &tickets {
        println!("   🎟  {} → {}", ticket.code, ticket.seat);
    }

    if let Some(ticket) = tickets.first() {
        println!("\n4️⃣  Verifying {} at the entrance...", ticket.code);
        let admitted = core.verify_ticket(ticket.code.as_str()).await?;
        println!("   ✓ Admitted to seat {}", admitted.seat);
        match core.verify_ticket(ticket.code.as_str()).await {
            Ok(_) => println!("   ✗ Second scan should fail"),
            Err(error) => println!("   ✓ Second scan refused: {error}"),
        }
    }
    println!();

    // ========== Refund ==========

    println!("5️⃣  Bob books r1-c1 and asks for a refund...");
    let handle = core
        .lock_seats_default(screening_id, vec![SeatRef::new(1, 1)])
        .await?;
    let order = core.create_order(bob, handle, PaymentMethod::WeChatPay).await?;
    core.pay(order.id, PaymentMethod::WeChatPay).await?;
    let (order, refund) = core.cancel_order(order.id).await?;
    println!("   ✓ {:?}", order.state());
    if let Some(refund) = refund {
        println!("   ✓ Refunded {} ({:?})", refund.amount, refund.status);
    }
    println!(
        "   Seats available again: {}\n",
        core.available_count(screening_id).await?
    );

    // ========== Group tickets ==========

    println!("6️⃣  Selling a family pack...");
    let type_id = GroupTicketTypeId::new();
    core.register_group_ticket_type(GroupTicketType {
        id: type_id,
        kind: GroupTicketKind::Family,
        name: "Family Pack".to_string(),
        movie_id,
        cinema_id,
        unit_price: Money::from_cents(3_500),
        min_quantity: 2,
        max_quantity: 6,
        valid_until: (Utc::now() + ChronoDuration::days(30)).date_naive(),
        stock: 20,
        active: true,
    })
    .await?;

    let purchase = core
        .purchase_group_ticket(bob, type_id, 3, PaymentMethod::CreditCard)
        .await?;
    println!(
        "   ✓ Bob bought {} tickets for {} ({} left)",
        purchase.ticket_count,
        purchase.total_price,
        core.group_ticket_stock(type_id).await?
    );

    let order = core
        .redeem_group_ticket(
            purchase.id,
            screening_id,
            vec![SeatRef::new(6, 1), SeatRef::new(6, 2), SeatRef::new(6, 3)],
        )
        .await?;
    println!(
        "   ✓ Redeemed into order {} with {} codes\n",
        order.order_number,
        core.tickets_for_order(order.id).await.len()
    );

    // ========== Summary ==========

    let counts = core.screening_counts(screening_id).await?;
    println!("📊 Screening: {} available, {} locked, {} sold", counts.available, counts.locked, counts.sold);
    if let Some(membership) = core.membership(alice, cinema_id).await {
        println!("📊 Alice: {} points ({:?})", membership.points, membership.level);
    }

    sweeper.shutdown().await;
    core.shutdown(Duration::from_secs(5)).await?;

    println!("\n✓ Demo complete\n");
    Ok(())
}
