//! Classbook Admission Demo
//!
//! Walks through a small class session with in-memory stores:
//! - Three students race for two seats
//! - A cancellation frees a seat for the student who missed out
//! - A student with a lapsed membership is turned away
//! - Viability is decided at the cutoff
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=classbook=debug cargo run --bin classbook-demo
//! ```

use chrono::{Duration, Utc};
use classbook_admission::{
    AdmissionConfig, AdmissionEngine, InMemoryMembershipStore, InMemoryRecordStore,
    TracingNotifier, metrics,
};
use classbook_core::environment::SystemClock;
use classbook_core::ports::MembershipStore;
use classbook_core::types::{
    Capacity, CenterId, ClassSession, InstructorId, MembershipWindow, StudentId,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classbook=info,classbook_admission=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prometheus = metrics::install_prometheus_recorder()?;
    let config = AdmissionConfig::from_env();

    println!("\n============================================");
    println!("   Classbook - Admission Demo");
    println!("============================================\n");

    let records = Arc::new(InMemoryRecordStore::new());
    let memberships = Arc::new(InMemoryMembershipStore::new());
    let membership_store: Arc<dyn MembershipStore> = memberships.clone();
    let engine = Arc::new(AdmissionEngine::new(
        config,
        records,
        membership_store,
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
    ));

    let now = Utc::now();
    let center = CenterId::new();
    let session = ClassSession::new(
        "Sunrise Spin",
        "cycling",
        center,
        InstructorId::new(),
        now + Duration::hours(6),
        Capacity::new(1, 2)?,
    );
    let session_id = session.id;
    engine.register_session(session).await?;
    let sweeper = engine.spawn_sweeper(session_id);

    let [ana, ben, cleo, dev] = [(); 4].map(|()| StudentId::new());
    for student in [ana, ben, cleo] {
        memberships.insert(MembershipWindow::for_duration(
            student,
            center,
            "monthly",
            now - Duration::days(3),
            30,
        ));
    }
    memberships.insert(MembershipWindow::for_duration(
        dev,
        center,
        "monthly",
        now - Duration::days(45),
        30,
    ));

    // Step 1: three students race for two seats
    println!("1. Ana, Ben and Cleo book concurrently (2 seats)...");
    let requests = [ana, ben, cleo].map(|student| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { (student, engine.request_reservation(student, session_id, now).await) })
    });
    let mut confirmed = Vec::new();
    let mut turned_away = Vec::new();
    for request in requests {
        let (student, outcome) = request.await?;
        let outcome = outcome?;
        println!("   {student}: {outcome:?}");
        match outcome.reservation_id() {
            Some(reservation_id) if outcome.is_confirmed() => confirmed.push(reservation_id),
            _ => turned_away.push(student),
        }
    }
    println!("   Seats: {:?}\n", engine.seat_status(session_id).await?);

    // Step 2: a cancellation frees a seat
    if let Some(reservation_id) = confirmed.first() {
        println!("2. {reservation_id} cancels...");
        println!("   {:?}", engine.cancel_reservation(*reservation_id, now).await?);
    }
    for student in turned_away {
        let outcome = engine.request_reservation(student, session_id, now).await?;
        println!("   Retry for {student}: {outcome:?}");
    }
    println!("   Seats: {:?}\n", engine.seat_status(session_id).await?);

    // Step 3: lapsed membership
    println!("3. Dev's membership lapsed two weeks ago...");
    println!("   {:?}", engine.request_reservation(dev, session_id, now).await?);
    println!("   Seats: {:?}\n", engine.seat_status(session_id).await?);

    // Step 4: viability
    let cutoff = now + Duration::hours(6) - engine.config().viability_cutoff();
    println!("4. Viability now: {}", engine.viability(session_id, now).await?);
    println!("   Viability at cutoff: {}\n", engine.viability(session_id, cutoff).await?);

    sweeper.shutdown().await;

    println!("Metrics snapshot:\n{}", prometheus.render());
    Ok(())
}
