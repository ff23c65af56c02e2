//! Two-Tab Synchronization Demo
//!
//! Walks through the full lifecycle with two simulated tabs sharing one
//! origin: caching, cross-tab hits, version bumps, revocation, and a
//! scheduled refresh.
//!
//! Usage:
//!   cargo run --example two_tab_demo

use std::time::Duration;

use serde_json::{json, Value};
use tabsync::{
    Broadcaster, CacheManager, GetOptions, MidnightScheduler, Origin, RevocationLedger,
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("=== Two-Tab Synchronization Demo ===");

    let origin = Origin::in_memory();

    let tab_a = origin.attach();
    let broadcaster_a = Broadcaster::new(&tab_a);
    let cache_a = CacheManager::new(tab_a.clone(), broadcaster_a);

    let tab_b = origin.attach();
    let broadcaster_b = Broadcaster::new(&tab_b);
    let cache_b = CacheManager::new(tab_b.clone(), broadcaster_b.clone());

    info!("\n--- Cache Fill (tab A) ---");
    let fetched = cache_a
        .get::<Value, _, _>(
            "shifts",
            || async {
                info!("  (pretending to hit the backend)");
                Ok(json!({"monday": ["ada", "grace"], "tuesday": ["linus"]}))
            },
            Duration::from_secs(600),
            GetOptions::default(),
        )
        .await?;
    info!("Tab A got {} from {}", fetched.data, fetched.source);

    info!("\n--- Cache Hit (tab B, no fetch) ---");
    let fetched = cache_b
        .get::<Value, _, _>(
            "shifts",
            || async {
                info!("  (this fetch should never run)");
                Ok(json!(null))
            },
            Duration::from_secs(600),
            GetOptions::default(),
        )
        .await?;
    info!("Tab B got {} from {}", fetched.data, fetched.source);

    info!("\n--- Cross-Tab Notification ---");
    let _sub = broadcaster_b.subscribe("shifts", |update| {
        info!(
            "Tab B notified: shifts now at version {} (written {})",
            update.version, update.as_of
        );
    });

    info!("\n--- Version Bump (tab A edits, every tab refetches) ---");
    cache_a.bump_version("shifts").await;
    let fetched = cache_a
        .get::<Value, _, _>(
            "shifts",
            || async { Ok(json!({"monday": ["ada"], "tuesday": ["linus", "grace"]})) },
            Duration::from_secs(600),
            GetOptions::default(),
        )
        .await?;
    info!("Tab A refetched version {}", fetched.version);

    // Give tab B's listener a moment to pick up the store event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Tab B watermark is now {}", cache_b.version_watermark("shifts"));

    info!("\n--- Session Revocation ---");
    let ledger_a = RevocationLedger::new(tab_a.clone()).await;
    let ledger_b = RevocationLedger::new(tab_b.clone()).await;
    let _revocation_sub = ledger_b.on_revocation(|uid| {
        info!("Tab B signing out session '{}'", uid);
    });

    ledger_a.revoke("session-42").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        "Tab B sees session-42 revoked: {}",
        ledger_b.is_revoked("session-42")
    );

    info!("\n--- Scheduled Refresh (compressed to 1s for the demo) ---");
    let scheduler = MidnightScheduler::new();
    let cache_for_timer = cache_a.clone();
    scheduler.schedule_at(
        "today_shifts",
        Duration::from_secs(1),
        Duration::from_secs(24 * 3600),
        move || {
            let cache = cache_for_timer.clone();
            async move {
                let fetched = cache
                    .refresh::<Value, _, _>(
                        "today_shifts",
                        || async { Ok(json!({"date": "rolled over"})) },
                        Duration::from_secs(24 * 3600),
                    )
                    .await?;
                info!("Timer refreshed today_shifts (version {})", fetched.version);
                Ok(())
            }
        },
    );
    tokio::time::sleep(Duration::from_millis(1200)).await;

    info!("\n--- Statistics ---");
    info!("Tab A: {}", cache_a.stats());
    info!("Tab B: {}", cache_b.stats());

    info!("\n=== Demo Complete ===");
    Ok(())
}
