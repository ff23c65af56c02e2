//! Integration tests for cross-tab session revocation
//!
//! Covers the full path a sign-out takes: one tab writes the ledger, every
//! other tab is told, reacts, and the revocation outlives a restart.

use std::time::Duration;

use serde_json::{json, Value};
use tabsync::{
    Broadcaster, CacheManager, GetOptions, LedgerConfig, Origin, RevocationLedger, LEDGER_KEY,
};

async fn eventually(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", description);
}

#[tokio::test]
async fn test_revocation_reaches_every_tab_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("origin.json");

    {
        let origin = Origin::with_file(&path).unwrap();
        let ledger_a = RevocationLedger::new(origin.attach()).await;
        let ledger_b = RevocationLedger::new(origin.attach()).await;

        ledger_a.revoke("session-9").await.unwrap();
        eventually("tab B sees the revocation", || {
            ledger_b.is_revoked("session-9")
        })
        .await;
    }

    // A freshly started client reads the persisted ledger at construction.
    let origin = Origin::with_file(&path).unwrap();
    let ledger = RevocationLedger::new(origin.attach()).await;
    assert!(ledger.is_revoked("session-9"));
}

#[tokio::test]
async fn test_revocation_callback_drives_sign_out_work() {
    let origin = Origin::in_memory();

    // Tab B: a cache manager with data, and a ledger wired to clear it.
    let tab_b = origin.attach();
    let broadcaster_b = Broadcaster::new(&tab_b);
    let manager_b = CacheManager::new(tab_b.clone(), broadcaster_b);
    manager_b
        .get::<Value, _, _>(
            "shifts",
            || async { Ok(json!("private")) },
            Duration::from_secs(600),
            GetOptions::default(),
        )
        .await
        .unwrap();

    let ledger_b = RevocationLedger::new(tab_b.clone()).await;
    let (signout_tx, mut signout_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let _sub = ledger_b.on_revocation(move |uid| {
        let _ = signout_tx.send(uid.to_string());
    });

    // Tab A signs the session out.
    let ledger_a = RevocationLedger::new(origin.attach()).await;
    ledger_a.revoke("session-1").await.unwrap();

    let uid = tokio::time::timeout(Duration::from_secs(2), signout_rx.recv())
        .await
        .expect("revocation callback never fired")
        .unwrap();
    assert_eq!(uid, "session-1");

    // The sign-out handler clears tab B's cached data.
    let removed = manager_b.clear().await.unwrap();
    assert_eq!(removed, 1);
    assert!(tab_b.load(LEDGER_KEY).await.is_some());
}

#[tokio::test]
async fn test_acknowledge_in_one_tab_clears_the_other() {
    let origin = Origin::in_memory();
    let ledger_a = RevocationLedger::new(origin.attach()).await;
    let ledger_b = RevocationLedger::new(origin.attach()).await;

    ledger_a.revoke("session-2").await.unwrap();
    eventually("tab B sees the revocation", || {
        ledger_b.is_revoked("session-2")
    })
    .await;

    ledger_b.acknowledge("session-2").await.unwrap();
    eventually("tab A sees the acknowledge", || {
        !ledger_a.is_revoked("session-2")
    })
    .await;
}

#[tokio::test]
async fn test_custom_retention_applies_across_tabs() {
    let origin = Origin::in_memory();
    let config = LedgerConfig::builder()
        .retention(Duration::from_millis(50))
        .build();
    let ledger_a = RevocationLedger::with_config(origin.attach(), config.clone())
        .await
        .unwrap();
    let ledger_b = RevocationLedger::with_config(origin.attach(), config)
        .await
        .unwrap();

    ledger_a.revoke("short-lived").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    // The entry is past retention but untouched until something writes.
    assert!(ledger_a.is_revoked("short-lived"));

    ledger_b.revoke("other").await.unwrap();
    eventually("expired entry pruned everywhere", || {
        !ledger_a.is_revoked("short-lived") && !ledger_b.is_revoked("short-lived")
    })
    .await;
    eventually("tab A sees the new revocation", || {
        ledger_a.is_revoked("other")
    })
    .await;
}
