//! Concurrency tests: competing writers on one transaction, stale writes
//! at the store, and many completions landing on one seller at once.

mod common;

use std::time::Duration;

use common::*;
use escrow_engine::dispute::DisputeType;
use escrow_engine::fees::TransactionType;
use escrow_engine::gateway::sandbox::GatewayOp;
use escrow_engine::transaction::{PaymentStatus, TransactionStatus};
use escrow_engine::EscrowError;
use futures::future::join_all;

fn is_conflict<T>(result: &Result<T, EscrowError>) -> bool {
    matches!(result, Err(EscrowError::ConcurrentModification { .. }))
}

// ---------------------------------------------------------------------------
// Competing writers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fund_and_cancel_race_has_one_winner() {
    let h = harness();
    let tx = h
        .engine
        .create_transaction(request(50_000, TransactionType::Service))
        .await
        .unwrap();
    h.gateway.delay(GatewayOp::ConfirmHold, Duration::from_millis(50));

    let (funded, cancelled) = tokio::join!(
        h.engine.fund_transaction(&tx.id, "card"),
        h.engine.cancel_transaction(&tx.id, BUYER, "changed my mind"),
    );

    assert!(funded.is_ok());
    assert!(is_conflict(&cancelled));

    let stored = h.engine.get_transaction(&tx.id).unwrap();
    assert_eq!(stored.status, TransactionStatus::Funded);
    assert_eq!(stored.payment_status, PaymentStatus::Held);
}

#[tokio::test]
async fn loser_can_retry_after_the_winner_commits() {
    let h = harness();
    let tx = delivered(&h, 30_000).await;
    h.gateway.delay(GatewayOp::Capture, Duration::from_millis(50));

    let (confirmed, disputed) = tokio::join!(
        h.engine.confirm_delivery(&tx.id, BUYER, None),
        h.engine
            .open_dispute(&tx.id, dispute_request(BUYER, DisputeType::NotAsDescribed)),
    );
    assert!(confirmed.is_ok());
    assert!(is_conflict(&disputed));

    // Retrying sees the committed state, not the conflict.
    let retried = h
        .engine
        .open_dispute(&tx.id, dispute_request(BUYER, DisputeType::NotAsDescribed))
        .await;
    assert!(matches!(retried, Err(EscrowError::InvalidState { .. })));
}

#[tokio::test]
async fn concurrent_confirms_capture_once() {
    let h = harness();
    let tx = delivered(&h, 20_000).await;
    h.gateway.delay(GatewayOp::Capture, Duration::from_millis(20));

    let results = join_all((0..5).map(|_| h.engine.confirm_delivery(&tx.id, BUYER, None))).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(results.iter().filter(|r| is_conflict(r)).count(), 4);
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 1);
    assert_eq!(h.gateway.captured(&tx.hold_id), 20_000);
}

// ---------------------------------------------------------------------------
// Store-level version checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_write_is_rejected_by_the_store() {
    let h = harness();
    let tx = funded(&h, 10_000).await;

    // Someone else commits first.
    let mut theirs = h.store.get_transaction(&tx.id).unwrap().unwrap();
    let read_version = theirs.version;
    theirs.version += 1;
    h.store.update_transaction(&theirs, read_version).unwrap();

    // Our write still carries the old version.
    let mut ours = tx.clone();
    ours.version += 1;
    let err: EscrowError = h
        .store
        .update_transaction(&ours, read_version)
        .unwrap_err()
        .into();
    assert!(matches!(err, EscrowError::ConcurrentModification { .. }));
}

// ---------------------------------------------------------------------------
// Shared reputation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_completions_all_reach_the_seller_record() {
    let h = harness();
    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(delivered(&h, 15_000).await.id);
    }

    let results = join_all(ids.iter().map(|id| h.engine.confirm_delivery(id, BUYER, None))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let seller = h.engine.reputation().get(SELLER).unwrap();
    assert_eq!(seller.total_transactions, 12);
    assert_eq!(seller.successful_transactions, 12);
    let buyer = h.engine.reputation().get(BUYER).unwrap();
    assert_eq!(buyer.successful_transactions, 12);
}

#[tokio::test]
async fn sweep_skips_transactions_held_by_a_writer() {
    let h = harness();
    let tx = delivered(&h, 10_000).await;
    h.gateway.delay(GatewayOp::Capture, Duration::from_millis(50));

    let later = chrono::Utc::now() + chrono::Duration::days(30);
    let (confirmed, report) = tokio::join!(
        h.engine.confirm_delivery(&tx.id, BUYER, None),
        async {
            // Let the confirm take the lock first.
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.engine.sweep(later).await
        },
    );

    assert!(confirmed.is_ok());
    let report = report.unwrap();
    assert!(report.auto_released.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].step, "auto_release");
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 1);
}
