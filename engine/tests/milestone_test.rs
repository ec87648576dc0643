//! Integration tests for milestone plans: partial captures, failure
//! handling, and how milestone payments interact with confirmation.

mod common;

use chrono::{Duration, Utc};
use common::*;
use escrow_engine::dispute::{DisputeType, ResolutionOutcome};
use escrow_engine::fees::TransactionType;
use escrow_engine::gateway::sandbox::GatewayOp;
use escrow_engine::gateway::GatewayError;
use escrow_engine::milestone::{MilestoneSpec, MilestoneStatus};
use escrow_engine::payout::PayoutPeriod;
use escrow_engine::transaction::{DeliveryInfo, PaymentStatus, Transaction, TransactionStatus};
use escrow_engine::EscrowError;

fn spec(title: &str, amount: u64) -> MilestoneSpec {
    MilestoneSpec {
        title: title.into(),
        description: format!("{} phase", title),
        amount,
        due_date: None,
        requirements: vec![],
        deliverables: vec![],
    }
}

async fn funded_with_plan(h: &Harness, amounts: &[u64]) -> Transaction {
    let total = amounts.iter().sum();
    let mut req = request(total, TransactionType::Service);
    req.milestones = Some(
        amounts
            .iter()
            .enumerate()
            .map(|(i, a)| spec(&format!("phase-{}", i + 1), *a))
            .collect(),
    );
    let tx = h.engine.create_transaction(req).await.unwrap();
    h.engine.fund_transaction(&tx.id, "card").await.unwrap()
}

async fn pay_milestones(h: &Harness, tx: &Transaction, sequences: &[u32]) {
    for seq in sequences {
        h.engine.complete_milestone(&tx.id, SELLER, *seq).await.unwrap();
        h.engine.approve_milestone(&tx.id, BUYER, *seq).await.unwrap();
    }
}

fn status_of(tx: &Transaction, seq: u32) -> MilestoneStatus {
    tx.milestones.as_ref().unwrap().get(seq).unwrap().status
}

#[tokio::test]
async fn mismatched_plan_rejected_before_hold() {
    let h = harness();
    let mut req = request(100_000, TransactionType::Service);
    req.milestones = Some(vec![spec("a", 50_000), spec("b", 49_999)]);

    let err = h.engine.create_transaction(req).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation { .. }));
    assert_eq!(h.gateway.calls(GatewayOp::CreateHold), 0);
}

#[tokio::test]
async fn approving_a_milestone_captures_its_amount() {
    let h = harness();
    let tx = funded_with_plan(&h, &[30_000, 70_000]).await;

    h.engine.start_milestone(&tx.id, SELLER, 1).await.unwrap();
    h.engine.complete_milestone(&tx.id, SELLER, 1).await.unwrap();
    let tx = h.engine.approve_milestone(&tx.id, BUYER, 1).await.unwrap();

    assert_eq!(status_of(&tx, 1), MilestoneStatus::Paid);
    assert_eq!(status_of(&tx, 2), MilestoneStatus::Pending);
    assert_eq!(tx.captured_amount, 30_000);
    assert_eq!(h.gateway.captured(&tx.hold_id), 30_000);
    assert_eq!(tx.payment_status, PaymentStatus::Held);
    assert_eq!(tx.status, TransactionStatus::Funded);
}

#[tokio::test]
async fn failed_milestone_capture_leaves_it_completed() {
    let h = harness();
    let tx = funded_with_plan(&h, &[30_000, 70_000]).await;
    h.engine.complete_milestone(&tx.id, SELLER, 1).await.unwrap();
    h.gateway
        .fail_once(GatewayOp::Capture, GatewayError::Declined("try again".into()));

    let err = h.engine.approve_milestone(&tx.id, BUYER, 1).await.unwrap_err();
    assert!(matches!(err, EscrowError::Gateway(_)));

    let stored = h.engine.get_transaction(&tx.id).unwrap();
    assert_eq!(status_of(&stored, 1), MilestoneStatus::Completed);
    assert_eq!(stored.captured_amount, 0);

    let tx = h.engine.approve_milestone(&tx.id, BUYER, 1).await.unwrap();
    assert_eq!(status_of(&tx, 1), MilestoneStatus::Paid);
}

#[tokio::test]
async fn only_the_right_party_moves_milestones() {
    let h = harness();
    let tx = funded_with_plan(&h, &[10_000]).await;

    assert!(matches!(
        h.engine.complete_milestone(&tx.id, BUYER, 1).await,
        Err(EscrowError::AccessDenied { .. })
    ));
    h.engine.complete_milestone(&tx.id, SELLER, 1).await.unwrap();
    assert!(matches!(
        h.engine.approve_milestone(&tx.id, SELLER, 1).await,
        Err(EscrowError::AccessDenied { .. })
    ));
}

#[tokio::test]
async fn confirmation_captures_only_the_remainder() {
    let h = harness();
    let tx = funded_with_plan(&h, &[25_000, 75_000]).await;
    h.engine.complete_milestone(&tx.id, SELLER, 1).await.unwrap();
    h.engine.approve_milestone(&tx.id, BUYER, 1).await.unwrap();
    h.engine
        .mark_delivered(&tx.id, SELLER, DeliveryInfo::default())
        .await
        .unwrap();

    let tx = h.engine.confirm_delivery(&tx.id, BUYER, None).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.captured_amount, 100_000);
    assert_eq!(h.gateway.captured(&tx.hold_id), 100_000);
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 2);
    assert!(tx.milestones.as_ref().unwrap().all_paid());
}

#[tokio::test]
async fn last_milestone_after_delivery_completes_transaction() {
    let h = harness();
    let tx = funded_with_plan(&h, &[40_000, 60_000]).await;
    for seq in [1, 2] {
        h.engine.complete_milestone(&tx.id, SELLER, seq).await.unwrap();
    }
    h.engine.approve_milestone(&tx.id, BUYER, 1).await.unwrap();
    h.engine
        .mark_delivered(&tx.id, SELLER, DeliveryInfo::default())
        .await
        .unwrap();

    let tx = h.engine.approve_milestone(&tx.id, BUYER, 2).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.payment_status, PaymentStatus::Released);
    assert_eq!(h.engine.reputation().get(SELLER).unwrap().successful_transactions, 1);

    // Nothing left to capture, nothing left to confirm.
    assert!(matches!(
        h.engine.confirm_delivery(&tx.id, BUYER, None).await,
        Err(EscrowError::InvalidState { .. })
    ));
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 2);
}

#[tokio::test]
async fn all_paid_before_delivery_confirms_without_capture() {
    let h = harness();
    let tx = funded_with_plan(&h, &[50_000, 50_000]).await;
    for seq in [1, 2] {
        h.engine.complete_milestone(&tx.id, SELLER, seq).await.unwrap();
        h.engine.approve_milestone(&tx.id, BUYER, seq).await.unwrap();
    }
    let tx = h.engine.get_transaction(&tx.id).unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Released);
    assert_eq!(tx.status, TransactionStatus::Funded);

    h.engine
        .mark_delivered(&tx.id, SELLER, DeliveryInfo::default())
        .await
        .unwrap();
    let tx = h.engine.confirm_delivery(&tx.id, BUYER, None).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 2);
}

#[tokio::test]
async fn plan_can_be_attached_after_creation() {
    let h = harness();
    let tx = funded(&h, 90_000).await;
    let tx = h
        .engine
        .create_milestone_plan(&tx.id, BUYER, vec![spec("one", 45_000), spec("two", 45_000)])
        .await
        .unwrap();
    assert_eq!(tx.milestones.as_ref().unwrap().len(), 2);

    h.engine.start_milestone(&tx.id, SELLER, 1).await.unwrap();
    let err = h
        .engine
        .create_milestone_plan(&tx.id, BUYER, vec![spec("all", 90_000)])
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState { .. }));
}

// ---------------------------------------------------------------------------
// Paid milestones and early exits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_after_partial_payment_refunds_the_rest() {
    let h = harness();
    let tx = funded_with_plan(&h, &[30_000, 70_000]).await;
    pay_milestones(&h, &tx, &[1]).await;

    let tx = h
        .engine
        .cancel_transaction(&tx.id, SELLER, "cannot finish phase two")
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Cancelled);
    assert_eq!(tx.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(tx.captured_amount, 30_000);
    assert_eq!(h.gateway.captured(&tx.hold_id), 30_000);
    assert!(h.gateway.is_refunded(&tx.hold_id));
    assert_eq!(h.gateway.calls(GatewayOp::Refund), 1);

    // The captured phase still reaches the seller.
    let outcome = h
        .engine
        .run_payout(SELLER, PayoutPeriod::Weekly, Utc::now())
        .await
        .unwrap();
    assert!(outcome.payout_processed);
    assert_eq!(outcome.earnings, tx.seller_earnings());
    assert_eq!(outcome.payout.unwrap().transaction_ids, vec![tx.id.clone()]);
}

#[tokio::test]
async fn fully_paid_plan_cannot_be_cancelled() {
    let h = harness();
    let tx = funded_with_plan(&h, &[50_000, 50_000]).await;
    pay_milestones(&h, &tx, &[1, 2]).await;

    let err = h
        .engine
        .cancel_transaction(&tx.id, SELLER, "done anyway")
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState { .. }));
    assert_eq!(h.gateway.calls(GatewayOp::Refund), 0);

    let stored = h.engine.get_transaction(&tx.id).unwrap();
    assert_eq!(stored.status, TransactionStatus::Funded);
    assert_eq!(stored.payment_status, PaymentStatus::Released);
}

#[tokio::test]
async fn delivery_expiry_skips_a_fully_paid_plan() {
    let h = harness();
    let tx = funded_with_plan(&h, &[50_000, 50_000]).await;
    pay_milestones(&h, &tx, &[1, 2]).await;

    let report = h.engine.sweep(Utc::now() + Duration::days(8)).await.unwrap();
    assert!(report.deliveries_expired.is_empty());
    assert!(report.failures.is_empty());
    assert_eq!(h.gateway.calls(GatewayOp::Refund), 0);

    let stored = h.engine.get_transaction(&tx.id).unwrap();
    assert_eq!(stored.status, TransactionStatus::Funded);
    assert_eq!(stored.captured_amount, 100_000);
}

#[tokio::test]
async fn delivery_expiry_after_partial_payment_refunds_the_rest() {
    let h = harness();
    let tx = funded_with_plan(&h, &[40_000, 60_000]).await;
    pay_milestones(&h, &tx, &[1]).await;

    let report = h.engine.sweep(Utc::now() + Duration::days(8)).await.unwrap();
    assert_eq!(report.deliveries_expired, vec![tx.id.clone()]);

    let stored = h.engine.get_transaction(&tx.id).unwrap();
    assert_eq!(stored.status, TransactionStatus::Cancelled);
    assert_eq!(stored.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(h.gateway.captured(&tx.hold_id), 40_000);
    assert!(h.gateway.is_refunded(&tx.hold_id));
}

#[tokio::test]
async fn refund_ruling_after_partial_payment_returns_only_the_rest() {
    let h = harness();
    let tx = funded_with_plan(&h, &[40_000, 60_000]).await;
    pay_milestones(&h, &tx, &[1]).await;
    let dispute = h
        .engine
        .open_dispute(&tx.id, dispute_request(BUYER, DisputeType::NonDelivery))
        .await
        .unwrap();

    let tx = h
        .engine
        .resolve_dispute(&dispute.id, MEDIATOR, ResolutionOutcome::RefundToBuyer, String::new())
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Refunded);
    assert_eq!(tx.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(tx.captured_amount, 40_000);
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 1);
    assert_eq!(h.gateway.calls(GatewayOp::Refund), 1);
}

#[tokio::test]
async fn refund_ruling_on_a_fully_paid_plan_is_rejected() {
    let h = harness();
    let tx = funded_with_plan(&h, &[40_000, 60_000]).await;
    pay_milestones(&h, &tx, &[1, 2]).await;
    let dispute = h
        .engine
        .open_dispute(&tx.id, dispute_request(BUYER, DisputeType::QualityIssue))
        .await
        .unwrap();

    let err = h
        .engine
        .resolve_dispute(&dispute.id, MEDIATOR, ResolutionOutcome::RefundToBuyer, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState { .. }));
    assert_eq!(h.gateway.calls(GatewayOp::Refund), 0);

    // Releasing has nothing left to capture and closes the case.
    let tx = h
        .engine
        .resolve_dispute(&dispute.id, MEDIATOR, ResolutionOutcome::ReleaseToSeller, String::new())
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(h.gateway.calls(GatewayOp::Capture), 2);
}

#[tokio::test]
async fn split_ruling_after_partial_payment_divides_the_remainder() {
    let h = harness();
    let tx = funded_with_plan(&h, &[20_000, 80_000]).await;
    pay_milestones(&h, &tx, &[1]).await;
    let dispute = h
        .engine
        .open_dispute(&tx.id, dispute_request(SELLER, DisputeType::Other("scope".into())))
        .await
        .unwrap();

    let tx = h
        .engine
        .resolve_dispute(
            &dispute.id,
            MEDIATOR,
            ResolutionOutcome::Split { seller_share_bps: 2_500 },
            String::new(),
        )
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.payment_status, PaymentStatus::PartiallyRefunded);
    assert_eq!(tx.captured_amount, 40_000);
    assert_eq!(h.gateway.captured(&tx.hold_id), 40_000);
    assert!(h.gateway.is_refunded(&tx.hold_id));
    assert_eq!(h.gateway.calls(GatewayOp::Refund), 1);
}
