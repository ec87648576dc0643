//! Deadline enforcement.
//!
//! The engine runs no timers. An external scheduler calls [`EscrowEngine::sweep`]
//! (or the individual operations) periodically. Each operation re-checks its
//! condition under the transaction lock and returns `Ok(false)` when there is
//! nothing to do, so overlapping or repeated sweeps are harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EscrowEngine;
use crate::error::EscrowResult;
use crate::gateway::EventKind;
use crate::transaction::{Transaction, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub transaction_id: String,
    pub step: String,
    pub error: String,
}

/// What one sweep did, by transaction id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub payments_expired: Vec<String>,
    pub deliveries_expired: Vec<String>,
    pub auto_released: Vec<String>,
    pub disputes_escalated: Vec<String>,
    pub refunds_settled: Vec<String>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn actions(&self) -> usize {
        self.payments_expired.len()
            + self.deliveries_expired.len()
            + self.auto_released.len()
            + self.disputes_escalated.len()
            + self.refunds_settled.len()
    }
}

fn past(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    deadline.map(|d| now >= d).unwrap_or(false)
}

impl EscrowEngine {
    /// Runs every deadline check against every open transaction.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EscrowResult<SweepReport> {
        let mut report = SweepReport::default();
        let candidates: Vec<Transaction> = self
            .store
            .list_transactions()?
            .into_iter()
            .filter(|tx| !tx.status.is_terminal() || tx.refund_pending)
            .collect();

        for tx in candidates {
            let id = tx.id.as_str();
            let (step, result) = match tx.status {
                TransactionStatus::PendingPayment if now >= tx.timeline.payment_deadline => {
                    ("expire_payment", self.expire_unpaid(id, now).await)
                }
                TransactionStatus::Funded
                    if past(tx.timeline.delivery_deadline, now) && tx.uncaptured_amount() > 0 =>
                {
                    ("expire_delivery", self.expire_undelivered(id, now).await)
                }
                TransactionStatus::Delivered if past(tx.timeline.auto_release_deadline, now) => {
                    ("auto_release", self.auto_release(id, now).await)
                }
                TransactionStatus::Disputed
                    if tx.active_dispute().map(|d| d.is_overdue(now)).unwrap_or(false) =>
                {
                    ("escalate_dispute", self.escalate_dispute(id, now).await)
                }
                _ if tx.refund_pending => ("retry_refund", self.retry_pending_refund(id).await),
                _ => continue,
            };

            match result {
                Ok(true) => {
                    let bucket = match step {
                        "expire_payment" => &mut report.payments_expired,
                        "expire_delivery" => &mut report.deliveries_expired,
                        "auto_release" => &mut report.auto_released,
                        "escalate_dispute" => &mut report.disputes_escalated,
                        _ => &mut report.refunds_settled,
                    };
                    bucket.push(tx.id.clone());
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(transaction_id = %tx.id, step, error = %err, "sweep step failed");
                    report.failures.push(SweepFailure {
                        transaction_id: tx.id.clone(),
                        step: step.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            actions = report.actions(),
            failures = report.failures.len(),
            "sweep finished"
        );
        Ok(report)
    }

    /// Cancels a transaction nobody paid for in time.
    pub async fn expire_unpaid(&self, id: &str, now: DateTime<Utc>) -> EscrowResult<bool> {
        let _guard = self.try_lock(id)?;
        let tx = self.load(id)?;
        if tx.status != TransactionStatus::PendingPayment || now < tx.timeline.payment_deadline {
            return Ok(false);
        }
        let mut next = tx;
        next.expire_payment(now)?;
        let tx = self.commit(next)?;
        self.notify_parties(&tx, EventKind::TransactionCancelled, "payment window expired")
            .await;
        Ok(true)
    }

    /// Refunds a funded transaction whose seller never delivered.
    pub async fn expire_undelivered(&self, id: &str, now: DateTime<Utc>) -> EscrowResult<bool> {
        let _guard = self.try_lock(id)?;
        let tx = self.load(id)?;
        if tx.status != TransactionStatus::Funded
            || !past(tx.timeline.delivery_deadline, now)
            || tx.uncaptured_amount() == 0
        {
            return Ok(false);
        }
        let mut next = tx;
        let settlement = next.expire_delivery(now)?;
        if settlement.refund {
            self.gateway_call("refund", id, self.gateway.refund(&next.hold_id))
                .await?;
        }
        let tx = self.commit(next)?;
        self.record_unsuccessful(&tx);
        self.notify_parties(&tx, EventKind::TransactionCancelled, "delivery deadline expired")
            .await;
        Ok(true)
    }

    /// Releases funds when the buyer neither confirmed nor disputed in time.
    pub async fn auto_release(&self, id: &str, now: DateTime<Utc>) -> EscrowResult<bool> {
        let _guard = self.try_lock(id)?;
        let tx = self.load(id)?;
        if tx.status != TransactionStatus::Delivered || !past(tx.timeline.auto_release_deadline, now)
        {
            return Ok(false);
        }
        let mut next = tx;
        let settlement = next.auto_release(now)?;
        if settlement.capture > 0 {
            self.gateway_call(
                "capture",
                id,
                self.gateway.capture(&next.hold_id, settlement.capture),
            )
            .await?;
        }
        let tx = self.commit(next)?;
        self.record_completed(&tx);
        self.notify_parties(&tx, EventKind::TransactionCompleted, "funds auto-released")
            .await;
        Ok(true)
    }

    /// Flags an overdue dispute for review. Never rules on it.
    pub async fn escalate_dispute(&self, id: &str, now: DateTime<Utc>) -> EscrowResult<bool> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        let Some(dispute_id) = next.escalate_overdue_dispute(now) else {
            return Ok(false);
        };
        let tx = self.commit(next)?;

        tracing::warn!(transaction_id = %tx.id, dispute_id = %dispute_id, "dispute escalated");
        if let Some(mediator) = tx.dispute(&dispute_id).and_then(|d| d.mediator_id.clone()) {
            self.notify(&mediator, EventKind::DisputeEscalated, &tx.id, "dispute overdue")
                .await;
        }
        self.notify_parties(&tx, EventKind::DisputeEscalated, "dispute escalated for review")
            .await;
        Ok(true)
    }

    /// Retries a refund a split ruling left pending.
    pub async fn retry_pending_refund(&self, id: &str) -> EscrowResult<bool> {
        let _guard = self.try_lock(id)?;
        let tx = self.load(id)?;
        if !tx.refund_pending {
            return Ok(false);
        }
        self.gateway_call("refund", id, self.gateway.refund(&tx.hold_id))
            .await?;
        let mut next = tx;
        next.settle_pending_refund(Utc::now())?;
        self.commit(next)?;
        Ok(true)
    }
}
