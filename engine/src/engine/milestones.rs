//! Milestone plan operations.

use chrono::Utc;

use super::EscrowEngine;
use crate::error::EscrowResult;
use crate::gateway::EventKind;
use crate::milestone::MilestoneSpec;
use crate::transaction::Transaction;

impl EscrowEngine {
    /// Attaches a milestone plan to a transaction that has none in progress.
    pub async fn create_milestone_plan(
        &self,
        id: &str,
        actor: &str,
        specs: Vec<MilestoneSpec>,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        next.set_milestone_plan(actor, specs, Utc::now())?;
        self.commit(next)
    }

    pub async fn start_milestone(
        &self,
        id: &str,
        seller_id: &str,
        sequence: u32,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        next.start_milestone(seller_id, sequence, Utc::now())?;
        self.commit(next)
    }

    pub async fn complete_milestone(
        &self,
        id: &str,
        seller_id: &str,
        sequence: u32,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        next.complete_milestone(seller_id, sequence, Utc::now())?;
        let tx = self.commit(next)?;

        self.notify(
            &tx.buyer_id,
            EventKind::MilestoneCompleted,
            &tx.id,
            &format!("milestone {} is ready for approval", sequence),
        )
        .await;
        Ok(tx)
    }

    /// Buyer approves a completed milestone; its amount is captured. If the
    /// capture fails the milestone stays `Completed` and nothing is stored.
    pub async fn approve_milestone(
        &self,
        id: &str,
        buyer_id: &str,
        sequence: u32,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        let payment = next.approve_milestone(buyer_id, sequence, Utc::now())?;

        if payment.amount > 0 {
            self.gateway_call(
                "capture",
                id,
                self.gateway.capture(&next.hold_id, payment.amount),
            )
            .await?;
        }
        let tx = self.commit(next)?;

        tracing::info!(
            transaction_id = %tx.id,
            sequence,
            amount = payment.amount,
            releases_funds = payment.releases_funds,
            "milestone paid"
        );
        if payment.completes_transaction {
            self.record_completed(&tx);
            self.notify_parties(&tx, EventKind::TransactionCompleted, "all milestones paid")
                .await;
        } else {
            self.notify(
                &tx.seller_id,
                EventKind::MilestonePaid,
                &tx.id,
                &format!("milestone {} paid", sequence),
            )
            .await;
        }
        Ok(tx)
    }
}
