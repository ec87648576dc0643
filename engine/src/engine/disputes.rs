//! Dispute operations. Disputes are addressed by id; the store's dispute
//! index finds the owning transaction, whose lock covers the dispute.

use chrono::Utc;

use super::EscrowEngine;
use crate::dispute::{Dispute, EvidenceInput, OpenDisputeRequest, ResolutionOutcome};
use crate::error::{EscrowError, EscrowResult};
use crate::gateway::EventKind;
use crate::transaction::Transaction;

fn dispute_of(tx: &Transaction, dispute_id: &str) -> EscrowResult<Dispute> {
    tx.dispute(dispute_id)
        .cloned()
        .ok_or_else(|| EscrowError::not_found("dispute", dispute_id))
}

impl EscrowEngine {
    /// Opens a dispute on a funded or delivered transaction and freezes it.
    ///
    /// A mediator is drawn from the directory straight away. If none can be
    /// had the dispute stays `open`; `request_mediation` tries again.
    pub async fn open_dispute(
        &self,
        transaction_id: &str,
        request: OpenDisputeRequest,
    ) -> EscrowResult<Dispute> {
        let _guard = self.try_lock(transaction_id)?;
        let mut next = self.load(transaction_id)?;
        let initiator = request.initiator_id.clone();
        let dispute_id = next
            .open_dispute(request, &self.config, Utc::now())?
            .id
            .clone();

        let assigned = match self.mediator_call(&dispute_id).await {
            Ok(mediator) => match next.assign_mediator(&dispute_id, &mediator, Utc::now()) {
                Ok(()) => Some(mediator),
                Err(err) => {
                    tracing::debug!(dispute_id = %dispute_id, error = %err, "directory returned an ineligible mediator");
                    None
                }
            },
            Err(err) => {
                tracing::debug!(dispute_id = %dispute_id, error = %err, "dispute left without a mediator");
                None
            }
        };
        let tx = self.commit(next)?;
        let dispute = dispute_of(&tx, &dispute_id)?;

        tracing::info!(
            transaction_id = %tx.id,
            dispute_id = %dispute.id,
            priority = ?dispute.priority,
            mediator = ?dispute.mediator_id,
            "dispute opened"
        );
        self.record_reputation(&initiator, self.ledger.record_dispute_raised(&initiator));
        self.notify(
            &dispute.respondent_id,
            EventKind::DisputeOpened,
            &tx.id,
            &format!("dispute opened: {}", dispute.reason),
        )
        .await;
        if let Some(mediator) = assigned {
            self.notify(&mediator, EventKind::MediatorAssigned, &tx.id, "new dispute to review")
                .await;
        }
        Ok(dispute)
    }

    pub fn get_dispute(&self, dispute_id: &str) -> EscrowResult<Dispute> {
        let tx = self.load_by_dispute(dispute_id)?;
        dispute_of(&tx, dispute_id)
    }

    /// Loads, locks and mutates the transaction owning `dispute_id`.
    fn lock_for_dispute(
        &self,
        dispute_id: &str,
    ) -> EscrowResult<(tokio::sync::OwnedMutexGuard<()>, Transaction)> {
        let tx_id = self
            .store
            .find_transaction_by_dispute(dispute_id)?
            .ok_or_else(|| EscrowError::not_found("dispute", dispute_id))?;
        let guard = self.try_lock(&tx_id)?;
        let tx = self.load(&tx_id)?;
        Ok((guard, tx))
    }

    pub async fn submit_evidence(
        &self,
        dispute_id: &str,
        submitted_by: &str,
        evidence: EvidenceInput,
    ) -> EscrowResult<Dispute> {
        let (_guard, mut next) = self.lock_for_dispute(dispute_id)?;
        next.submit_dispute_evidence(dispute_id, submitted_by, evidence, Utc::now())?;
        let tx = self.commit(next)?;
        let dispute = dispute_of(&tx, dispute_id)?;

        let other = if submitted_by == dispute.initiator_id {
            &dispute.respondent_id
        } else {
            &dispute.initiator_id
        };
        self.notify(other, EventKind::DisputeUpdated, &tx.id, "new evidence submitted")
            .await;
        Ok(dispute)
    }

    pub async fn post_dispute_message(
        &self,
        dispute_id: &str,
        author: &str,
        body: &str,
    ) -> EscrowResult<Dispute> {
        let (_guard, mut next) = self.lock_for_dispute(dispute_id)?;
        next.post_dispute_message(dispute_id, author, body, Utc::now())?;
        let tx = self.commit(next)?;
        dispute_of(&tx, dispute_id)
    }

    /// A party asks for a mediator. One is drawn from the directory unless
    /// the dispute already has one.
    pub async fn request_mediation(
        &self,
        dispute_id: &str,
        requested_by: &str,
        note: &str,
    ) -> EscrowResult<Dispute> {
        let (_guard, mut next) = self.lock_for_dispute(dispute_id)?;
        let has_mediator = next.request_mediation(dispute_id, requested_by, note, Utc::now())?;

        let mut assigned = None;
        if !has_mediator {
            let mediator = self.mediator_call(dispute_id).await.map_err(|err| {
                tracing::info!(dispute_id, error = %err, "mediation requested but nobody is free");
                err
            })?;
            next.assign_mediator(dispute_id, &mediator, Utc::now())?;
            assigned = Some(mediator);
        }
        let tx = self.commit(next)?;

        if let Some(mediator) = assigned {
            tracing::info!(transaction_id = %tx.id, dispute_id, mediator = %mediator, "mediator assigned");
            self.notify(&mediator, EventKind::MediatorAssigned, &tx.id, "new dispute to review")
                .await;
        }
        dispute_of(&tx, dispute_id)
    }

    /// Operator assigns a specific mediator.
    pub async fn assign_mediator(&self, dispute_id: &str, mediator_id: &str) -> EscrowResult<Dispute> {
        let (_guard, mut next) = self.lock_for_dispute(dispute_id)?;
        next.assign_mediator(dispute_id, mediator_id, Utc::now())?;
        let tx = self.commit(next)?;

        self.notify(mediator_id, EventKind::MediatorAssigned, &tx.id, "new dispute to review")
            .await;
        dispute_of(&tx, dispute_id)
    }

    /// Applies the assigned mediator's ruling: captures and refunds at the
    /// gateway, closes the transaction, and penalizes the party at fault.
    ///
    /// If a split's capture succeeds but its refund fails, the ruling is
    /// still committed with `refund_pending` set; the sweep retries it.
    pub async fn resolve_dispute(
        &self,
        dispute_id: &str,
        resolver_id: &str,
        outcome: ResolutionOutcome,
        notes: String,
    ) -> EscrowResult<Transaction> {
        let (_guard, mut next) = self.lock_for_dispute(dispute_id)?;
        let ruling = next.resolve_dispute(dispute_id, outcome, resolver_id, notes, Utc::now())?;
        let settlement = ruling.settlement;

        if settlement.capture > 0 {
            self.gateway_call(
                "capture",
                &next.id,
                self.gateway.capture(&next.hold_id, settlement.capture),
            )
            .await?;
        }
        if settlement.refund {
            let refunded = self
                .gateway_call("refund", &next.id, self.gateway.refund(&next.hold_id))
                .await;
            match refunded {
                Ok(_) => {}
                Err(err) if settlement.capture > 0 => {
                    tracing::warn!(
                        transaction_id = %next.id,
                        error = %err,
                        "refund after split capture failed, leaving it pending"
                    );
                    next.refund_pending = true;
                }
                Err(err) => return Err(err),
            }
        }
        let tx = self.commit(next)?;

        tracing::info!(
            transaction_id = %tx.id,
            dispute_id,
            outcome = ?ruling.outcome,
            captured = settlement.capture,
            "dispute resolved"
        );
        if let Some(at_fault) = &ruling.at_fault {
            self.record_reputation(at_fault, self.ledger.record_dispute_against(at_fault));
        }
        match ruling.outcome {
            ResolutionOutcome::RefundToBuyer => self.record_unsuccessful(&tx),
            _ => self.record_completed(&tx),
        }
        self.notify_parties(&tx, EventKind::DisputeResolved, "dispute resolved")
            .await;
        Ok(tx)
    }

    /// The initiator drops the dispute; the transaction resumes.
    pub async fn withdraw_dispute(&self, dispute_id: &str, caller: &str) -> EscrowResult<Transaction> {
        let (_guard, mut next) = self.lock_for_dispute(dispute_id)?;
        next.withdraw_dispute(dispute_id, caller, Utc::now())?;
        let tx = self.commit(next)?;

        self.notify_parties(&tx, EventKind::DisputeUpdated, "dispute withdrawn")
            .await;
        Ok(tx)
    }
}
