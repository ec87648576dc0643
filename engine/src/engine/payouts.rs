//! Seller payouts.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::EscrowEngine;
use crate::error::{EscrowError, EscrowResult};
use crate::gateway::EventKind;
use crate::payout::{
    aggregate_earnings, payout_key, Payout, PayoutOutcome, PayoutPeriod, PayoutStatus,
    MAX_PAYOUT_ATTEMPTS,
};

impl EscrowEngine {
    /// Pays out a seller's unclaimed earnings for the window ending at `now`.
    ///
    /// Below the configured minimum nothing is stored and the outcome says
    /// why. A payout already stored for this window is retried if still
    /// processing, or reported as-is otherwise.
    pub async fn run_payout(
        &self,
        seller_id: &str,
        period: PayoutPeriod,
        now: DateTime<Utc>,
    ) -> EscrowResult<PayoutOutcome> {
        if seller_id.trim().is_empty() {
            return Err(EscrowError::validation("seller_id", "is required"));
        }
        let (start, end) = period.window(now);
        let key = payout_key(seller_id, period, start);
        let _guard = self.try_lock(&format!("payout:{}", key))?;
        let minimum = self.config.min_payout;

        if let Some(existing) = self.store.get_payout(&key)? {
            return self.resume_payout(existing, minimum).await;
        }

        let claimed: HashSet<String> = self
            .store
            .list_payouts_by_seller(seller_id)?
            .into_iter()
            .filter(|p| p.status.holds_transactions())
            .flat_map(|p| p.transaction_ids)
            .collect();
        let transactions = self.store.list_transactions_by_seller(seller_id)?;
        let earnings = aggregate_earnings(&transactions, seller_id, start, end, &claimed);

        if earnings.net < minimum {
            tracing::debug!(seller_id, earnings = earnings.net, minimum, "payout below minimum");
            return Ok(PayoutOutcome::skipped(
                format!(
                    "earnings of {} are below the minimum payout of {} (short by {})",
                    earnings.net,
                    minimum,
                    minimum - earnings.net
                ),
                earnings.net,
                minimum,
            ));
        }

        let payout = Payout {
            id: Uuid::new_v4().to_string(),
            key,
            seller_id: seller_id.to_string(),
            period,
            period_start: start,
            period_end: end,
            gross_earnings: earnings.gross,
            fee_deducted: earnings.fees,
            amount: earnings.net,
            order_count: earnings.transaction_ids.len() as u32,
            transaction_ids: earnings.transaction_ids,
            status: PayoutStatus::Processing,
            external_reference: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            completed_at: None,
        };
        if let Some(existing) = self.store.insert_payout_if_absent(&payout)? {
            return self.resume_payout(existing, minimum).await;
        }
        tracing::info!(
            seller_id,
            payout_id = %payout.id,
            amount = payout.amount,
            orders = payout.order_count,
            "payout created"
        );
        self.attempt_transfer(payout, minimum).await
    }

    async fn resume_payout(&self, existing: Payout, minimum: u64) -> EscrowResult<PayoutOutcome> {
        match existing.status {
            PayoutStatus::Processing => self.attempt_transfer(existing, minimum).await,
            PayoutStatus::Completed => Ok(PayoutOutcome {
                payout_processed: false,
                reason: Some(format!("already paid out as {}", existing.id)),
                earnings: existing.amount,
                minimum,
                payout: Some(existing),
            }),
            PayoutStatus::Failed => Ok(PayoutOutcome {
                payout_processed: false,
                reason: Some(format!(
                    "payout {} failed after {} attempts",
                    existing.id, existing.attempts
                )),
                earnings: existing.amount,
                minimum,
                payout: Some(existing),
            }),
        }
    }

    async fn attempt_transfer(&self, mut payout: Payout, minimum: u64) -> EscrowResult<PayoutOutcome> {
        payout.attempts += 1;
        let result = self
            .gateway_call(
                "transfer",
                &payout.seller_id,
                self.gateway.transfer(&payout.seller_id, payout.amount),
            )
            .await;

        match result {
            Ok(receipt) => {
                payout.status = PayoutStatus::Completed;
                payout.external_reference = Some(receipt.reference);
                payout.completed_at = Some(Utc::now());
                payout.last_error = None;
                self.store.update_payout(&payout)?;

                tracing::info!(
                    seller_id = %payout.seller_id,
                    payout_id = %payout.id,
                    amount = payout.amount,
                    "payout completed"
                );
                self.notify(
                    &payout.seller_id,
                    EventKind::PayoutCompleted,
                    &payout.id,
                    &format!("payout of {} sent", payout.amount),
                )
                .await;
                Ok(PayoutOutcome {
                    payout_processed: true,
                    reason: None,
                    earnings: payout.amount,
                    minimum,
                    payout: Some(payout),
                })
            }
            Err(err) => {
                payout.last_error = Some(err.to_string());
                if payout.attempts >= MAX_PAYOUT_ATTEMPTS {
                    payout.status = PayoutStatus::Failed;
                    tracing::error!(payout_id = %payout.id, attempts = payout.attempts, "payout abandoned");
                }
                self.store.update_payout(&payout)?;
                Err(err)
            }
        }
    }
}
