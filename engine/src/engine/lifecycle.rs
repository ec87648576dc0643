//! Create, fund, deliver, confirm and cancel.

use chrono::Utc;
use uuid::Uuid;

use super::EscrowEngine;
use crate::error::{EscrowError, EscrowResult};
use crate::gateway::EventKind;
use crate::transaction::{
    CreateTransactionRequest, DeliveryInfo, RatingData, Transaction, TransactionStatus,
};
use crate::verification::VerificationMethod;

impl EscrowEngine {
    /// Validates the request, opens a hold at the gateway and stores the
    /// new transaction in `PendingPayment`.
    pub async fn create_transaction(
        &self,
        request: CreateTransactionRequest,
    ) -> EscrowResult<Transaction> {
        let plan = request.validate()?;
        let id = Uuid::new_v4().to_string();

        let hold = self
            .gateway_call(
                "create_hold",
                &id,
                self.gateway
                    .create_hold(&id, request.amount, &request.currency),
            )
            .await?;

        let tx = Transaction::new(id, request, plan, hold.hold_id, &self.config, Utc::now());
        self.store.insert_transaction(&tx)?;

        tracing::info!(
            transaction_id = %tx.id,
            amount = tx.amount,
            fee = tx.fee.fee,
            tier = %tx.verification.tier,
            "escrow created"
        );
        self.notify_parties(&tx, EventKind::TransactionCreated, "escrow created")
            .await;
        Ok(tx)
    }

    pub fn get_transaction(&self, id: &str) -> EscrowResult<Transaction> {
        self.load(id)
    }

    /// Confirms the buyer's payment with the gateway.
    pub async fn fund_transaction(
        &self,
        id: &str,
        payment_method: &str,
    ) -> EscrowResult<Transaction> {
        if payment_method.trim().is_empty() {
            return Err(EscrowError::validation("payment_method", "must not be empty"));
        }
        let _guard = self.try_lock(id)?;
        let tx = self.load(id)?;
        tx.ensure_fundable(Utc::now())?;

        let confirmation = self
            .gateway_call(
                "confirm_hold",
                id,
                self.gateway.confirm_hold(&tx.hold_id, payment_method),
            )
            .await?;

        let mut next = tx;
        next.fund(&confirmation.payment_method, &self.config, Utc::now())?;
        let tx = self.commit(next)?;

        self.notify_parties(&tx, EventKind::TransactionFunded, "payment held in escrow")
            .await;
        Ok(tx)
    }

    pub async fn mark_delivered(
        &self,
        id: &str,
        seller_id: &str,
        info: DeliveryInfo,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        next.deliver(seller_id, info, &self.config, Utc::now())?;
        let tx = self.commit(next)?;

        self.notify(
            &tx.buyer_id,
            EventKind::TransactionDelivered,
            &tx.id,
            "seller marked the item as delivered",
        )
        .await;
        Ok(tx)
    }

    /// Buyer confirms receipt: captures the remaining hold, completes the
    /// transaction and credits both parties.
    pub async fn confirm_delivery(
        &self,
        id: &str,
        buyer_id: &str,
        rating: Option<RatingData>,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        let settlement = next.confirm_delivery(buyer_id, rating, Utc::now())?;

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
        self.notify_parties(&tx, EventKind::TransactionCompleted, "funds released to seller")
            .await;
        Ok(tx)
    }

    /// Either party cancels before delivery. A funded hold is refunded.
    pub async fn cancel_transaction(
        &self,
        id: &str,
        actor: &str,
        reason: &str,
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let tx = self.load(id)?;
        let was_funded = tx.status == TransactionStatus::Funded;

        let mut next = tx;
        let settlement = next.cancel(actor, reason, Utc::now())?;
        if settlement.refund {
            self.gateway_call("refund", id, self.gateway.refund(&next.hold_id))
                .await?;
        }
        let tx = self.commit(next)?;

        if was_funded {
            self.record_unsuccessful(&tx);
        }
        self.notify_parties(&tx, EventKind::TransactionCancelled, reason)
            .await;
        Ok(tx)
    }

    /// Marks a party verified for the transaction's tier.
    pub async fn verify_party(
        &self,
        id: &str,
        user_id: &str,
        methods: &[VerificationMethod],
    ) -> EscrowResult<Transaction> {
        let _guard = self.try_lock(id)?;
        let mut next = self.load(id)?;
        next.verify_party(user_id, methods, Utc::now())?;
        self.commit(next)
    }
}
