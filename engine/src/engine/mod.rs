//! # Escrow Engine
//!
//! The service layer. Every public operation follows the same shape:
//!
//! 1. Take the transaction's in-process lock (losers get
//!    [`EscrowError::ConcurrentModification`] straight away).
//! 2. Load the transaction and apply the pure transition to a copy.
//! 3. Make the gateway call the transition asked for, bounded by
//!    [`EngineConfig::gateway_timeout`].
//! 4. Persist the copy with a version check.
//! 5. Update reputation and send notifications.
//!
//! A failure in steps 2–4 leaves the stored transaction exactly as it was.
//! Steps in 5 happen after the commit and never undo it: their failures
//! are logged.

mod disputes;
mod lifecycle;
mod milestones;
mod payouts;
mod sweep;

pub use sweep::{SweepFailure, SweepReport};

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::EngineConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::gateway::{EventKind, GatewayError, MediatorDirectory, Notifier, PaymentGateway};
use crate::reputation::ReputationLedger;
use crate::storage::EscrowStore;
use crate::transaction::Transaction;

/// Entry point for every escrow operation.
pub struct EscrowEngine {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn PaymentGateway>,
    mediators: Arc<dyn MediatorDirectory>,
    notifier: Arc<dyn Notifier>,
    ledger: ReputationLedger,
    config: EngineConfig,
    /// One mutex per transaction id (and per payout key).
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EscrowEngine {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        mediators: Arc<dyn MediatorDirectory>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger: ReputationLedger::new(Arc::clone(&store)),
            store,
            gateway,
            mediators,
            notifier,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn reputation(&self) -> &ReputationLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn EscrowStore> {
        &self.store
    }

    // -- Internals ----------------------------------------------------------

    /// Claims the single-writer slot for `key` without waiting.
    fn try_lock(&self, key: &str) -> EscrowResult<OwnedMutexGuard<()>> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.try_lock_owned().map_err(|_| {
            tracing::debug!(key, "lock contended, rejecting writer");
            EscrowError::ConcurrentModification {
                transaction_id: key.to_string(),
            }
        })
    }

    fn load(&self, id: &str) -> EscrowResult<Transaction> {
        self.store
            .get_transaction(id)?
            .ok_or_else(|| EscrowError::not_found("transaction", id))
    }

    fn load_by_dispute(&self, dispute_id: &str) -> EscrowResult<Transaction> {
        let tx_id = self
            .store
            .find_transaction_by_dispute(dispute_id)?
            .ok_or_else(|| EscrowError::not_found("dispute", dispute_id))?;
        self.load(&tx_id)
    }

    /// Persists `next` if nobody wrote since it was loaded.
    fn commit(&self, mut next: Transaction) -> EscrowResult<Transaction> {
        let expected = next.version;
        next.version += 1;
        self.store.update_transaction(&next, expected)?;
        tracing::info!(
            transaction_id = %next.id,
            status = %next.status,
            version = next.version,
            "transaction updated"
        );
        Ok(next)
    }

    /// Runs a gateway call under the configured timeout.
    async fn gateway_call<T, F>(&self, operation: &'static str, subject: &str, call: F) -> EscrowResult<T>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let timeout = self.config.gateway_timeout;
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        result.map_err(|err| {
            tracing::warn!(operation, subject, error = %err, "gateway call failed");
            EscrowError::Gateway(err)
        })
    }

    /// Draws a mediator from the directory under the same timeout. A failed
    /// lookup is [`EscrowError::NoMediator`], never a gateway error.
    async fn mediator_call(&self, dispute_id: &str) -> EscrowResult<String> {
        let timeout = self.config.gateway_timeout;
        match tokio::time::timeout(timeout, self.mediators.assign(dispute_id)).await {
            Ok(Ok(mediator)) => Ok(mediator),
            Ok(Err(err)) => Err(EscrowError::no_mediator(dispute_id, err)),
            Err(_) => Err(EscrowError::no_mediator(
                dispute_id,
                format!("directory timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    async fn notify(&self, user_id: &str, event: EventKind, transaction_id: &str, message: &str) {
        if let Err(err) = self
            .notifier
            .notify(user_id, event, transaction_id, message)
            .await
        {
            tracing::warn!(user_id, ?event, transaction_id, error = %err, "notification dropped");
        }
    }

    async fn notify_parties(&self, tx: &Transaction, event: EventKind, message: &str) {
        self.notify(&tx.buyer_id, event, &tx.id, message).await;
        self.notify(&tx.seller_id, event, &tx.id, message).await;
    }

    /// Applies a reputation change after a committed transition.
    fn record_reputation<T>(&self, user_id: &str, outcome: EscrowResult<T>) {
        if let Err(err) = outcome {
            tracing::error!(user_id, error = %err, "reputation update failed");
        }
    }

    /// Both parties finished a transaction that completed.
    fn record_completed(&self, tx: &Transaction) {
        let rating = tx.seller_rating.as_ref().map(|r| r.rating);
        self.record_reputation(&tx.seller_id, self.ledger.record_completion(&tx.seller_id, rating));
        self.record_reputation(&tx.buyer_id, self.ledger.record_completion(&tx.buyer_id, None));
    }

    /// Both parties finished a funded transaction that did not complete.
    fn record_unsuccessful(&self, tx: &Transaction) {
        self.record_reputation(&tx.seller_id, self.ledger.record_unsuccessful(&tx.seller_id));
        self.record_reputation(&tx.buyer_id, self.ledger.record_unsuccessful(&tx.buyer_id));
    }
}
