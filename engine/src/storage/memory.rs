//! In-memory [`EscrowStore`] built on `DashMap`.
//!
//! Per-key operations run under the map's shard lock, which is what makes
//! the version check in `update_transaction` and the closure in
//! `update_reputation` atomic. Nothing survives a restart.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{EscrowStore, StoreError, StoreResult};
use crate::payout::Payout;
use crate::reputation::ReputationRecord;
use crate::transaction::Transaction;

#[derive(Default)]
pub struct MemoryStore {
    transactions: DashMap<String, Transaction>,
    dispute_index: DashMap<String, String>,
    reputation: DashMap<String, ReputationRecord>,
    payouts: DashMap<String, Payout>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_disputes(&self, tx: &Transaction) {
        for dispute in &tx.disputes {
            self.dispute_index
                .entry(dispute.id.clone())
                .or_insert_with(|| tx.id.clone());
        }
    }
}

impl EscrowStore for MemoryStore {
    fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        match self.transactions.entry(tx.id.clone()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(tx.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }
        self.index_disputes(tx);
        Ok(())
    }

    fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        Ok(self.transactions.get(id).map(|tx| tx.clone()))
    }

    fn update_transaction(&self, tx: &Transaction, expected_version: u64) -> StoreResult<()> {
        {
            let mut current = self
                .transactions
                .get_mut(&tx.id)
                .ok_or_else(|| StoreError::NotFound(tx.id.clone()))?;
            if current.version != expected_version {
                return Err(StoreError::VersionConflict {
                    id: tx.id.clone(),
                    expected: expected_version,
                    found: current.version,
                });
            }
            *current = tx.clone();
        }
        self.index_disputes(tx);
        Ok(())
    }

    fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        Ok(self.transactions.iter().map(|e| e.value().clone()).collect())
    }

    fn find_transaction_by_dispute(&self, dispute_id: &str) -> StoreResult<Option<String>> {
        Ok(self.dispute_index.get(dispute_id).map(|id| id.clone()))
    }

    fn get_reputation(&self, user_id: &str) -> StoreResult<Option<ReputationRecord>> {
        Ok(self.reputation.get(user_id).map(|r| r.clone()))
    }

    fn update_reputation(
        &self,
        user_id: &str,
        update: &dyn Fn(&mut ReputationRecord),
    ) -> StoreResult<ReputationRecord> {
        let mut record = self
            .reputation
            .entry(user_id.to_string())
            .or_insert_with(|| ReputationRecord::new(user_id));
        update(record.value_mut());
        Ok(record.value().clone())
    }

    fn insert_payout_if_absent(&self, payout: &Payout) -> StoreResult<Option<Payout>> {
        match self.payouts.entry(payout.key.clone()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(payout.clone());
                Ok(None)
            }
        }
    }

    fn get_payout(&self, key: &str) -> StoreResult<Option<Payout>> {
        Ok(self.payouts.get(key).map(|p| p.clone()))
    }

    fn update_payout(&self, payout: &Payout) -> StoreResult<()> {
        let mut current = self
            .payouts
            .get_mut(&payout.key)
            .ok_or_else(|| StoreError::NotFound(payout.key.clone()))?;
        *current = payout.clone();
        Ok(())
    }

    fn list_payouts_by_seller(&self, seller_id: &str) -> StoreResult<Vec<Payout>> {
        Ok(self
            .payouts
            .iter()
            .filter(|p| p.seller_id == seller_id)
            .map(|p| p.value().clone())
            .collect())
    }
}
