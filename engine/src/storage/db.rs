//! # SledStore: Persistent Escrow Storage
//!
//! [`EscrowStore`] on top of sled's embedded key-value store. Values are
//! bincode-encoded; keys are UTF-8.
//!
//! ## Tree Layout
//!
//! | Tree            | Key                            | Value                      |
//! |-----------------|--------------------------------|----------------------------|
//! | `transactions`  | transaction id                 | `bincode(Transaction)`     |
//! | `dispute_index` | dispute id                     | transaction id             |
//! | `reputation`    | user id                        | `bincode(ReputationRecord)`|
//! | `payouts`       | `seller:period:window-start`   | `bincode(Payout)`          |
//!
//! ## Atomicity
//!
//! Transaction updates go through `compare_and_swap` against the exact bytes
//! that were read, after checking the version. If anyone else wrote in
//! between, the swap fails and the caller gets a version conflict.
//! Reputation uses `update_and_fetch`, which sled retries until it wins.

use std::path::Path;

use sled::{Db, Tree};

use super::{decode, encode, EscrowStore, StoreError, StoreResult};
use crate::payout::Payout;
use crate::reputation::ReputationRecord;
use crate::transaction::Transaction;

/// sled-backed escrow store. Cheap to clone; clones share the database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    transactions: Tree,
    dispute_index: Tree,
    reputation: Tree,
    payouts: Tree,
}

impl SledStore {
    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that is removed when dropped.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            transactions: db.open_tree("transactions")?,
            dispute_index: db.open_tree("dispute_index")?,
            reputation: db.open_tree("reputation")?,
            payouts: db.open_tree("payouts")?,
            db,
        })
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    fn index_disputes(&self, tx: &Transaction) -> StoreResult<()> {
        for dispute in &tx.disputes {
            self.dispute_index
                .insert(dispute.id.as_bytes(), tx.id.as_bytes())?;
        }
        Ok(())
    }
}

impl EscrowStore for SledStore {
    fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let bytes = encode(tx)?;
        self.transactions
            .compare_and_swap(tx.id.as_bytes(), None::<&[u8]>, Some(bytes))?
            .map_err(|_| StoreError::AlreadyExists(tx.id.clone()))?;
        self.index_disputes(tx)
    }

    fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>> {
        match self.transactions.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_transaction(&self, tx: &Transaction, expected_version: u64) -> StoreResult<()> {
        let current_bytes = self
            .transactions
            .get(tx.id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(tx.id.clone()))?;
        let current: Transaction = decode(&current_bytes)?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: tx.id.clone(),
                expected: expected_version,
                found: current.version,
            });
        }

        let bytes = encode(tx)?;
        let swapped = self.transactions.compare_and_swap(
            tx.id.as_bytes(),
            Some(current_bytes),
            Some(bytes),
        )?;
        if let Err(cas) = swapped {
            let found = match cas.current {
                Some(b) => decode::<Transaction>(&b)?.version,
                None => 0,
            };
            return Err(StoreError::VersionConflict {
                id: tx.id.clone(),
                expected: expected_version,
                found,
            });
        }
        self.index_disputes(tx)
    }

    fn list_transactions(&self) -> StoreResult<Vec<Transaction>> {
        self.transactions
            .iter()
            .map(|item| {
                let (_key, value) = item?;
                decode(&value)
            })
            .collect()
    }

    fn find_transaction_by_dispute(&self, dispute_id: &str) -> StoreResult<Option<String>> {
        match self.dispute_index.get(dispute_id.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn get_reputation(&self, user_id: &str) -> StoreResult<Option<ReputationRecord>> {
        match self.reputation.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_reputation(
        &self,
        user_id: &str,
        update: &dyn Fn(&mut ReputationRecord),
    ) -> StoreResult<ReputationRecord> {
        let mut failure: Option<StoreError> = None;
        let updated = self
            .reputation
            .update_and_fetch(user_id.as_bytes(), |old: Option<&[u8]>| {
                let mut record = match old.map(decode::<ReputationRecord>) {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => {
                        failure = Some(e);
                        return old.map(|b| b.to_vec());
                    }
                    None => ReputationRecord::new(user_id),
                };
                update(&mut record);
                match encode(&record) {
                    Ok(bytes) => {
                        failure = None;
                        Some(bytes)
                    }
                    Err(e) => {
                        failure = Some(e);
                        old.map(|b| b.to_vec())
                    }
                }
            })?;

        if let Some(err) = failure {
            return Err(err);
        }
        let bytes = updated.ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
        decode(&bytes)
    }

    fn insert_payout_if_absent(&self, payout: &Payout) -> StoreResult<Option<Payout>> {
        let bytes = encode(payout)?;
        match self
            .payouts
            .compare_and_swap(payout.key.as_bytes(), None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(None),
            Err(cas) => match cas.current {
                Some(existing) => Ok(Some(decode(&existing)?)),
                None => Err(StoreError::NotFound(payout.key.clone())),
            },
        }
    }

    fn get_payout(&self, key: &str) -> StoreResult<Option<Payout>> {
        match self.payouts.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_payout(&self, payout: &Payout) -> StoreResult<()> {
        if !self.payouts.contains_key(payout.key.as_bytes())? {
            return Err(StoreError::NotFound(payout.key.clone()));
        }
        self.payouts.insert(payout.key.as_bytes(), encode(payout)?)?;
        Ok(())
    }

    fn list_payouts_by_seller(&self, seller_id: &str) -> StoreResult<Vec<Payout>> {
        let prefix = format!("{}:", seller_id);
        let mut payouts = Vec::new();
        for item in self.payouts.scan_prefix(prefix.as_bytes()) {
            let (_key, value) = item?;
            let payout: Payout = decode(&value)?;
            if payout.seller_id == seller_id {
                payouts.push(payout);
            }
        }
        Ok(payouts)
    }
}
