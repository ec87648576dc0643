//! # Storage Module
//!
//! Persistence for transactions (with their milestones and disputes),
//! reputation records and payouts.
//!
//! ```text
//! memory.rs : DashMap-backed store for tests and ephemeral nodes
//! db.rs     : sled-backed store, bincode on disk
//! ```
//!
//! Both implementations give the same guarantees:
//!
//! 1. **Versioned transaction writes.** `update_transaction` only lands if
//!    the stored version is the one the caller read. A lost race surfaces
//!    as [`StoreError::VersionConflict`].
//! 2. **Atomic reputation updates.** `update_reputation` applies a closure
//!    to the current record under the store's own per-key atomicity, so
//!    concurrent completions for one seller never overwrite each other.
//! 3. **Unique payout keys.** `insert_payout_if_absent` never replaces an
//!    existing payout; it hands back the stored one instead.

pub mod db;
pub mod memory;

pub use db::SledStore;
pub use memory::MemoryStore;

use crate::payout::Payout;
use crate::reputation::ReputationRecord;
use crate::transaction::Transaction;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{id}: expected version {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary of the engine.
pub trait EscrowStore: Send + Sync {
    /// Stores a brand-new transaction. Fails if the id is taken.
    fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()>;

    fn get_transaction(&self, id: &str) -> StoreResult<Option<Transaction>>;

    /// Replaces the stored transaction if its version is still
    /// `expected_version`. `tx.version` must already be bumped.
    fn update_transaction(&self, tx: &Transaction, expected_version: u64) -> StoreResult<()>;

    fn list_transactions(&self) -> StoreResult<Vec<Transaction>>;

    fn list_transactions_by_seller(&self, seller_id: &str) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .list_transactions()?
            .into_iter()
            .filter(|tx| tx.seller_id == seller_id)
            .collect())
    }

    /// Id of the transaction that owns `dispute_id`.
    fn find_transaction_by_dispute(&self, dispute_id: &str) -> StoreResult<Option<String>>;

    fn get_reputation(&self, user_id: &str) -> StoreResult<Option<ReputationRecord>>;

    /// Applies `update` to the user's record (a fresh one if none exists)
    /// atomically and returns the result.
    fn update_reputation(
        &self,
        user_id: &str,
        update: &dyn Fn(&mut ReputationRecord),
    ) -> StoreResult<ReputationRecord>;

    /// Inserts `payout` under `payout.key` unless that key is taken, in which
    /// case the stored payout is returned and nothing is written.
    fn insert_payout_if_absent(&self, payout: &Payout) -> StoreResult<Option<Payout>>;

    fn get_payout(&self, key: &str) -> StoreResult<Option<Payout>>;

    fn update_payout(&self, payout: &Payout) -> StoreResult<()>;

    fn list_payouts_by_seller(&self, seller_id: &str) -> StoreResult<Vec<Payout>>;
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
