//! # Reputation Ledger
//!
//! One [`ReputationRecord`] per user, shared by every transaction that user
//! takes part in. Records only move through [`ReputationEvent`]s, and every
//! event is applied with the store's atomic per-key update, so two
//! transactions completing at the same moment for the same seller both land.
//!
//! The score starts at 100 and is clamped to `[0, 100]`: disputes drag it
//! down, good ratings earn some of it back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{
    DISPUTE_LOST_PENALTY, DISPUTE_RAISED_PENALTY, GOOD_RATING_BONUS, INITIAL_REPUTATION_SCORE,
    MIN_REPUTATION_SCORE, POOR_RATING_PENALTY,
};
use crate::error::{EscrowError, EscrowResult};
use crate::storage::EscrowStore;

/// Aggregate trust record for a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub user_id: String,
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub disputes_raised: u64,
    pub disputes_lost: u64,
    /// Running mean of all ratings received, `0.0` until the first one.
    pub average_rating: f64,
    pub rating_count: u64,
    pub score: i64,
    pub updated_at: DateTime<Utc>,
}

/// Something that happened to a user that moves their record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    /// A transaction the user took part in completed. The rating, if any,
    /// is one the user received.
    Completed { rating: Option<u8> },
    /// A funded transaction the user took part in ended cancelled or refunded.
    Unsuccessful,
    DisputeRaised,
    DisputeLost,
}

impl ReputationRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            total_transactions: 0,
            successful_transactions: 0,
            disputes_raised: 0,
            disputes_lost: 0,
            average_rating: 0.0,
            rating_count: 0,
            score: INITIAL_REPUTATION_SCORE,
            updated_at: Utc::now(),
        }
    }

    /// Applies one event in place.
    pub fn apply(&mut self, event: ReputationEvent) {
        match event {
            ReputationEvent::Completed { rating } => {
                self.total_transactions += 1;
                self.successful_transactions += 1;
                if let Some(r) = rating {
                    self.record_rating(r);
                }
            }
            ReputationEvent::Unsuccessful => {
                self.total_transactions += 1;
            }
            ReputationEvent::DisputeRaised => {
                self.disputes_raised += 1;
                self.adjust_score(-DISPUTE_RAISED_PENALTY);
            }
            ReputationEvent::DisputeLost => {
                self.disputes_lost += 1;
                self.adjust_score(-DISPUTE_LOST_PENALTY);
            }
        }
        self.updated_at = Utc::now();
    }

    fn record_rating(&mut self, rating: u8) {
        self.rating_count += 1;
        let n = self.rating_count as f64;
        self.average_rating = (self.average_rating * (n - 1.0) + rating as f64) / n;

        if rating >= 4 {
            self.adjust_score(GOOD_RATING_BONUS);
        } else if rating <= 2 {
            self.adjust_score(-POOR_RATING_PENALTY);
        }
    }

    fn adjust_score(&mut self, delta: i64) {
        self.score = (self.score + delta).clamp(MIN_REPUTATION_SCORE, INITIAL_REPUTATION_SCORE);
    }
}

/// Validates a 1–5 star rating.
pub fn validate_rating(rating: u8) -> EscrowResult<()> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(EscrowError::validation(
            "rating",
            format!("must be between 1 and 5, got {}", rating),
        ))
    }
}

/// Thin handle over the store's reputation keyspace.
#[derive(Clone)]
pub struct ReputationLedger {
    store: Arc<dyn EscrowStore>,
}

impl ReputationLedger {
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        Self { store }
    }

    /// Current record for `user_id`, or a fresh one if the user has no history.
    pub fn get(&self, user_id: &str) -> EscrowResult<ReputationRecord> {
        Ok(self
            .store
            .get_reputation(user_id)?
            .unwrap_or_else(|| ReputationRecord::new(user_id)))
    }

    pub fn record_completion(
        &self,
        user_id: &str,
        rating: Option<u8>,
    ) -> EscrowResult<ReputationRecord> {
        self.apply(user_id, ReputationEvent::Completed { rating })
    }

    pub fn record_unsuccessful(&self, user_id: &str) -> EscrowResult<ReputationRecord> {
        self.apply(user_id, ReputationEvent::Unsuccessful)
    }

    pub fn record_dispute_raised(&self, user_id: &str) -> EscrowResult<ReputationRecord> {
        self.apply(user_id, ReputationEvent::DisputeRaised)
    }

    pub fn record_dispute_against(&self, user_id: &str) -> EscrowResult<ReputationRecord> {
        self.apply(user_id, ReputationEvent::DisputeLost)
    }

    fn apply(&self, user_id: &str, event: ReputationEvent) -> EscrowResult<ReputationRecord> {
        let record = self
            .store
            .update_reputation(user_id, &|record| record.apply(event))?;
        tracing::debug!(
            user_id,
            ?event,
            score = record.score,
            "reputation updated"
        );
        Ok(record)
    }
}
