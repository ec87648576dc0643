//! # Payout Scheduler Types
//!
//! A payout bundles a seller's earnings from completed transactions over a
//! trailing window into one transfer. This module holds the record types and
//! the pure aggregation; [`EscrowEngine::run_payout`](crate::engine::EscrowEngine::run_payout)
//! drives the gateway and the store.
//!
//! Each payout is stored under `seller:period:window-start-day`. Running the
//! same period twice on the same day hits the same key and retries or
//! reports the stored payout instead of paying again. Transactions already
//! claimed by a processing or completed payout are never counted twice.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

/// Failed transfer attempts after which a payout is given up on.
pub const MAX_PAYOUT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutPeriod {
    Weekly,
    Biweekly,
    Monthly,
}

impl PayoutPeriod {
    pub fn days(&self) -> i64 {
        match self {
            PayoutPeriod::Weekly => 7,
            PayoutPeriod::Biweekly => 14,
            PayoutPeriod::Monthly => 30,
        }
    }

    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::days(self.days()), now)
    }

    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "weekly" => Some(PayoutPeriod::Weekly),
            "biweekly" => Some(PayoutPeriod::Biweekly),
            "monthly" => Some(PayoutPeriod::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for PayoutPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayoutPeriod::Weekly => write!(f, "weekly"),
            PayoutPeriod::Biweekly => write!(f, "biweekly"),
            PayoutPeriod::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Processing,
    Completed,
    /// Gave up after [`MAX_PAYOUT_ATTEMPTS`]. Its transactions are free to be
    /// picked up by a later payout.
    Failed,
}

impl PayoutStatus {
    /// Whether this payout still claims its transactions.
    pub fn holds_transactions(&self) -> bool {
        matches!(self, PayoutStatus::Processing | PayoutStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    /// Uniqueness key, see [`payout_key`].
    pub key: String,
    pub seller_id: String,
    pub period: PayoutPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub gross_earnings: u64,
    pub fee_deducted: u64,
    /// Net amount transferred to the seller.
    pub amount: u64,
    pub order_count: u32,
    pub transaction_ids: Vec<String>,
    pub status: PayoutStatus,
    pub external_reference: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// `seller:period:YYYY-MM-DD`, the day being the window start.
pub fn payout_key(seller_id: &str, period: PayoutPeriod, window_start: DateTime<Utc>) -> String {
    let day: NaiveDate = window_start.date_naive();
    format!("{}:{}:{}", seller_id, period, day)
}

/// What a seller earned in a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Earnings {
    pub gross: u64,
    pub fees: u64,
    pub net: u64,
    pub transaction_ids: Vec<String>,
}

/// Sums the seller's closed transactions whose close falls in `[start, end]`
/// and that no earlier payout has claimed. Besides completed ones this picks
/// up cancelled or refunded transactions that paid milestones first.
pub fn aggregate_earnings<'a>(
    transactions: impl IntoIterator<Item = &'a Transaction>,
    seller_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    claimed: &HashSet<String>,
) -> Earnings {
    let mut earnings = Earnings::default();
    for tx in transactions {
        if tx.seller_id != seller_id || !tx.has_seller_earnings() {
            continue;
        }
        let Some(completed_at) = tx.timeline.completed_at else {
            continue;
        };
        if completed_at < start || completed_at > end || claimed.contains(&tx.id) {
            continue;
        }
        let net = tx.seller_earnings();
        earnings.gross += tx.captured_amount;
        earnings.fees += tx.captured_amount - net;
        earnings.net += net;
        earnings.transaction_ids.push(tx.id.clone());
    }
    earnings.transaction_ids.sort();
    earnings
}

/// Result of a payout run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutOutcome {
    pub payout_processed: bool,
    /// Why nothing was paid, when nothing was.
    pub reason: Option<String>,
    pub earnings: u64,
    pub minimum: u64,
    pub payout: Option<Payout>,
}

impl PayoutOutcome {
    pub(crate) fn skipped(reason: String, earnings: u64, minimum: u64) -> Self {
        Self {
            payout_processed: false,
            reason: Some(reason),
            earnings,
            minimum,
            payout: None,
        }
    }
}
