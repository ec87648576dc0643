//! # Engine Configuration & Constants
//!
//! Every business number in the escrow engine lives here: fee rates,
//! verification thresholds, lifecycle deadlines, payout windows. If a
//! percentage or a day count shows up anywhere else as a literal, it belongs
//! in this file instead.
//!
//! Monetary values are integer minor units (cents for two-decimal
//! currencies). Rates and multipliers are basis points, where
//! `10_000` bps is 1.0×. No floating point touches money.

use chrono::Duration;

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Minor units per major currency unit. All constants below assume
/// two-decimal currencies.
pub const MINOR_UNITS_PER_MAJOR: u64 = 100;

/// One whole multiplier expressed in basis points.
pub const BPS_DENOMINATOR: u64 = 10_000;

// ---------------------------------------------------------------------------
// Fee Parameters
// ---------------------------------------------------------------------------

/// Base platform rate: 2.5% of the transaction amount.
pub const BASE_FEE_BPS: u64 = 250;

/// Smallest fee ever charged (5.00).
pub const MIN_FEE: u64 = 5 * MINOR_UNITS_PER_MAJOR;

/// Largest fee ever charged (500.00).
pub const MAX_FEE: u64 = 500 * MINOR_UNITS_PER_MAJOR;

/// Volume discount tiers as `(exclusive lower bound, multiplier bps)`,
/// highest tier first. The first matching tier wins.
pub const VOLUME_DISCOUNT_TIERS: [(u64, u64); 3] = [
    (10_000 * MINOR_UNITS_PER_MAJOR, 8_000),
    (5_000 * MINOR_UNITS_PER_MAJOR, 8_500),
    (1_000 * MINOR_UNITS_PER_MAJOR, 9_000),
];

/// Surcharge applied when more than [`MULTI_PARTY_THRESHOLD`] parties take part.
pub const MULTI_PARTY_SURCHARGE_BPS: u64 = 11_000;

/// Party count above which the surcharge applies.
pub const MULTI_PARTY_THRESHOLD: u32 = 2;

/// Fee breakdown shares in percent. The dispute reserve takes whatever
/// rounding leaves over, so the parts always add up to the fee.
pub const PLATFORM_SHARE_PCT: u64 = 60;
pub const PROCESSING_SHARE_PCT: u64 = 25;
pub const INSURANCE_SHARE_PCT: u64 = 10;
pub const DISPUTE_RESERVE_SHARE_PCT: u64 = 5;

// ---------------------------------------------------------------------------
// Verification Thresholds
// ---------------------------------------------------------------------------

/// Amounts at or above this need the medium verification tier (1,000.00).
pub const MEDIUM_VERIFICATION_THRESHOLD: u64 = 1_000 * MINOR_UNITS_PER_MAJOR;

/// Amounts at or above this need the high verification tier (10,000.00).
pub const HIGH_VERIFICATION_THRESHOLD: u64 = 10_000 * MINOR_UNITS_PER_MAJOR;

// ---------------------------------------------------------------------------
// Lifecycle Deadlines
// ---------------------------------------------------------------------------

/// How long a buyer has to fund a freshly created transaction.
pub const PAYMENT_WINDOW_HOURS: i64 = 24;

/// Delivery deadline, counted from funding.
pub const DELIVERY_WINDOW_DAYS: i64 = 7;

/// Buyer confirmation deadline, counted from delivery.
pub const CONFIRMATION_WINDOW_DAYS: i64 = 3;

/// Auto-release deadline, counted from funding.
pub const AUTO_RELEASE_WINDOW_DAYS: i64 = 14;

/// Dispute resolution deadline, counted from opening.
pub const DISPUTE_RESOLUTION_DAYS: i64 = 7;

/// Upper bound on a single payment-gateway round trip.
pub const DEFAULT_GATEWAY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Reputation
// ---------------------------------------------------------------------------

/// Score every user starts with. Also the ceiling.
pub const INITIAL_REPUTATION_SCORE: i64 = 100;

/// Floor for the reputation score.
pub const MIN_REPUTATION_SCORE: i64 = 0;

/// Penalty for opening a dispute.
pub const DISPUTE_RAISED_PENALTY: i64 = 5;

/// Penalty for losing a dispute.
pub const DISPUTE_LOST_PENALTY: i64 = 10;

/// Bonus for a rating of 4 or 5 stars.
pub const GOOD_RATING_BONUS: i64 = 1;

/// Penalty for a rating of 1 or 2 stars.
pub const POOR_RATING_PENALTY: i64 = 2;

// ---------------------------------------------------------------------------
// Payouts
// ---------------------------------------------------------------------------

/// Minimum amount a payout must reach before money moves (100.00).
pub const DEFAULT_MIN_PAYOUT: u64 = 100 * MINOR_UNITS_PER_MAJOR;

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Tunable knobs for an [`EscrowEngine`](crate::engine::EscrowEngine).
///
/// The defaults mirror the constants above. Tests shrink the windows;
/// deployments usually only touch `min_payout` and `gateway_timeout`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub payment_window: Duration,
    pub delivery_window: Duration,
    pub confirmation_window: Duration,
    pub auto_release_window: Duration,
    pub dispute_window: Duration,
    /// Minimum payout in minor units.
    pub min_payout: u64,
    pub gateway_timeout: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payment_window: Duration::hours(PAYMENT_WINDOW_HOURS),
            delivery_window: Duration::days(DELIVERY_WINDOW_DAYS),
            confirmation_window: Duration::days(CONFIRMATION_WINDOW_DAYS),
            auto_release_window: Duration::days(AUTO_RELEASE_WINDOW_DAYS),
            dispute_window: Duration::days(DISPUTE_RESOLUTION_DAYS),
            min_payout: DEFAULT_MIN_PAYOUT,
            gateway_timeout: DEFAULT_GATEWAY_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn with_min_payout(mut self, min_payout: u64) -> Self {
        self.min_payout = min_payout;
        self
    }

    pub fn with_gateway_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    pub fn with_payment_window(mut self, window: Duration) -> Self {
        self.payment_window = window;
        self
    }

    pub fn with_dispute_window(mut self, window: Duration) -> Self {
        self.dispute_window = window;
        self
    }
}
