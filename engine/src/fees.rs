//! # Fee Calculator
//!
//! Pure, deterministic platform-fee computation. Given an amount, the kind of
//! thing being traded, and how many parties take part, produces a
//! [`FeeQuote`] with the clamped fee and its reporting breakdown.
//!
//! ## Formula
//!
//! ```text
//! multiplier = max(1.0, type_multiplier × volume_discount)
//! multiplier = multiplier × 1.1            if parties > 2
//! fee        = clamp(round(amount × 2.5% × multiplier), 5.00, 500.00)
//! ```
//!
//! The volume discount shrinks type premiums but never takes the effective
//! rate below the 2.5% base rate. Types already at 1.0× (`digital_product`
//! and any unknown type) therefore get no volume discount at all: a
//! 20,000.00 digital sale pays the full 2.5%. Everything runs in basis points on
//! `u128`, rounding half-up once at the end.

use serde::{Deserialize, Serialize};

use crate::config::{
    BASE_FEE_BPS, BPS_DENOMINATOR, INSURANCE_SHARE_PCT, MAX_FEE, MIN_FEE,
    MULTI_PARTY_SURCHARGE_BPS, MULTI_PARTY_THRESHOLD, PLATFORM_SHARE_PCT, PROCESSING_SHARE_PCT,
    VOLUME_DISCOUNT_TIERS,
};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What is being traded. Determines the fee multiplier.
///
/// Travels as a bare snake_case string. Names outside the table are kept
/// verbatim in [`TransactionType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionType {
    DigitalProduct,
    PhysicalProduct,
    Service,
    SocialMediaAccount,
    IntellectualProperty,
    Domain,
    Cryptocurrency,
    /// Anything not in the table. Charged at 1.0×.
    Other(String),
}

impl TransactionType {
    /// Fee multiplier for this type, in basis points.
    pub fn multiplier_bps(&self) -> u64 {
        match self {
            TransactionType::DigitalProduct => 10_000,
            TransactionType::PhysicalProduct => 12_000,
            TransactionType::Service => 11_000,
            TransactionType::SocialMediaAccount => 15_000,
            TransactionType::IntellectualProperty => 18_000,
            TransactionType::Domain => 13_000,
            TransactionType::Cryptocurrency => 20_000,
            TransactionType::Other(_) => BPS_DENOMINATOR,
        }
    }

    /// Parses a snake_case type name. Unknown names become [`TransactionType::Other`].
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "digital_product" => TransactionType::DigitalProduct,
            "physical_product" => TransactionType::PhysicalProduct,
            "service" => TransactionType::Service,
            "social_media_account" => TransactionType::SocialMediaAccount,
            "intellectual_property" => TransactionType::IntellectualProperty,
            "domain" => TransactionType::Domain,
            "cryptocurrency" => TransactionType::Cryptocurrency,
            other => TransactionType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::DigitalProduct => write!(f, "digital_product"),
            TransactionType::PhysicalProduct => write!(f, "physical_product"),
            TransactionType::Service => write!(f, "service"),
            TransactionType::SocialMediaAccount => write!(f, "social_media_account"),
            TransactionType::IntellectualProperty => write!(f, "intellectual_property"),
            TransactionType::Domain => write!(f, "domain"),
            TransactionType::Cryptocurrency => write!(f, "cryptocurrency"),
            TransactionType::Other(name) => write!(f, "{}", name),
        }
    }
}

impl From<String> for TransactionType {
    fn from(s: String) -> Self {
        TransactionType::from_str_lossy(&s)
    }
}

impl From<TransactionType> for String {
    fn from(t: TransactionType) -> Self {
        t.to_string()
    }
}

/// Fixed-ratio split of a fee, for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub platform: u64,
    pub payment_processing: u64,
    pub insurance: u64,
    pub dispute_reserve: u64,
}

impl FeeBreakdown {
    fn split(fee: u64) -> Self {
        let platform = fee * PLATFORM_SHARE_PCT / 100;
        let payment_processing = fee * PROCESSING_SHARE_PCT / 100;
        let insurance = fee * INSURANCE_SHARE_PCT / 100;
        Self {
            platform,
            payment_processing,
            insurance,
            dispute_reserve: fee - platform - payment_processing - insurance,
        }
    }

    pub fn total(&self) -> u64 {
        self.platform + self.payment_processing + self.insurance + self.dispute_reserve
    }
}

/// The result of a fee computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    /// Final fee in minor units, already clamped.
    pub fee: u64,
    /// Effective multiplier applied on top of the base rate, in bps.
    pub multiplier_bps: u64,
    /// Fee before clamping, in minor units.
    pub raw_fee: u64,
    pub breakdown: FeeBreakdown,
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// Volume discount for an amount, in bps. `10_000` when no tier applies.
pub fn volume_discount_bps(amount: u64) -> u64 {
    VOLUME_DISCOUNT_TIERS
        .iter()
        .find(|(threshold, _)| amount > *threshold)
        .map(|(_, bps)| *bps)
        .unwrap_or(BPS_DENOMINATOR)
}

/// Effective multiplier in bps for the given inputs.
pub fn effective_multiplier_bps(amount: u64, tx_type: &TransactionType, party_count: u32) -> u64 {
    let discounted = tx_type.multiplier_bps() * volume_discount_bps(amount) / BPS_DENOMINATOR;
    let floored = discounted.max(BPS_DENOMINATOR);
    if party_count > MULTI_PARTY_THRESHOLD {
        floored * MULTI_PARTY_SURCHARGE_BPS / BPS_DENOMINATOR
    } else {
        floored
    }
}

/// Computes the platform fee for a transaction.
///
/// Always returns a fee within `[MIN_FEE, MAX_FEE]`.
pub fn compute_fee(amount: u64, tx_type: &TransactionType, party_count: u32) -> FeeQuote {
    let multiplier_bps = effective_multiplier_bps(amount, tx_type, party_count);

    let denominator = (BPS_DENOMINATOR as u128) * (BPS_DENOMINATOR as u128);
    let numerator = amount as u128 * BASE_FEE_BPS as u128 * multiplier_bps as u128;
    let rounded = (numerator + denominator / 2) / denominator;
    let raw_fee = u64::try_from(rounded).unwrap_or(u64::MAX);

    let fee = raw_fee.clamp(MIN_FEE, MAX_FEE);

    FeeQuote {
        fee,
        multiplier_bps,
        raw_fee,
        breakdown: FeeBreakdown::split(fee),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_at_five_thousand_is_base_rate() {
        // 5,000.00 service, two parties: 1.1 × 0.9 floors to 1.0.
        let q = compute_fee(500_000, &TransactionType::Service, 2);
        assert_eq!(q.multiplier_bps, 10_000);
        assert_eq!(q.fee, 12_500);
        assert_eq!(500_000 - q.fee, 487_500);
    }

    #[test]
    fn crypto_at_twelve_thousand() {
        let q = compute_fee(1_200_000, &TransactionType::Cryptocurrency, 2);
        assert_eq!(q.multiplier_bps, 16_000);
        assert_eq!(q.fee, 48_000);
    }

    #[test]
    fn tiny_amount_hits_min_fee() {
        let q = compute_fee(100, &TransactionType::DigitalProduct, 2);
        assert_eq!(q.fee, MIN_FEE);
        assert!(q.raw_fee < MIN_FEE);
    }

    #[test]
    fn huge_amount_hits_max_fee() {
        let q = compute_fee(100_000_000, &TransactionType::IntellectualProperty, 5);
        assert_eq!(q.fee, MAX_FEE);
    }

    #[test]
    fn unknown_type_defaults_to_one() {
        let t = TransactionType::from_str_lossy("vintage_guitars");
        assert_eq!(t, TransactionType::Other("vintage_guitars".into()));
        assert_eq!(t.multiplier_bps(), 10_000);
    }

    #[test]
    fn multi_party_surcharge_applies_after_floor() {
        // 800.00 digital: no volume tier, 1.0 × 1.1.
        let q = compute_fee(80_000, &TransactionType::DigitalProduct, 3);
        assert_eq!(q.multiplier_bps, 11_000);
        assert_eq!(q.fee, 2_200);
    }

    #[test]
    fn volume_tiers_use_strict_bounds() {
        assert_eq!(volume_discount_bps(100_000), 10_000);
        assert_eq!(volume_discount_bps(100_001), 9_000);
        assert_eq!(volume_discount_bps(500_001), 8_500);
        assert_eq!(volume_discount_bps(1_000_001), 8_000);
    }

    #[test]
    fn physical_product_keeps_part_of_premium() {
        // 6,000.00 physical: 1.2 × 0.85 = 1.02.
        let q = compute_fee(600_000, &TransactionType::PhysicalProduct, 2);
        assert_eq!(q.multiplier_bps, 10_200);
        assert_eq!(q.fee, 15_300);
    }

    #[test]
    fn breakdown_always_sums_to_fee() {
        for amount in [1u64, 333, 77_777, 1_234_567, 99_999_999] {
            let q = compute_fee(amount, &TransactionType::Domain, 4);
            assert_eq!(q.breakdown.total(), q.fee);
        }
    }

    #[test]
    fn fee_is_always_clamped() {
        let types = [
            TransactionType::DigitalProduct,
            TransactionType::Cryptocurrency,
            TransactionType::Other("x".into()),
        ];
        for t in &types {
            for amount in [0u64, 1, 50_000, 10_000_000, u64::MAX / 4] {
                let q = compute_fee(amount, t, 3);
                assert!(q.fee >= MIN_FEE && q.fee <= MAX_FEE);
            }
        }
    }

    #[test]
    fn base_rate_types_get_no_volume_discount() {
        let q = compute_fee(2_000_000, &TransactionType::DigitalProduct, 2);
        assert_eq!(q.multiplier_bps, 10_000);
        assert_eq!(q.fee, 50_000);

        // 15,000.00 sits in the 0.8× tier but still pays 2.5%.
        let q = compute_fee(1_500_000, &TransactionType::Other("art".into()), 2);
        assert_eq!(q.multiplier_bps, 10_000);
        assert_eq!(q.fee, 37_500);
    }

    #[test]
    fn types_travel_as_plain_strings() {
        let known: TransactionType = serde_json::from_str(r#""physical_product""#).unwrap();
        assert_eq!(known, TransactionType::PhysicalProduct);

        let unknown: TransactionType = serde_json::from_str(r#""vintage_guitar""#).unwrap();
        assert_eq!(unknown, TransactionType::Other("vintage_guitar".into()));
        assert_eq!(serde_json::to_string(&unknown).unwrap(), r#""vintage_guitar""#);
        assert_eq!(
            serde_json::to_string(&TransactionType::Domain).unwrap(),
            r#""domain""#
        );
    }

    #[test]
    fn type_names_round_trip_through_display() {
        let t = TransactionType::from_str_lossy("Social_Media_Account");
        assert_eq!(t, TransactionType::SocialMediaAccount);
        assert_eq!(t.to_string(), "social_media_account");
    }
}
