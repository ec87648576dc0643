//! # Verification Policy
//!
//! Maps a transaction amount to the identity-verification tier both parties
//! must clear, and each tier to the ordered list of checks it requires.
//! Higher tiers are strict supersets of lower ones.

use serde::{Deserialize, Serialize};

use crate::config::{HIGH_VERIFICATION_THRESHOLD, MEDIUM_VERIFICATION_THRESHOLD};

/// How much identity assurance a transaction needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationTier::Low => write!(f, "low"),
            VerificationTier::Medium => write!(f, "medium"),
            VerificationTier::High => write!(f, "high"),
        }
    }
}

/// A single identity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    IdScan,
    FacialMatch,
    AddressConfirmation,
    BankVerification,
    LiveCall,
}

const LOW_METHODS: &[VerificationMethod] = &[VerificationMethod::IdScan];

const MEDIUM_METHODS: &[VerificationMethod] = &[
    VerificationMethod::IdScan,
    VerificationMethod::FacialMatch,
    VerificationMethod::AddressConfirmation,
];

const HIGH_METHODS: &[VerificationMethod] = &[
    VerificationMethod::IdScan,
    VerificationMethod::FacialMatch,
    VerificationMethod::AddressConfirmation,
    VerificationMethod::BankVerification,
    VerificationMethod::LiveCall,
];

impl VerificationTier {
    /// The checks this tier requires, cheapest first.
    pub fn required_methods(&self) -> &'static [VerificationMethod] {
        match self {
            VerificationTier::Low => LOW_METHODS,
            VerificationTier::Medium => MEDIUM_METHODS,
            VerificationTier::High => HIGH_METHODS,
        }
    }

    /// Returns the first required method missing from `completed`, if any.
    pub fn first_missing(&self, completed: &[VerificationMethod]) -> Option<VerificationMethod> {
        self.required_methods()
            .iter()
            .copied()
            .find(|m| !completed.contains(m))
    }

    pub fn is_satisfied_by(&self, completed: &[VerificationMethod]) -> bool {
        self.first_missing(completed).is_none()
    }
}

/// Tier required for a transaction of `amount` minor units.
pub fn required_tier(amount: u64) -> VerificationTier {
    if amount >= HIGH_VERIFICATION_THRESHOLD {
        VerificationTier::High
    } else if amount >= MEDIUM_VERIFICATION_THRESHOLD {
        VerificationTier::Medium
    } else {
        VerificationTier::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_inclusive() {
        assert_eq!(required_tier(99_999), VerificationTier::Low);
        assert_eq!(required_tier(100_000), VerificationTier::Medium);
        assert_eq!(required_tier(999_999), VerificationTier::Medium);
        assert_eq!(required_tier(1_000_000), VerificationTier::High);
    }

    #[test]
    fn higher_tiers_extend_lower_ones() {
        let low = VerificationTier::Low.required_methods();
        let medium = VerificationTier::Medium.required_methods();
        let high = VerificationTier::High.required_methods();
        assert!(low.iter().all(|m| medium.contains(m)));
        assert!(medium.iter().all(|m| high.contains(m)));
        assert_eq!(high.len(), 5);
    }

    #[test]
    fn first_missing_reports_in_order() {
        let done = [VerificationMethod::IdScan];
        assert_eq!(
            VerificationTier::Medium.first_missing(&done),
            Some(VerificationMethod::FacialMatch)
        );
        assert!(VerificationTier::Low.is_satisfied_by(&done));
    }
}
