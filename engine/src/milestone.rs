//! # Milestone Plan
//!
//! Splits a transaction's total into ordered sub-payments. The plan is
//! validated once at construction: at least one milestone, contiguous
//! sequence numbers from 1, and amounts that add up to the transaction
//! total exactly. After that, milestones only move forward:
//!
//! ```text
//!   Pending ──► InProgress ──► Completed ──► Approved ──► Paid
//!      └──────────────────────────▲
//! ```
//!
//! `Approved` lives only while the partial capture for that milestone is in
//! flight; a failed capture leaves the milestone `Completed` so the buyer
//! can approve again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EscrowError, EscrowResult};

/// Lifecycle of a single milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    Approved,
    Paid,
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MilestoneStatus::Pending => write!(f, "Pending"),
            MilestoneStatus::InProgress => write!(f, "InProgress"),
            MilestoneStatus::Completed => write!(f, "Completed"),
            MilestoneStatus::Approved => write!(f, "Approved"),
            MilestoneStatus::Paid => write!(f, "Paid"),
        }
    }
}

/// Caller-supplied description of a milestone, before sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Amount in minor units.
    pub amount: u64,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
}

/// A sequenced milestone owned by its transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    /// 1-based position in the plan.
    pub sequence: u32,
    pub title: String,
    pub description: String,
    pub amount: u64,
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    pub requirements: Vec<String>,
    pub deliverables: Vec<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// The ordered milestones of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestonePlan {
    milestones: Vec<Milestone>,
}

impl MilestonePlan {
    /// Builds a plan whose amounts partition `total` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] for an empty plan, an empty title,
    /// or a sum that differs from `total`.
    pub fn new(specs: Vec<MilestoneSpec>, total: u64) -> EscrowResult<Self> {
        if specs.is_empty() {
            return Err(EscrowError::validation(
                "milestones",
                "a milestone plan needs at least one milestone",
            ));
        }

        let mut sum: u64 = 0;
        for (i, spec) in specs.iter().enumerate() {
            if spec.title.trim().is_empty() {
                return Err(EscrowError::validation(
                    "milestones",
                    format!("milestone {} has an empty title", i + 1),
                ));
            }
            sum = sum.checked_add(spec.amount).ok_or_else(|| {
                EscrowError::validation("milestones", "milestone amounts overflow")
            })?;
        }

        if sum != total {
            return Err(EscrowError::validation(
                "milestones",
                format!(
                    "milestone amounts sum to {} but the transaction total is {}",
                    sum, total
                ),
            ));
        }

        let milestones = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Milestone {
                sequence: i as u32 + 1,
                title: spec.title,
                description: spec.description,
                amount: spec.amount,
                due_date: spec.due_date,
                status: MilestoneStatus::Pending,
                requirements: spec.requirements,
                deliverables: spec.deliverables,
                paid_at: None,
            })
            .collect();

        Ok(Self { milestones })
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn len(&self) -> usize {
        self.milestones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.milestones.is_empty()
    }

    pub fn get(&self, sequence: u32) -> EscrowResult<&Milestone> {
        self.milestones
            .iter()
            .find(|m| m.sequence == sequence)
            .ok_or_else(|| EscrowError::not_found("milestone", &sequence.to_string()))
    }

    fn get_mut(&mut self, sequence: u32) -> EscrowResult<&mut Milestone> {
        self.milestones
            .iter_mut()
            .find(|m| m.sequence == sequence)
            .ok_or_else(|| EscrowError::not_found("milestone", &sequence.to_string()))
    }

    /// Returns `true` once any milestone has left `Pending`.
    pub fn has_progress(&self) -> bool {
        self.milestones
            .iter()
            .any(|m| m.status != MilestoneStatus::Pending)
    }

    pub fn all_paid(&self) -> bool {
        self.milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Paid)
    }

    /// Seller starts working on a milestone.
    pub fn start(&mut self, sequence: u32) -> EscrowResult<()> {
        let m = self.get_mut(sequence)?;
        if m.status != MilestoneStatus::Pending {
            return Err(EscrowError::invalid_state(
                "start_milestone",
                m.status,
                "Pending",
            ));
        }
        m.status = MilestoneStatus::InProgress;
        Ok(())
    }

    /// Seller reports a milestone as done.
    pub fn complete(&mut self, sequence: u32) -> EscrowResult<()> {
        let m = self.get_mut(sequence)?;
        match m.status {
            MilestoneStatus::Pending | MilestoneStatus::InProgress => {
                m.status = MilestoneStatus::Completed;
                Ok(())
            }
            other => Err(EscrowError::invalid_state(
                "complete_milestone",
                other,
                "Pending or InProgress",
            )),
        }
    }

    /// Buyer signs off on a completed milestone. Returns the amount to capture.
    pub fn approve(&mut self, sequence: u32) -> EscrowResult<u64> {
        let m = self.get_mut(sequence)?;
        if m.status != MilestoneStatus::Completed {
            return Err(EscrowError::invalid_state(
                "approve_milestone",
                m.status,
                "Completed",
            ));
        }
        m.status = MilestoneStatus::Approved;
        Ok(m.amount)
    }

    /// Records the capture for an approved milestone.
    pub fn mark_paid(&mut self, sequence: u32, at: DateTime<Utc>) -> EscrowResult<()> {
        let m = self.get_mut(sequence)?;
        if m.status != MilestoneStatus::Approved {
            return Err(EscrowError::invalid_state(
                "pay_milestone",
                m.status,
                "Approved",
            ));
        }
        m.status = MilestoneStatus::Paid;
        m.paid_at = Some(at);
        Ok(())
    }

    /// Settles every unpaid milestone at once, used when the remainder of the
    /// hold is captured in a single step. Returns the amount settled.
    pub fn settle_remaining(&mut self, at: DateTime<Utc>) -> u64 {
        let mut settled = 0;
        for m in self
            .milestones
            .iter_mut()
            .filter(|m| m.status != MilestoneStatus::Paid)
        {
            settled += m.amount;
            m.status = MilestoneStatus::Paid;
            m.paid_at = Some(at);
        }
        settled
    }
}
