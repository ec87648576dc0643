//! # Dispute Workflow
//!
//! A dispute hangs off exactly one transaction and freezes its normal flow
//! until a mediator rules on it. Either party can open one while funds are
//! held, both can attach evidence and talk in the message thread, and an
//! assigned mediator issues the binding [`ResolutionOutcome`].
//!
//! ## States
//!
//! ```text
//!   Open ──(mediator assigned)──► UnderReview ──(resolve)──► Resolved
//!     │                               │
//!     └──────────(withdraw)───────────┴─────────────────────► Closed
//! ```
//!
//! ## Evidence Model
//!
//! Evidence payloads (documents, screenshots, chat exports) live outside the
//! engine. When a payload is supplied its BLAKE3 digest is stored as a
//! tamper-evident anchor; only the digest and a description are kept.
//!
//! ## Deadlines
//!
//! A dispute that passes its resolution deadline is escalated, never
//! auto-resolved: releasing or refunding custodied funds always takes a
//! human decision.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BPS_DENOMINATOR;
use crate::error::{EscrowError, EscrowResult};
use crate::transaction::PartyRole;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the initiator claims went wrong. Serialized as a bare string;
/// unrecognized names land in [`DisputeType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DisputeType {
    NonDelivery,
    NotAsDescribed,
    QualityIssue,
    Unauthorized,
    Fraud,
    Other(String),
}

impl DisputeType {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "non_delivery" => DisputeType::NonDelivery,
            "not_as_described" => DisputeType::NotAsDescribed,
            "quality_issue" => DisputeType::QualityIssue,
            "unauthorized" => DisputeType::Unauthorized,
            "fraud" => DisputeType::Fraud,
            other => DisputeType::Other(other.to_string()),
        }
    }

    /// Priority a dispute of this type starts with.
    pub fn priority(&self) -> DisputePriority {
        match self {
            DisputeType::Unauthorized | DisputeType::Fraud => DisputePriority::High,
            DisputeType::NonDelivery => DisputePriority::Medium,
            _ => DisputePriority::Low,
        }
    }
}

impl std::fmt::Display for DisputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisputeType::NonDelivery => write!(f, "non_delivery"),
            DisputeType::NotAsDescribed => write!(f, "not_as_described"),
            DisputeType::QualityIssue => write!(f, "quality_issue"),
            DisputeType::Unauthorized => write!(f, "unauthorized"),
            DisputeType::Fraud => write!(f, "fraud"),
            DisputeType::Other(name) => write!(f, "{}", name),
        }
    }
}

impl From<String> for DisputeType {
    fn from(s: String) -> Self {
        DisputeType::from_str_lossy(&s)
    }
}

impl From<DisputeType> for String {
    fn from(t: DisputeType) -> Self {
        t.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputePriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
    Closed,
}

impl DisputeStatus {
    /// Open and under-review disputes block the transaction.
    pub fn is_active(&self) -> bool {
        matches!(self, DisputeStatus::Open | DisputeStatus::UnderReview)
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisputeStatus::Open => write!(f, "Open"),
            DisputeStatus::UnderReview => write!(f, "UnderReview"),
            DisputeStatus::Resolved => write!(f, "Resolved"),
            DisputeStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// The ruling a mediator issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Seller keeps the money; the buyer is found at fault.
    ReleaseToSeller,
    /// Buyer gets the money back; the seller is found at fault.
    RefundToBuyer,
    /// Seller receives `seller_share_bps` of what is still held, the buyer
    /// the rest. Nobody is penalized.
    Split { seller_share_bps: u16 },
}

impl ResolutionOutcome {
    fn validate(&self) -> EscrowResult<()> {
        if let ResolutionOutcome::Split { seller_share_bps } = self {
            if *seller_share_bps as u64 > BPS_DENOMINATOR {
                return Err(EscrowError::validation(
                    "seller_share_bps",
                    format!("must be at most {}, got {}", BPS_DENOMINATOR, seller_share_bps),
                ));
            }
        }
        Ok(())
    }

    /// The party this outcome finds at fault.
    pub fn party_at_fault(&self) -> Option<PartyRole> {
        match self {
            ResolutionOutcome::ReleaseToSeller => Some(PartyRole::Buyer),
            ResolutionOutcome::RefundToBuyer => Some(PartyRole::Seller),
            ResolutionOutcome::Split { .. } => None,
        }
    }
}

/// A piece of evidence attached to a dispute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub submitted_by: String,
    pub description: String,
    /// Hex-encoded BLAKE3 digest of the off-engine payload, if one was given.
    pub data_hash: Option<String>,
    pub url: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Evidence as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceInput {
    pub description: String,
    /// Raw payload to anchor. Only its digest is stored.
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl EvidenceInput {
    fn into_evidence(self, submitted_by: &str, at: DateTime<Utc>) -> EscrowResult<Evidence> {
        if self.description.trim().is_empty() {
            return Err(EscrowError::validation(
                "evidence.description",
                "evidence needs a description",
            ));
        }
        Ok(Evidence {
            submitted_by: submitted_by.to_string(),
            description: self.description,
            data_hash: self.payload.map(|p| evidence_digest(p.as_bytes())),
            url: self.url,
            submitted_at: at,
        })
    }
}

/// Hex BLAKE3 digest used to anchor evidence payloads.
pub fn evidence_digest(payload: &[u8]) -> String {
    hex::encode(blake3::hash(payload).as_bytes())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeMessage {
    pub author: String,
    pub body: String,
    /// Messages written by the engine itself (escalations, assignments).
    pub system: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub resolved_by: String,
    pub notes: String,
    /// User id of the party found at fault, if any.
    pub at_fault: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Everything needed to open a dispute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDisputeRequest {
    pub initiator_id: String,
    pub dispute_type: DisputeType,
    pub reason: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
}

/// A dispute attached to an escrow transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub transaction_id: String,
    pub initiator_id: String,
    pub initiator_role: PartyRole,
    pub respondent_id: String,
    pub dispute_type: DisputeType,
    pub reason: String,
    pub description: String,
    pub evidence: Vec<Evidence>,
    pub priority: DisputePriority,
    pub status: DisputeStatus,
    pub mediator_id: Option<String>,
    pub resolution_deadline: DateTime<Utc>,
    pub resolution: Option<Resolution>,
    pub messages: Vec<DisputeMessage>,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

impl Dispute {
    /// Opens a new dispute in `Open` status.
    ///
    /// Party membership is checked by the owning transaction; this only
    /// validates the request body.
    pub fn open(
        transaction_id: &str,
        request: OpenDisputeRequest,
        initiator_role: PartyRole,
        respondent_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> EscrowResult<Self> {
        if request.reason.trim().is_empty() {
            return Err(EscrowError::validation("reason", "a dispute needs a reason"));
        }

        let evidence = request
            .evidence
            .into_iter()
            .map(|e| e.into_evidence(&request.initiator_id, now))
            .collect::<EscrowResult<Vec<_>>>()?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            transaction_id: transaction_id.to_string(),
            priority: request.dispute_type.priority(),
            initiator_id: request.initiator_id,
            initiator_role,
            respondent_id: respondent_id.to_string(),
            dispute_type: request.dispute_type,
            reason: request.reason,
            description: request.description,
            evidence,
            status: DisputeStatus::Open,
            mediator_id: None,
            resolution_deadline: now + window,
            resolution: None,
            messages: Vec::new(),
            escalated: false,
            escalated_at: None,
            created_at: now,
            closed_at: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn is_party(&self, user_id: &str) -> bool {
        user_id == self.initiator_id || user_id == self.respondent_id
    }

    fn is_participant(&self, user_id: &str) -> bool {
        self.is_party(user_id) || self.mediator_id.as_deref() == Some(user_id)
    }

    fn ensure_active(&self, operation: &str) -> EscrowResult<()> {
        if !self.is_active() {
            return Err(EscrowError::invalid_state(
                operation,
                self.status,
                "Open or UnderReview",
            ));
        }
        Ok(())
    }

    fn deny(&self, actor: &str, action: &str) -> EscrowError {
        EscrowError::access_denied(actor, action, &self.transaction_id)
    }

    /// Attaches evidence. Parties and the mediator may submit.
    pub fn submit_evidence(
        &mut self,
        submitted_by: &str,
        input: EvidenceInput,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        if !self.is_participant(submitted_by) {
            return Err(self.deny(submitted_by, "submit evidence"));
        }
        self.ensure_active("submit_evidence")?;
        let evidence = input.into_evidence(submitted_by, now)?;
        self.evidence.push(evidence);
        Ok(())
    }

    /// Appends a message to the thread.
    pub fn post_message(
        &mut self,
        author: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        if !self.is_participant(author) {
            return Err(self.deny(author, "post to dispute"));
        }
        self.ensure_active("post_message")?;
        if body.trim().is_empty() {
            return Err(EscrowError::validation("body", "message is empty"));
        }
        self.messages.push(DisputeMessage {
            author: author.to_string(),
            body: body.to_string(),
            system: false,
            sent_at: now,
        });
        Ok(())
    }

    pub(crate) fn system_message(&mut self, body: String, now: DateTime<Utc>) {
        self.messages.push(DisputeMessage {
            author: "system".into(),
            body,
            system: true,
            sent_at: now,
        });
    }

    /// Hands the dispute to a mediator and moves it under review.
    pub fn assign_mediator(&mut self, mediator_id: &str, now: DateTime<Utc>) -> EscrowResult<()> {
        self.ensure_active("assign_mediator")?;
        if self.is_party(mediator_id) {
            return Err(EscrowError::validation(
                "mediator_id",
                "a party to the dispute cannot mediate it",
            ));
        }
        self.mediator_id = Some(mediator_id.to_string());
        self.status = DisputeStatus::UnderReview;
        self.system_message(format!("mediator {} assigned", mediator_id), now);
        Ok(())
    }

    /// Records the mediator's ruling.
    ///
    /// The caller maps the outcome onto the transaction; the party at fault
    /// is resolved by the caller too, since only the transaction knows who
    /// is buyer and who is seller.
    pub fn resolve(
        &mut self,
        outcome: ResolutionOutcome,
        resolved_by: &str,
        notes: String,
        at_fault: Option<String>,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.ensure_active("resolve_dispute")?;
        outcome.validate()?;

        if self.is_party(resolved_by) {
            return Err(self.deny(resolved_by, "resolve their own dispute"));
        }
        match self.mediator_id.as_deref() {
            Some(mediator) if mediator != resolved_by => {
                return Err(self.deny(resolved_by, "resolve a dispute assigned to another mediator"));
            }
            None => {
                return Err(EscrowError::invalid_state(
                    "resolve_dispute",
                    "no mediator assigned",
                    "a mediator assigned",
                ));
            }
            _ => {}
        }

        self.status = DisputeStatus::Resolved;
        self.resolution = Some(Resolution {
            outcome,
            resolved_by: resolved_by.to_string(),
            notes,
            at_fault,
            resolved_at: now,
        });
        self.closed_at = Some(now);
        Ok(())
    }

    /// Initiator drops the dispute before a ruling.
    pub fn withdraw(&mut self, caller: &str, now: DateTime<Utc>) -> EscrowResult<()> {
        if caller != self.initiator_id {
            return Err(self.deny(caller, "withdraw a dispute they did not open"));
        }
        self.ensure_active("withdraw_dispute")?;
        self.status = DisputeStatus::Closed;
        self.closed_at = Some(now);
        Ok(())
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && now >= self.resolution_deadline
    }

    /// Flags an overdue dispute for human attention. Returns `false` when
    /// there was nothing to do, which makes repeated sweeps harmless.
    pub fn escalate(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_overdue(now) || self.escalated {
            return false;
        }
        self.escalated = true;
        self.escalated_at = Some(now);
        self.priority = DisputePriority::High;
        self.system_message(
            format!(
                "resolution deadline {} passed; escalated for review",
                self.resolution_deadline.to_rfc3339()
            ),
            now,
        );
        true
    }
}
