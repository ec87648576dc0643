//! # Escrow Transaction
//!
//! The record at the center of the engine, and the pure state machine that
//! moves it. Nothing in this file performs I/O: every transition validates
//! its preconditions, mutates the record, appends one audit entry, and
//! reports what the caller still has to do at the payment gateway (capture
//! so much, refund the rest). The [`EscrowEngine`](crate::engine::EscrowEngine)
//! applies a transition to a copy, performs the gateway call, and persists
//! the copy only if the call succeeded, so a failed capture leaves the
//! stored record untouched.
//!
//! ## Lifecycle
//!
//! ```text
//!   PendingPayment ──fund──► Funded ──deliver──► Delivered ──confirm──► Completed
//!        │                    │  │                  │
//!        │ cancel/expire      │  └──── dispute ─────┤
//!        ▼                    ▼                     ▼
//!    Cancelled ◄──cancel── (Funded)             Disputed ──resolve──► Completed | Refunded
//! ```
//!
//! A withdrawn dispute puts the transaction back in whichever of `Funded` or
//! `Delivered` it was in when the dispute was opened.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, BPS_DENOMINATOR};
use crate::dispute::{
    Dispute, EvidenceInput, OpenDisputeRequest, ResolutionOutcome,
};
use crate::error::{EscrowError, EscrowResult};
use crate::fees::{compute_fee, FeeQuote, TransactionType};
use crate::milestone::{MilestonePlan, MilestoneSpec};
use crate::verification::{required_tier, VerificationMethod, VerificationTier};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Business status of an escrow transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    PendingPayment,
    Funded,
    Delivered,
    Disputed,
    Completed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Cancelled | TransactionStatus::Refunded
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::PendingPayment => write!(f, "PendingPayment"),
            TransactionStatus::Funded => write!(f, "Funded"),
            TransactionStatus::Delivered => write!(f, "Delivered"),
            TransactionStatus::Disputed => write!(f, "Disputed"),
            TransactionStatus::Completed => write!(f, "Completed"),
            TransactionStatus::Cancelled => write!(f, "Cancelled"),
            TransactionStatus::Refunded => write!(f, "Refunded"),
        }
    }
}

/// Custody state of the funds at the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Held,
    Released,
    Refunded,
    /// Milestone captures went to the seller, the rest of the hold back to
    /// the buyer.
    PartiallyRefunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Delivered,
    Confirmed,
    Rejected,
}

/// Which side of the trade a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Buyer,
    Seller,
}

impl std::fmt::Display for PartyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartyRole::Buyer => write!(f, "buyer"),
            PartyRole::Seller => write!(f, "seller"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub delivery_method: String,
    #[serde(default)]
    pub delivery_timeframe: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub proof_url: Option<String>,
    #[serde(default)]
    pub notes: String,
}

/// Buyer's rating of the seller, given at confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingData {
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub description: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub created_at: DateTime<Utc>,
    pub payment_deadline: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub delivery_deadline: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub confirmation_deadline: Option<DateTime<Utc>>,
    pub auto_release_deadline: Option<DateTime<Utc>>,
    /// Stamped when the transaction reaches any terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationState {
    pub tier: VerificationTier,
    pub buyer_verified: bool,
    pub seller_verified: bool,
}

/// What a buyer submits to open an escrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub buyer_id: String,
    pub seller_id: String,
    pub item: ItemDetails,
    pub transaction_type: TransactionType,
    /// Total in minor units.
    pub amount: u64,
    pub currency: String,
    #[serde(default = "default_party_count")]
    pub party_count: u32,
    #[serde(default)]
    pub milestones: Option<Vec<MilestoneSpec>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_party_count() -> u32 {
    2
}

impl CreateTransactionRequest {
    /// Checks required fields and builds the milestone plan, if any.
    pub fn validate(&self) -> EscrowResult<Option<MilestonePlan>> {
        let required = [
            ("buyer_id", &self.buyer_id),
            ("seller_id", &self.seller_id),
            ("item.title", &self.item.title),
            ("item.description", &self.item.description),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(EscrowError::validation(field, "is required"));
            }
        }
        if self.buyer_id == self.seller_id {
            return Err(EscrowError::validation(
                "seller_id",
                "buyer and seller must be different users",
            ));
        }
        if self.amount == 0 {
            return Err(EscrowError::validation("amount", "must be greater than zero"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(EscrowError::validation(
                "currency",
                format!("expected a 3-letter uppercase code, got '{}'", self.currency),
            ));
        }
        if self.party_count < 2 {
            return Err(EscrowError::validation(
                "party_count",
                "an escrow has at least two parties",
            ));
        }

        self.milestones
            .as_ref()
            .map(|specs| MilestonePlan::new(specs.clone(), self.amount))
            .transpose()
    }
}

/// How a transition wants the gateway to settle the hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Amount to capture for the seller. Zero means no capture call.
    pub capture: u64,
    /// Whether the uncaptured rest of the hold goes back to the buyer.
    pub refund: bool,
}

/// Result of a milestone approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MilestonePayment {
    pub sequence: u32,
    pub amount: u64,
    /// Every milestone is now paid.
    pub releases_funds: bool,
    /// The payment also completed the transaction.
    pub completes_transaction: bool,
}

/// Outcome of a dispute ruling, for the caller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeSettlement {
    pub settlement: Settlement,
    pub outcome: ResolutionOutcome,
    /// User id of the party found at fault.
    pub at_fault: Option<String>,
}

/// An escrow transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub item: ItemDetails,
    pub transaction_type: TransactionType,
    pub amount: u64,
    pub currency: String,
    pub party_count: u32,
    pub fee: FeeQuote,
    pub seller_net: u64,
    /// Total captured at the gateway so far.
    pub captured_amount: u64,
    pub milestones: Option<MilestonePlan>,
    pub verification: VerificationState,
    pub status: TransactionStatus,
    pub payment_status: PaymentStatus,
    pub delivery_status: DeliveryStatus,
    pub hold_id: String,
    pub payment_method: Option<String>,
    pub delivery_info: Option<DeliveryInfo>,
    pub seller_rating: Option<RatingData>,
    pub cancellation_reason: Option<String>,
    /// A refund the gateway has not confirmed yet. Retried by the sweep.
    pub refund_pending: bool,
    /// Every dispute ever opened, oldest first. At most one is active.
    pub disputes: Vec<Dispute>,
    pub status_before_dispute: Option<TransactionStatus>,
    pub timeline: Timeline,
    pub audit_trail: Vec<AuditEntry>,
    pub metadata: BTreeMap<String, String>,
    /// Optimistic-concurrency counter. Bumped by every persisted change.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Builds a new transaction in `PendingPayment` around an existing hold.
    ///
    /// `plan` must come from [`CreateTransactionRequest::validate`].
    pub fn new(
        id: String,
        request: CreateTransactionRequest,
        plan: Option<MilestonePlan>,
        hold_id: String,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let fee = compute_fee(request.amount, &request.transaction_type, request.party_count);
        let mut tx = Self {
            id,
            buyer_id: request.buyer_id,
            seller_id: request.seller_id,
            item: request.item,
            transaction_type: request.transaction_type,
            amount: request.amount,
            currency: request.currency,
            party_count: request.party_count,
            seller_net: request.amount.saturating_sub(fee.fee),
            fee,
            captured_amount: 0,
            milestones: plan,
            verification: VerificationState {
                tier: required_tier(request.amount),
                buyer_verified: false,
                seller_verified: false,
            },
            status: TransactionStatus::PendingPayment,
            payment_status: PaymentStatus::Pending,
            delivery_status: DeliveryStatus::Pending,
            hold_id,
            payment_method: None,
            delivery_info: None,
            seller_rating: None,
            cancellation_reason: None,
            refund_pending: false,
            disputes: Vec::new(),
            status_before_dispute: None,
            timeline: Timeline {
                created_at: now,
                payment_deadline: now + config.payment_window,
                funded_at: None,
                delivery_deadline: None,
                delivered_at: None,
                confirmation_deadline: None,
                auto_release_deadline: None,
                completed_at: None,
            },
            audit_trail: Vec::new(),
            metadata: request.metadata,
            version: 0,
            updated_at: now,
        };
        let buyer = tx.buyer_id.clone();
        tx.record(
            "created",
            format!(
                "escrow of {} {} created, fee {}",
                tx.amount, tx.currency, tx.fee.fee
            ),
            &buyer,
            now,
        );
        tx
    }

    // -- Helpers ------------------------------------------------------------

    fn record(&mut self, action: &str, description: String, actor: &str, now: DateTime<Utc>) {
        self.audit_trail.push(AuditEntry {
            action: action.to_string(),
            description,
            actor: actor.to_string(),
            timestamp: now,
        });
        self.updated_at = now;
    }

    pub fn role_of(&self, user_id: &str) -> Option<PartyRole> {
        if user_id == self.buyer_id {
            Some(PartyRole::Buyer)
        } else if user_id == self.seller_id {
            Some(PartyRole::Seller)
        } else {
            None
        }
    }

    pub fn party_id(&self, role: PartyRole) -> &str {
        match role {
            PartyRole::Buyer => &self.buyer_id,
            PartyRole::Seller => &self.seller_id,
        }
    }

    fn require_party(&self, user_id: &str, action: &str) -> EscrowResult<PartyRole> {
        self.role_of(user_id)
            .ok_or_else(|| EscrowError::access_denied(user_id, action, &self.id))
    }

    fn require_role(&self, user_id: &str, role: PartyRole, action: &str) -> EscrowResult<()> {
        if self.role_of(user_id) != Some(role) {
            return Err(EscrowError::access_denied(user_id, action, &self.id));
        }
        Ok(())
    }

    fn require_status(&self, operation: &str, allowed: &[TransactionStatus]) -> EscrowResult<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        Err(EscrowError::invalid_state(operation, self.status, &expected))
    }

    /// Amount still held at the gateway.
    pub fn uncaptured_amount(&self) -> u64 {
        self.amount.saturating_sub(self.captured_amount)
    }

    /// What the seller actually earned: captured funds minus the platform fee.
    pub fn seller_earnings(&self) -> u64 {
        self.captured_amount.saturating_sub(self.fee.fee)
    }

    /// Closed with money captured for the seller, whatever the final status.
    pub fn has_seller_earnings(&self) -> bool {
        self.status.is_terminal() && self.captured_amount > 0
    }

    /// Hands back whatever is still held. Money already captured for paid
    /// milestones stays with the seller.
    fn refund_remaining(&mut self) -> Settlement {
        let held = matches!(
            self.status,
            TransactionStatus::Funded | TransactionStatus::Delivered | TransactionStatus::Disputed
        );
        if !held {
            return Settlement::default();
        }
        let refund = self.uncaptured_amount() > 0;
        self.payment_status = match (self.captured_amount > 0, refund) {
            (false, _) => PaymentStatus::Refunded,
            (true, true) => PaymentStatus::PartiallyRefunded,
            (true, false) => PaymentStatus::Released,
        };
        Settlement { capture: 0, refund }
    }

    /// Cancellation and expiry refund the hold; with nothing left in it there
    /// is nothing to undo, and the transaction can only move forward.
    fn require_uncaptured(&self, operation: &str) -> EscrowResult<()> {
        if self.status != TransactionStatus::PendingPayment && self.uncaptured_amount() == 0 {
            return Err(EscrowError::invalid_state(
                operation,
                "every milestone already paid",
                "funds still held",
            ));
        }
        Ok(())
    }

    pub fn active_dispute(&self) -> Option<&Dispute> {
        self.disputes.iter().find(|d| d.is_active())
    }

    fn active_dispute_mut(&mut self, dispute_id: &str) -> EscrowResult<&mut Dispute> {
        let dispute = self
            .disputes
            .iter_mut()
            .find(|d| d.id == dispute_id)
            .ok_or_else(|| EscrowError::not_found("dispute", dispute_id))?;
        Ok(dispute)
    }

    pub fn dispute(&self, dispute_id: &str) -> Option<&Dispute> {
        self.disputes.iter().find(|d| d.id == dispute_id)
    }

    fn finish(&mut self, status: TransactionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.timeline.completed_at = Some(now);
    }

    // -- Funding & delivery -------------------------------------------------

    /// Checks that the hold may still be confirmed.
    pub fn ensure_fundable(&self, now: DateTime<Utc>) -> EscrowResult<()> {
        self.require_status("fund", &[TransactionStatus::PendingPayment])?;
        if now >= self.timeline.payment_deadline {
            return Err(EscrowError::invalid_state(
                "fund",
                "payment deadline passed",
                "payment before the deadline",
            ));
        }
        Ok(())
    }

    /// Gateway confirmed the hold: the buyer's money is in escrow.
    pub fn fund(
        &mut self,
        payment_method: &str,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.ensure_fundable(now)?;

        self.status = TransactionStatus::Funded;
        self.payment_status = PaymentStatus::Held;
        self.delivery_status = DeliveryStatus::InProgress;
        self.payment_method = Some(payment_method.to_string());
        self.timeline.funded_at = Some(now);
        self.timeline.delivery_deadline = Some(now + config.delivery_window);
        self.timeline.auto_release_deadline = Some(now + config.auto_release_window);

        let buyer = self.buyer_id.clone();
        self.record(
            "funded",
            format!("{} {} held via {}", self.amount, self.currency, payment_method),
            &buyer,
            now,
        );
        Ok(())
    }

    /// Seller marks the item as delivered.
    pub fn deliver(
        &mut self,
        seller_id: &str,
        info: DeliveryInfo,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.require_role(seller_id, PartyRole::Seller, "mark delivered")?;
        self.require_status("deliver", &[TransactionStatus::Funded])?;

        let summary = match (&info.carrier, &info.tracking_number) {
            (Some(carrier), Some(tracking)) => format!("shipped via {} ({})", carrier, tracking),
            _ => "marked as delivered".to_string(),
        };
        self.status = TransactionStatus::Delivered;
        self.delivery_status = DeliveryStatus::Delivered;
        self.delivery_info = Some(info);
        self.timeline.delivered_at = Some(now);
        self.timeline.confirmation_deadline = Some(now + config.confirmation_window);

        self.record("delivered", summary, seller_id, now);
        Ok(())
    }

    /// Captures whatever is still held and closes the transaction as
    /// completed. Shared by buyer confirmation and auto-release.
    fn release_remaining(&mut self, now: DateTime<Utc>) -> Settlement {
        let capture = self.uncaptured_amount();
        self.captured_amount += capture;
        if let Some(plan) = self.milestones.as_mut() {
            plan.settle_remaining(now);
        }
        self.payment_status = PaymentStatus::Released;
        self.delivery_status = DeliveryStatus::Confirmed;
        self.finish(TransactionStatus::Completed, now);
        Settlement {
            capture,
            refund: false,
        }
    }

    /// Buyer confirms receipt. Returns the capture to request.
    pub fn confirm_delivery(
        &mut self,
        buyer_id: &str,
        rating: Option<RatingData>,
        now: DateTime<Utc>,
    ) -> EscrowResult<Settlement> {
        self.require_role(buyer_id, PartyRole::Buyer, "confirm delivery")?;
        self.require_status("confirm_delivery", &[TransactionStatus::Delivered])?;
        if let Some(r) = &rating {
            crate::reputation::validate_rating(r.rating)?;
        }

        let settlement = self.release_remaining(now);
        let description = match &rating {
            Some(r) => format!(
                "delivery confirmed, {} captured, seller rated {}",
                settlement.capture, r.rating
            ),
            None => format!("delivery confirmed, {} captured", settlement.capture),
        };
        self.seller_rating = rating;
        self.record("completed", description, buyer_id, now);
        Ok(settlement)
    }

    /// Releases funds to the seller once the auto-release deadline passes
    /// without the buyer confirming or disputing.
    pub fn auto_release(&mut self, now: DateTime<Utc>) -> EscrowResult<Settlement> {
        self.require_status("auto_release", &[TransactionStatus::Delivered])?;
        match self.timeline.auto_release_deadline {
            Some(deadline) if now >= deadline => {}
            _ => {
                return Err(EscrowError::invalid_state(
                    "auto_release",
                    "auto-release deadline not reached",
                    "auto-release deadline passed",
                ))
            }
        }

        let settlement = self.release_remaining(now);
        self.record(
            "auto_released",
            format!(
                "no confirmation before deadline, {} released to seller",
                settlement.capture
            ),
            "system",
            now,
        );
        Ok(settlement)
    }

    // -- Cancellation & expiry ----------------------------------------------

    /// Either party cancels before delivery. Returns whether the hold has to
    /// be refunded (only once funds were actually held, and only the part
    /// not yet captured for milestones).
    pub fn cancel(&mut self, actor: &str, reason: &str, now: DateTime<Utc>) -> EscrowResult<Settlement> {
        self.require_party(actor, "cancel")?;
        self.require_status(
            "cancel",
            &[TransactionStatus::PendingPayment, TransactionStatus::Funded],
        )?;
        self.require_uncaptured("cancel")?;
        let settlement = self.close_cancelled(reason, now);
        self.record("cancelled", format!("cancelled: {}", reason), actor, now);
        Ok(settlement)
    }

    fn close_cancelled(&mut self, reason: &str, now: DateTime<Utc>) -> Settlement {
        let settlement = self.refund_remaining();
        self.delivery_status = DeliveryStatus::Rejected;
        self.cancellation_reason = Some(reason.to_string());
        self.finish(TransactionStatus::Cancelled, now);
        settlement
    }

    /// Cancels an unpaid transaction past its payment deadline.
    pub fn expire_payment(&mut self, now: DateTime<Utc>) -> EscrowResult<Settlement> {
        self.require_status("expire_payment", &[TransactionStatus::PendingPayment])?;
        if now < self.timeline.payment_deadline {
            return Err(EscrowError::invalid_state(
                "expire_payment",
                "payment deadline not reached",
                "payment deadline passed",
            ));
        }
        let settlement = self.close_cancelled("payment deadline expired", now);
        self.record(
            "payment_expired",
            "not funded before the payment deadline".into(),
            "system",
            now,
        );
        Ok(settlement)
    }

    /// Refunds a funded transaction whose seller missed the delivery deadline.
    pub fn expire_delivery(&mut self, now: DateTime<Utc>) -> EscrowResult<Settlement> {
        self.require_status("expire_delivery", &[TransactionStatus::Funded])?;
        match self.timeline.delivery_deadline {
            Some(deadline) if now >= deadline => {}
            _ => {
                return Err(EscrowError::invalid_state(
                    "expire_delivery",
                    "delivery deadline not reached",
                    "delivery deadline passed",
                ))
            }
        }
        self.require_uncaptured("expire_delivery")?;
        let settlement = self.close_cancelled("delivery deadline expired", now);
        self.record(
            "delivery_expired",
            "seller did not deliver before the deadline, buyer refunded".into(),
            "system",
            now,
        );
        Ok(settlement)
    }

    // -- Verification -------------------------------------------------------

    /// Marks a party as verified once `methods` cover the required tier.
    pub fn verify_party(
        &mut self,
        user_id: &str,
        methods: &[VerificationMethod],
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        let role = self.require_party(user_id, "verify")?;
        if let Some(missing) = self.verification.tier.first_missing(methods) {
            return Err(EscrowError::validation(
                "methods",
                format!(
                    "{} tier requires {:?}, which was not completed",
                    self.verification.tier, missing
                ),
            ));
        }
        let already = match role {
            PartyRole::Buyer => std::mem::replace(&mut self.verification.buyer_verified, true),
            PartyRole::Seller => std::mem::replace(&mut self.verification.seller_verified, true),
        };
        if already {
            return Err(EscrowError::invalid_state(
                "verify_party",
                format!("{} already verified", role),
                "unverified party",
            ));
        }
        self.record(
            "verified",
            format!("{} passed {} verification", role, self.verification.tier),
            user_id,
            now,
        );
        Ok(())
    }

    // -- Milestones ---------------------------------------------------------

    /// Attaches a milestone plan after creation.
    pub fn set_milestone_plan(
        &mut self,
        actor: &str,
        specs: Vec<MilestoneSpec>,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.require_role(actor, PartyRole::Buyer, "create a milestone plan")?;
        self.require_status(
            "create_plan",
            &[TransactionStatus::PendingPayment, TransactionStatus::Funded],
        )?;
        if self
            .milestones
            .as_ref()
            .map(|p| p.has_progress())
            .unwrap_or(false)
        {
            return Err(EscrowError::invalid_state(
                "create_plan",
                "milestones already in progress",
                "no milestone progress",
            ));
        }

        let plan = MilestonePlan::new(specs, self.amount)?;
        let count = plan.len();
        self.milestones = Some(plan);
        self.record(
            "milestone_plan_created",
            format!("{} milestones covering {}", count, self.amount),
            actor,
            now,
        );
        Ok(())
    }

    fn plan_mut(&mut self) -> EscrowResult<&mut MilestonePlan> {
        let id = self.id.clone();
        self.milestones
            .as_mut()
            .ok_or_else(|| EscrowError::not_found("milestone plan", &id))
    }

    pub fn start_milestone(
        &mut self,
        seller_id: &str,
        sequence: u32,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.require_role(seller_id, PartyRole::Seller, "start a milestone")?;
        self.require_status("start_milestone", &[TransactionStatus::Funded])?;
        self.plan_mut()?.start(sequence)?;
        self.record(
            "milestone_started",
            format!("milestone {} in progress", sequence),
            seller_id,
            now,
        );
        Ok(())
    }

    pub fn complete_milestone(
        &mut self,
        seller_id: &str,
        sequence: u32,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.require_role(seller_id, PartyRole::Seller, "complete a milestone")?;
        self.require_status(
            "complete_milestone",
            &[TransactionStatus::Funded, TransactionStatus::Delivered],
        )?;
        self.plan_mut()?.complete(sequence)?;
        self.record(
            "milestone_completed",
            format!("milestone {} reported complete", sequence),
            seller_id,
            now,
        );
        Ok(())
    }

    /// Buyer approves a completed milestone and its amount is paid out.
    pub fn approve_milestone(
        &mut self,
        buyer_id: &str,
        sequence: u32,
        now: DateTime<Utc>,
    ) -> EscrowResult<MilestonePayment> {
        self.require_role(buyer_id, PartyRole::Buyer, "approve a milestone")?;
        self.require_status(
            "approve_milestone",
            &[TransactionStatus::Funded, TransactionStatus::Delivered],
        )?;

        let plan = self.plan_mut()?;
        let amount = plan.approve(sequence)?;
        plan.mark_paid(sequence, now)?;
        let releases_funds = plan.all_paid();

        self.captured_amount += amount;
        let mut completes_transaction = false;
        if releases_funds {
            self.payment_status = PaymentStatus::Released;
            if self.status == TransactionStatus::Delivered {
                self.delivery_status = DeliveryStatus::Confirmed;
                self.finish(TransactionStatus::Completed, now);
                completes_transaction = true;
            }
        }

        self.record(
            "milestone_paid",
            format!("milestone {} approved, {} captured", sequence, amount),
            buyer_id,
            now,
        );
        Ok(MilestonePayment {
            sequence,
            amount,
            releases_funds,
            completes_transaction,
        })
    }

    // -- Disputes -----------------------------------------------------------

    /// Opens a dispute and freezes the transaction.
    pub fn open_dispute(
        &mut self,
        request: OpenDisputeRequest,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> EscrowResult<&Dispute> {
        let role = self.require_party(&request.initiator_id, "open a dispute")?;
        if let Some(active) = self.active_dispute() {
            return Err(EscrowError::DuplicateDispute {
                transaction_id: self.id.clone(),
                dispute_id: active.id.clone(),
            });
        }
        self.require_status(
            "open_dispute",
            &[TransactionStatus::Funded, TransactionStatus::Delivered],
        )?;

        let respondent = match role {
            PartyRole::Buyer => self.seller_id.clone(),
            PartyRole::Seller => self.buyer_id.clone(),
        };
        let initiator = request.initiator_id.clone();
        let dispute = Dispute::open(
            &self.id,
            request,
            role,
            &respondent,
            config.dispute_window,
            now,
        )?;

        self.status_before_dispute = Some(self.status);
        self.status = TransactionStatus::Disputed;
        self.record(
            "dispute_opened",
            format!(
                "{} opened dispute {} ({:?}, {:?} priority)",
                role, dispute.id, dispute.dispute_type, dispute.priority
            ),
            &initiator,
            now,
        );
        self.disputes.push(dispute);
        let last = self.disputes.len() - 1;
        Ok(&self.disputes[last])
    }

    pub fn submit_dispute_evidence(
        &mut self,
        dispute_id: &str,
        submitted_by: &str,
        input: EvidenceInput,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        let description = input.description.clone();
        self.active_dispute_mut(dispute_id)?
            .submit_evidence(submitted_by, input, now)?;
        self.record(
            "dispute_evidence",
            format!("evidence added to {}: {}", dispute_id, description),
            submitted_by,
            now,
        );
        Ok(())
    }

    pub fn post_dispute_message(
        &mut self,
        dispute_id: &str,
        author: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.active_dispute_mut(dispute_id)?
            .post_message(author, body, now)?;
        self.record(
            "dispute_message",
            format!("message posted to {}", dispute_id),
            author,
            now,
        );
        Ok(())
    }

    /// A party asks for mediation. Returns `true` when a mediator is already
    /// assigned, so the caller knows whether to look one up.
    pub fn request_mediation(
        &mut self,
        dispute_id: &str,
        requested_by: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<bool> {
        self.require_party(requested_by, "request mediation")?;
        let dispute = self.active_dispute_mut(dispute_id)?;
        let body = if note.trim().is_empty() {
            "mediation requested".to_string()
        } else {
            format!("mediation requested: {}", note)
        };
        dispute.post_message(requested_by, &body, now)?;
        let has_mediator = dispute.mediator_id.is_some();
        self.record(
            "mediation_requested",
            format!("mediation requested on {}", dispute_id),
            requested_by,
            now,
        );
        Ok(has_mediator)
    }

    pub fn assign_mediator(
        &mut self,
        dispute_id: &str,
        mediator_id: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        if self.role_of(mediator_id).is_some() {
            return Err(EscrowError::validation(
                "mediator_id",
                "a party to the transaction cannot mediate it",
            ));
        }
        self.active_dispute_mut(dispute_id)?
            .assign_mediator(mediator_id, now)?;
        self.record(
            "mediator_assigned",
            format!("{} assigned to {}", mediator_id, dispute_id),
            "system",
            now,
        );
        Ok(())
    }

    /// Applies a mediator's ruling and settles the transaction.
    pub fn resolve_dispute(
        &mut self,
        dispute_id: &str,
        outcome: ResolutionOutcome,
        resolved_by: &str,
        notes: String,
        now: DateTime<Utc>,
    ) -> EscrowResult<DisputeSettlement> {
        self.require_status("resolve_dispute", &[TransactionStatus::Disputed])?;
        let at_fault = outcome
            .party_at_fault()
            .map(|role| self.party_id(role).to_string());
        let remaining = self.uncaptured_amount();
        if outcome == ResolutionOutcome::RefundToBuyer && remaining == 0 {
            return Err(EscrowError::invalid_state(
                "resolve_dispute",
                "hold fully captured, nothing left to refund",
                "funds still held",
            ));
        }

        self.active_dispute_mut(dispute_id)?
            .resolve(outcome, resolved_by, notes, at_fault.clone(), now)?;

        let settlement = match outcome {
            ResolutionOutcome::ReleaseToSeller => Settlement {
                capture: remaining,
                refund: false,
            },
            ResolutionOutcome::RefundToBuyer => self.refund_remaining(),
            ResolutionOutcome::Split { seller_share_bps } => {
                let share = (remaining as u128 * seller_share_bps as u128
                    / BPS_DENOMINATOR as u128) as u64;
                Settlement {
                    capture: share,
                    refund: share < remaining,
                }
            }
        };

        self.captured_amount += settlement.capture;
        self.status_before_dispute = None;
        match outcome {
            ResolutionOutcome::RefundToBuyer => {
                self.delivery_status = DeliveryStatus::Rejected;
                self.finish(TransactionStatus::Refunded, now);
            }
            ResolutionOutcome::ReleaseToSeller | ResolutionOutcome::Split { .. } => {
                if let Some(plan) = self.milestones.as_mut() {
                    if !settlement.refund {
                        plan.settle_remaining(now);
                    }
                }
                self.payment_status = if settlement.refund {
                    PaymentStatus::PartiallyRefunded
                } else {
                    PaymentStatus::Released
                };
                self.delivery_status = DeliveryStatus::Confirmed;
                self.finish(TransactionStatus::Completed, now);
            }
        }

        self.record(
            "dispute_resolved",
            format!(
                "dispute {} resolved ({:?}): {} captured{}",
                dispute_id,
                outcome,
                settlement.capture,
                if settlement.refund { ", remainder refunded" } else { "" }
            ),
            resolved_by,
            now,
        );
        Ok(DisputeSettlement {
            settlement,
            outcome,
            at_fault,
        })
    }

    /// Initiator withdraws; the transaction resumes where it left off.
    pub fn withdraw_dispute(
        &mut self,
        dispute_id: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.require_status("withdraw_dispute", &[TransactionStatus::Disputed])?;
        self.active_dispute_mut(dispute_id)?.withdraw(caller, now)?;
        let resumed = self
            .status_before_dispute
            .take()
            .unwrap_or(TransactionStatus::Funded);
        self.status = resumed;
        self.record(
            "dispute_withdrawn",
            format!("dispute {} withdrawn, back to {}", dispute_id, resumed),
            caller,
            now,
        );
        Ok(())
    }

    /// Records that a refund left pending by a dispute ruling went through.
    pub fn settle_pending_refund(&mut self, now: DateTime<Utc>) -> EscrowResult<()> {
        if !self.refund_pending {
            return Err(EscrowError::invalid_state(
                "settle_pending_refund",
                "no refund pending",
                "a pending refund",
            ));
        }
        self.refund_pending = false;
        self.record(
            "refund_settled",
            format!("remaining {} refunded to buyer", self.uncaptured_amount()),
            "system",
            now,
        );
        Ok(())
    }

    /// Escalates the active dispute if it is overdue. Returns the dispute id
    /// when something changed.
    pub fn escalate_overdue_dispute(&mut self, now: DateTime<Utc>) -> Option<String> {
        let dispute = self.disputes.iter_mut().find(|d| d.is_active())?;
        if !dispute.escalate(now) {
            return None;
        }
        let id = dispute.id.clone();
        self.record(
            "dispute_escalated",
            format!("dispute {} passed its resolution deadline", id),
            "system",
            now,
        );
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispute::{DisputeStatus, DisputeType};
    use crate::milestone::MilestoneStatus;
    use chrono::Duration;

    fn request(amount: u64) -> CreateTransactionRequest {
        CreateTransactionRequest {
            buyer_id: "buyer".into(),
            seller_id: "seller".into(),
            item: ItemDetails {
                title: "Logo design".into(),
                description: "Vector logo, three revisions".into(),
                category: "design".into(),
                delivery_method: "digital".into(),
                delivery_timeframe: "5 days".into(),
            },
            transaction_type: TransactionType::Service,
            amount,
            currency: "USD".into(),
            party_count: 2,
            milestones: None,
            metadata: BTreeMap::new(),
        }
    }

    fn new_tx(amount: u64) -> Transaction {
        let req = request(amount);
        let plan = req.validate().unwrap();
        Transaction::new(
            "tx-1".into(),
            req,
            plan,
            "hold-1".into(),
            &EngineConfig::default(),
            Utc::now(),
        )
    }

    fn funded(amount: u64) -> Transaction {
        let mut tx = new_tx(amount);
        tx.fund("card", &EngineConfig::default(), Utc::now()).unwrap();
        tx
    }

    fn delivered(amount: u64) -> Transaction {
        let mut tx = funded(amount);
        tx.deliver("seller", DeliveryInfo::default(), &EngineConfig::default(), Utc::now())
            .unwrap();
        tx
    }

    fn dispute_req(initiator: &str) -> OpenDisputeRequest {
        OpenDisputeRequest {
            initiator_id: initiator.into(),
            dispute_type: DisputeType::NotAsDescribed,
            reason: "wrong colours".into(),
            description: String::new(),
            evidence: vec![],
        }
    }

    #[test]
    fn new_transaction_is_pending_with_fee_and_tier() {
        let tx = new_tx(500_000);
        assert_eq!(tx.status, TransactionStatus::PendingPayment);
        assert_eq!(tx.payment_status, PaymentStatus::Pending);
        assert_eq!(tx.fee.fee, 12_500);
        assert_eq!(tx.seller_net, 487_500);
        assert_eq!(tx.verification.tier, VerificationTier::Medium);
        assert_eq!(tx.audit_trail.len(), 1);
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let mut req = request(1000);
        req.item.title = String::new();
        assert!(matches!(
            req.validate().unwrap_err(),
            EscrowError::Validation { ref field, .. } if field == "item.title"
        ));

        let mut req = request(0);
        req.item.title = "x".into();
        assert!(req.validate().is_err());

        let mut req = request(1000);
        req.currency = "usd".into();
        assert!(req.validate().is_err());

        let mut req = request(1000);
        req.seller_id = "buyer".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn fund_sets_deadlines() {
        let now = Utc::now();
        let mut tx = new_tx(10_000);
        tx.fund("card", &EngineConfig::default(), now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Funded);
        assert_eq!(tx.payment_status, PaymentStatus::Held);
        assert_eq!(tx.timeline.delivery_deadline, Some(now + Duration::days(7)));
        assert_eq!(tx.timeline.auto_release_deadline, Some(now + Duration::days(14)));
    }

    #[test]
    fn fund_twice_is_invalid_state() {
        let mut tx = funded(10_000);
        let err = tx.fund("card", &EngineConfig::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));
    }

    #[test]
    fn only_seller_delivers() {
        let mut tx = funded(10_000);
        let err = tx
            .deliver("buyer", DeliveryInfo::default(), &EngineConfig::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EscrowError::AccessDenied { .. }));
        assert_eq!(tx.status, TransactionStatus::Funded);
    }

    #[test]
    fn confirm_captures_full_amount() {
        let mut tx = delivered(10_000);
        let s = tx
            .confirm_delivery(
                "buyer",
                Some(RatingData {
                    rating: 5,
                    comment: None,
                }),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(s.capture, 10_000);
        assert!(!s.refund);
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.payment_status, PaymentStatus::Released);
        assert!(tx.timeline.completed_at.is_some());

        // Second confirmation fails cleanly.
        assert!(matches!(
            tx.confirm_delivery("buyer", None, Utc::now()).unwrap_err(),
            EscrowError::InvalidState { .. }
        ));
    }

    #[test]
    fn bad_rating_rejected_without_change() {
        let mut tx = delivered(10_000);
        let before = tx.clone();
        let err = tx
            .confirm_delivery(
                "buyer",
                Some(RatingData {
                    rating: 9,
                    comment: None,
                }),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation { .. }));
        assert_eq!(tx, before);
    }

    #[test]
    fn cancel_pending_needs_no_refund() {
        let mut tx = new_tx(10_000);
        let s = tx.cancel("buyer", "changed my mind", Utc::now()).unwrap();
        assert!(!s.refund);
        assert_eq!(tx.status, TransactionStatus::Cancelled);
        assert_eq!(tx.payment_status, PaymentStatus::Pending);
    }

    #[test]
    fn cancel_funded_refunds() {
        let mut tx = funded(10_000);
        let s = tx.cancel("seller", "out of stock", Utc::now()).unwrap();
        assert!(s.refund);
        assert_eq!(tx.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn cancel_after_delivery_rejected() {
        let mut tx = delivered(10_000);
        assert!(tx.cancel("buyer", "late", Utc::now()).is_err());
    }

    #[test]
    fn every_transition_appends_one_audit_entry() {
        let cfg = EngineConfig::default();
        let mut tx = new_tx(10_000);
        let mut n = tx.audit_trail.len();

        tx.fund("card", &cfg, Utc::now()).unwrap();
        assert_eq!(tx.audit_trail.len(), n + 1);
        n += 1;

        tx.deliver("seller", DeliveryInfo::default(), &cfg, Utc::now()).unwrap();
        assert_eq!(tx.audit_trail.len(), n + 1);
        n += 1;

        tx.confirm_delivery("buyer", None, Utc::now()).unwrap();
        assert_eq!(tx.audit_trail.len(), n + 1);
    }

    #[test]
    fn expiry_respects_deadlines() {
        let mut tx = new_tx(10_000);
        let created = tx.timeline.created_at;
        assert!(tx.expire_payment(created).is_err());
        let s = tx.expire_payment(created + Duration::hours(25)).unwrap();
        assert!(!s.refund);
        assert_eq!(tx.status, TransactionStatus::Cancelled);
        assert!(tx.expire_payment(created + Duration::hours(26)).is_err());
    }

    #[test]
    fn delivery_expiry_refunds() {
        let mut tx = funded(10_000);
        let deadline = tx.timeline.delivery_deadline.unwrap();
        let s = tx.expire_delivery(deadline).unwrap();
        assert!(s.refund);
        assert_eq!(tx.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn auto_release_after_deadline() {
        let mut tx = delivered(10_000);
        let deadline = tx.timeline.auto_release_deadline.unwrap();
        assert!(tx.auto_release(deadline - Duration::seconds(1)).is_err());
        let s = tx.auto_release(deadline).unwrap();
        assert_eq!(s.capture, 10_000);
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn dispute_freezes_and_withdraw_restores() {
        let cfg = EngineConfig::default();
        let mut tx = delivered(10_000);
        let id = tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap().id.clone();
        assert_eq!(tx.status, TransactionStatus::Disputed);

        // Frozen: buyer cannot confirm while disputed.
        assert!(tx.confirm_delivery("buyer", None, Utc::now()).is_err());

        tx.withdraw_dispute(&id, "buyer", Utc::now()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Delivered);
        assert_eq!(tx.disputes[0].status, DisputeStatus::Closed);

        // A closed dispute no longer blocks a new one.
        tx.open_dispute(dispute_req("seller"), &cfg, Utc::now()).unwrap();
        assert_eq!(tx.disputes.len(), 2);
    }

    #[test]
    fn duplicate_dispute_rejected() {
        let cfg = EngineConfig::default();
        let mut tx = funded(10_000);
        tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap();
        let err = tx.open_dispute(dispute_req("seller"), &cfg, Utc::now()).unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateDispute { .. }));
    }

    #[test]
    fn outsider_cannot_dispute() {
        let mut tx = funded(10_000);
        let err = tx
            .open_dispute(dispute_req("mallory"), &EngineConfig::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EscrowError::AccessDenied { .. }));
    }

    #[test]
    fn cannot_dispute_before_funding() {
        let mut tx = new_tx(10_000);
        let err = tx
            .open_dispute(dispute_req("buyer"), &EngineConfig::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));
    }

    #[test]
    fn refund_ruling_blames_seller() {
        let cfg = EngineConfig::default();
        let mut tx = delivered(10_000);
        let id = tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap().id.clone();
        tx.assign_mediator(&id, "med", Utc::now()).unwrap();

        let s = tx
            .resolve_dispute(&id, ResolutionOutcome::RefundToBuyer, "med", String::new(), Utc::now())
            .unwrap();
        assert_eq!(s.at_fault.as_deref(), Some("seller"));
        assert!(s.settlement.refund);
        assert_eq!(s.settlement.capture, 0);
        assert_eq!(tx.status, TransactionStatus::Refunded);
        assert_eq!(tx.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn split_ruling_captures_share() {
        let cfg = EngineConfig::default();
        let mut tx = delivered(10_000);
        let id = tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap().id.clone();
        tx.assign_mediator(&id, "med", Utc::now()).unwrap();

        let s = tx
            .resolve_dispute(
                &id,
                ResolutionOutcome::Split {
                    seller_share_bps: 6_000,
                },
                "med",
                String::new(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(s.settlement.capture, 6_000);
        assert!(s.settlement.refund);
        assert!(s.at_fault.is_none());
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.captured_amount, 6_000);
    }

    #[test]
    fn party_cannot_be_assigned_as_mediator() {
        let cfg = EngineConfig::default();
        let mut tx = funded(10_000);
        let id = tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap().id.clone();
        assert!(tx.assign_mediator(&id, "seller", Utc::now()).is_err());
    }

    #[test]
    fn milestone_payments_release_on_last() {
        let mut req = request(100_000);
        req.milestones = Some(vec![
            MilestoneSpec {
                title: "draft".into(),
                description: String::new(),
                amount: 40_000,
                due_date: None,
                requirements: vec![],
                deliverables: vec![],
            },
            MilestoneSpec {
                title: "final".into(),
                description: String::new(),
                amount: 60_000,
                due_date: None,
                requirements: vec![],
                deliverables: vec![],
            },
        ]);
        let plan = req.validate().unwrap();
        let cfg = EngineConfig::default();
        let mut tx = Transaction::new("tx-m".into(), req, plan, "hold".into(), &cfg, Utc::now());
        tx.fund("card", &cfg, Utc::now()).unwrap();

        tx.complete_milestone("seller", 1, Utc::now()).unwrap();
        let p1 = tx.approve_milestone("buyer", 1, Utc::now()).unwrap();
        assert_eq!(p1.amount, 40_000);
        assert!(!p1.releases_funds);
        assert_eq!(tx.payment_status, PaymentStatus::Held);

        tx.deliver("seller", DeliveryInfo::default(), &cfg, Utc::now()).unwrap();
        tx.complete_milestone("seller", 2, Utc::now()).unwrap();
        let p2 = tx.approve_milestone("buyer", 2, Utc::now()).unwrap();
        assert!(p2.releases_funds);
        assert!(p2.completes_transaction);
        assert_eq!(tx.payment_status, PaymentStatus::Released);
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.captured_amount, 100_000);
        assert!(tx
            .milestones
            .as_ref()
            .unwrap()
            .milestones()
            .iter()
            .all(|m| m.status == MilestoneStatus::Paid));
    }

    #[test]
    fn plan_must_match_total() {
        let mut tx = new_tx(10_000);
        let err = tx
            .set_milestone_plan(
                "buyer",
                vec![MilestoneSpec {
                    title: "all".into(),
                    description: String::new(),
                    amount: 9_999,
                    due_date: None,
                    requirements: vec![],
                    deliverables: vec![],
                }],
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation { .. }));
        assert!(tx.milestones.is_none());
    }

    #[test]
    fn verification_requires_full_tier() {
        let mut tx = new_tx(1_000_000);
        assert_eq!(tx.verification.tier, VerificationTier::High);
        let partial = [VerificationMethod::IdScan, VerificationMethod::FacialMatch];
        assert!(tx.verify_party("buyer", &partial, Utc::now()).is_err());

        let all = VerificationTier::High.required_methods().to_vec();
        tx.verify_party("buyer", &all, Utc::now()).unwrap();
        assert!(tx.verification.buyer_verified);
        assert!(!tx.verification.seller_verified);
        assert!(tx.verify_party("buyer", &all, Utc::now()).is_err());
    }

    fn milestone_tx(amounts: &[u64]) -> Transaction {
        let mut req = request(amounts.iter().sum());
        req.milestones = Some(
            amounts
                .iter()
                .enumerate()
                .map(|(i, amount)| MilestoneSpec {
                    title: format!("part {}", i + 1),
                    description: String::new(),
                    amount: *amount,
                    due_date: None,
                    requirements: vec![],
                    deliverables: vec![],
                })
                .collect(),
        );
        let plan = req.validate().unwrap();
        let cfg = EngineConfig::default();
        let mut tx = Transaction::new("tx-m".into(), req, plan, "hold".into(), &cfg, Utc::now());
        tx.fund("card", &cfg, Utc::now()).unwrap();
        tx
    }

    fn pay(tx: &mut Transaction, sequence: u32) {
        tx.complete_milestone("seller", sequence, Utc::now()).unwrap();
        tx.approve_milestone("buyer", sequence, Utc::now()).unwrap();
    }

    #[test]
    fn cancel_after_a_paid_milestone_refunds_only_the_rest() {
        let mut tx = milestone_tx(&[30_000, 70_000]);
        pay(&mut tx, 1);

        let s = tx.cancel("buyer", "scope changed", Utc::now()).unwrap();
        assert!(s.refund);
        assert_eq!(s.capture, 0);
        assert_eq!(tx.status, TransactionStatus::Cancelled);
        assert_eq!(tx.payment_status, PaymentStatus::PartiallyRefunded);
        assert_eq!(tx.captured_amount, 30_000);
        assert!(tx.has_seller_earnings());
    }

    #[test]
    fn fully_paid_plan_only_moves_forward() {
        let mut tx = milestone_tx(&[50_000, 50_000]);
        pay(&mut tx, 1);
        pay(&mut tx, 2);
        assert_eq!(tx.payment_status, PaymentStatus::Released);

        let err = tx.cancel("seller", "changed my mind", Utc::now()).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));
        let late = Utc::now() + Duration::days(8);
        assert!(tx.expire_delivery(late).is_err());
        assert_eq!(tx.status, TransactionStatus::Funded);

        tx.deliver("seller", DeliveryInfo::default(), &EngineConfig::default(), Utc::now())
            .unwrap();
        let s = tx.confirm_delivery("buyer", None, Utc::now()).unwrap();
        assert_eq!(s.capture, 0);
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn refund_ruling_keeps_paid_milestones_with_the_seller() {
        let cfg = EngineConfig::default();
        let mut tx = milestone_tx(&[40_000, 60_000]);
        pay(&mut tx, 1);
        let id = tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap().id.clone();
        tx.assign_mediator(&id, "med", Utc::now()).unwrap();

        let s = tx
            .resolve_dispute(&id, ResolutionOutcome::RefundToBuyer, "med", String::new(), Utc::now())
            .unwrap();
        assert!(s.settlement.refund);
        assert_eq!(tx.status, TransactionStatus::Refunded);
        assert_eq!(tx.payment_status, PaymentStatus::PartiallyRefunded);
        assert_eq!(tx.captured_amount, 40_000);
    }

    #[test]
    fn refund_ruling_needs_something_left_to_refund() {
        let cfg = EngineConfig::default();
        let mut tx = milestone_tx(&[40_000, 60_000]);
        pay(&mut tx, 1);
        pay(&mut tx, 2);
        let id = tx.open_dispute(dispute_req("buyer"), &cfg, Utc::now()).unwrap().id.clone();
        tx.assign_mediator(&id, "med", Utc::now()).unwrap();

        let err = tx
            .resolve_dispute(&id, ResolutionOutcome::RefundToBuyer, "med", String::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));
        assert_eq!(tx.status, TransactionStatus::Disputed);
        assert!(tx.active_dispute().is_some());
    }
}
