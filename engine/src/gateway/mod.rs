//! # External Collaborators
//!
//! The engine never moves money or contacts people itself. It talks to three
//! injected services through the traits in this module:
//!
//! - [`PaymentGateway`]: holds, captures, refunds and payout transfers.
//! - [`MediatorDirectory`]: picks a mediator for a dispute.
//! - [`Notifier`]: tells parties that something happened.
//!
//! Gateway failures abort the operation that needed them. Notification
//! failures are logged and swallowed; a lost email never blocks a state
//! transition.

pub mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),

    #[error("hold {0} not found at gateway")]
    UnknownHold(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("gateway call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("mediator pool is empty")]
    NoMediator,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

// ---------------------------------------------------------------------------
// Gateway results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldReceipt {
    pub hold_id: String,
    pub amount: u64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldConfirmation {
    pub hold_id: String,
    pub payment_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureReceipt {
    pub hold_id: String,
    pub amount: u64,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub hold_id: String,
    pub amount: u64,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub seller_id: String,
    pub amount: u64,
    pub reference: String,
}

/// Payment processor in front of the escrow account.
///
/// Implementations must treat `capture` as cumulative against one hold: two
/// captures of 40 and 60 against a hold of 100 settle it fully. `refund`
/// returns whatever has not been captured.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_hold(
        &self,
        transaction_id: &str,
        amount: u64,
        currency: &str,
    ) -> Result<HoldReceipt, GatewayError>;

    /// Confirms the buyer actually paid into the hold with `payment_method`.
    async fn confirm_hold(
        &self,
        hold_id: &str,
        payment_method: &str,
    ) -> Result<HoldConfirmation, GatewayError>;

    async fn capture(&self, hold_id: &str, amount: u64) -> Result<CaptureReceipt, GatewayError>;

    async fn refund(&self, hold_id: &str) -> Result<RefundReceipt, GatewayError>;

    /// Sends an aggregated payout to a seller's account.
    async fn transfer(&self, seller_id: &str, amount: u64) -> Result<TransferReceipt, GatewayError>;
}

/// Source of mediators for disputes.
#[async_trait]
pub trait MediatorDirectory: Send + Sync {
    async fn assign(&self, dispute_id: &str) -> Result<String, GatewayError>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TransactionCreated,
    TransactionFunded,
    TransactionDelivered,
    TransactionCompleted,
    TransactionCancelled,
    MilestoneCompleted,
    MilestonePaid,
    DisputeOpened,
    DisputeUpdated,
    MediatorAssigned,
    DisputeResolved,
    DisputeEscalated,
    PayoutCompleted,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: &str,
        event: EventKind,
        transaction_id: &str,
        message: &str,
    ) -> Result<(), NotifyError>;
}
