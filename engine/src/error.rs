//! Error types for the escrow engine.
//!
//! Business-rule violations (`Validation`, `AccessDenied`, `InvalidState`,
//! `DuplicateDispute`) are rejected before anything is written. Only
//! external-dependency failures (`Gateway`) and lost races
//! (`ConcurrentModification`) are worth retrying.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::storage::StoreError;

/// Errors returned by every engine operation.
#[derive(Debug, Error)]
pub enum EscrowError {
    /// Malformed or inconsistent input. Nothing was changed.
    #[error("validation failed on {field}: {reason}")]
    Validation {
        /// The offending input field.
        field: String,
        /// Which rule the input broke.
        reason: String,
    },

    /// The caller is not allowed to act on this transaction.
    #[error("access denied: {actor} may not {action} on transaction {transaction_id}")]
    AccessDenied {
        actor: String,
        action: String,
        transaction_id: String,
    },

    /// The operation is not valid for the entity's current status.
    #[error("invalid state for {operation}: status is {current}, expected {expected}")]
    InvalidState {
        operation: String,
        current: String,
        expected: String,
    },

    /// The transaction already has a dispute that is not closed.
    #[error("transaction {transaction_id} already has an active dispute ({dispute_id})")]
    DuplicateDispute {
        transaction_id: String,
        dispute_id: String,
    },

    /// The payment gateway call failed. The transaction is still in its
    /// pre-call state, so retrying is safe.
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The mediator directory had nobody to hand out.
    #[error("no mediator available for dispute {dispute_id}: {reason}")]
    NoMediator { dispute_id: String, reason: String },

    /// Another writer touched the same transaction first.
    #[error("concurrent modification of transaction {transaction_id}; reload and retry")]
    ConcurrentModification { transaction_id: String },

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl EscrowError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EscrowError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(
        operation: &str,
        current: impl std::fmt::Display,
        expected: &str,
    ) -> Self {
        EscrowError::InvalidState {
            operation: operation.to_string(),
            current: current.to_string(),
            expected: expected.to_string(),
        }
    }

    pub(crate) fn access_denied(actor: &str, action: &str, transaction_id: &str) -> Self {
        EscrowError::AccessDenied {
            actor: actor.to_string(),
            action: action.to_string(),
            transaction_id: transaction_id.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        EscrowError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn no_mediator(dispute_id: &str, reason: impl std::fmt::Display) -> Self {
        EscrowError::NoMediator {
            dispute_id: dispute_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if the caller may retry the same request unchanged
    /// (after reloading state, for concurrency conflicts).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::Gateway(_) | EscrowError::ConcurrentModification { .. }
        )
    }
}

impl From<StoreError> for EscrowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { id, .. } => {
                EscrowError::ConcurrentModification { transaction_id: id }
            }
            other => EscrowError::Storage(other),
        }
    }
}

pub type EscrowResult<T> = Result<T, EscrowError>;
