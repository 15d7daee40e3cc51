//! Error types for the coin-rewards engine
//!
//! Each layer has its own error enum; everything a caller sees is an
//! [`EngineError`].
//!
//! # Error Categories
//!
//! - **Ledger errors** ([`LedgerError`]): rejected or failed transfers and account operations.
//! - **Store errors** ([`StoreError`]): record-store lookups, scope commits, pagination.
//! - **Policy violations** ([`PolicyViolation`]): the seven payment gates, in evaluation order.
//! - **Engine errors** ([`EngineError`]): the caller-facing taxonomy. Policy and validation
//!   errors are returned as-is, ledger/store outages become `TransientFailure`.

use super::ids::{AccountId, RecordId};
use super::ledger::Transfer;
use super::records::{FailureReason, Intent};
use serde::Serialize;
use thiserror::Error;

/// A payment gate that rejected a request.
///
/// Variants are listed in the order the gates are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum PolicyViolation {
    #[error("amount is below the minimum purchase")]
    MinPurchase,

    #[error("merchant category is not known")]
    UnknownCategory,

    #[error("balance does not cover the coins required")]
    InsufficientBalance,

    #[error("payment would leave less than the minimum reserve")]
    BelowMinimumReserve,

    #[error("daily spending limit exceeded")]
    DailyLimitExceeded,

    #[error("monthly spending limit exceeded")]
    MonthlyLimitExceeded,

    #[error("merchant is outside business hours")]
    OutsideBusinessHours,
}

/// Errors reported by a [`Ledger`](crate::core::traits::Ledger).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// An account with this id already exists.
    #[error("Account {0} already exists")]
    AccountExists(AccountId),

    /// The account does not exist.
    #[error("Account {0} not found")]
    AccountMissing(AccountId),

    /// Posting would take a non-system account below zero.
    ///
    /// The ledger is authoritative for this check; any earlier balance read
    /// is advisory.
    #[error("Insufficient funds on account {account}")]
    InsufficientFunds {
        /// Account that would have been overdrawn
        account: AccountId,
    },

    /// A transfer with this id has already been posted. Carries the stored
    /// transfer so the caller can decide whether it is the same movement.
    #[error("Transfer {} already posted", .0.id)]
    TransferExists(Box<Transfer>),

    /// The transfer is malformed (zero amount, same account on both sides).
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// The ledger cannot be reached or has been closed.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by a [`RecordStore`](crate::core::traits::RecordStore).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound {
        /// Table the lookup ran against
        entity: &'static str,
        /// Row id that was not found
        id: RecordId,
    },

    /// Rejected query arguments (pagination bounds).
    #[error("Bad arguments: {0}")]
    BadArguments(String),

    /// Another row already carries this idempotency key.
    #[error("Idempotency key '{0}' is already in use")]
    DuplicateKey(String),

    /// A buffered status update is no longer a legal transition.
    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

/// Caller-facing error of every engine operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The request fails schema or bounds checks.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A payment gate rejected the request. Nothing was written.
    #[error("Rejected by policy: {0}")]
    PolicyRejected(PolicyViolation),

    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of thing that was looked up
        entity: &'static str,
        /// Its identifier, as displayed
        id: String,
    },

    /// The ledger refused the transfer.
    #[error("Insufficient funds on account {account}")]
    InsufficientFunds {
        /// Account that would have been overdrawn
        account: AccountId,
    },

    /// The ledger or store was temporarily unavailable. The caller may retry
    /// with the same idempotency key.
    #[error("Transient failure: {0}")]
    TransientFailure(String),

    /// Ledger and record store disagree. Only the reconciler reports this.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// The request was cancelled before any value moved.
    #[error("Request cancelled")]
    Cancelled,
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity, id } => EngineError::not_found(entity, id),
            StoreError::BadArguments(message) => EngineError::InvalidInput(message),
            other => EngineError::TransientFailure(other.to_string()),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InsufficientFunds { account } => EngineError::InsufficientFunds { account },
            LedgerError::AccountMissing(account) => EngineError::not_found("account", account),
            LedgerError::InvalidTransfer(message) => EngineError::InvalidInput(message),
            other => EngineError::TransientFailure(other.to_string()),
        }
    }
}

// Helper functions for creating common errors

impl EngineError {
    /// Create an InvalidInput error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        EngineError::InvalidInput(message.into())
    }

    /// Create a NotFound error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a TransientFailure error
    pub fn transient(message: impl Into<String>) -> Self {
        EngineError::TransientFailure(message.into())
    }

    /// The error a terminal-failed intent reports when replayed.
    pub fn from_failure(reason: FailureReason, intent: &Intent) -> Self {
        let spec = intent.transfer_spec();
        match reason {
            FailureReason::InsufficientFunds => EngineError::InsufficientFunds { account: spec.debit },
            FailureReason::AccountMissing => EngineError::not_found("account", spec.credit),
            FailureReason::NotPosted => EngineError::transient(format!(
                "{} {} was never posted to the ledger",
                intent.entity(),
                intent.id()
            )),
        }
    }

    /// Stable, machine-readable kind of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::PolicyRejected(_) => "policy_rejected",
            EngineError::NotFound { .. } => "not_found",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::TransientFailure(_) => "transient_failure",
            EngineError::Inconsistent(_) => "inconsistent",
            EngineError::Cancelled => "cancelled",
        }
    }

    /// Whether retrying with the same idempotency key can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientFailure(_) | EngineError::Cancelled)
    }
}

impl From<PolicyViolation> for EngineError {
    fn from(violation: PolicyViolation) -> Self {
        EngineError::PolicyRejected(violation)
    }
}

impl LedgerError {
    /// The failure recorded on an intent the ledger definitively rejected with
    /// this error. `None` means the outcome is not definitive and the scope must
    /// be rolled back instead.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            LedgerError::InsufficientFunds { .. } => Some(FailureReason::InsufficientFunds),
            LedgerError::AccountMissing(_) => Some(FailureReason::AccountMissing),
            _ => None,
        }
    }
}
