//! Ledger-side types
//!
//! The ledger is a double-entry store: every [`Transfer`] debits one account and
//! credits another by the same amount, so the sum of `credits_posted - debits_posted`
//! over all accounts is always zero.

use super::ids::{AccountId, Role, TransferId};
use super::money::Coins;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of value movement a transfer represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    TopUp = 1,
    MerchantPayment = 2,
    UserTransfer = 3,
    Refund = 4,
    Settlement = 5,
}

impl OpCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::TopUp => "top_up",
            OpCode::MerchantPayment => "merchant_payment",
            OpCode::UserTransfer => "user_transfer",
            OpCode::Refund => "refund",
            OpCode::Settlement => "settlement",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, posted ledger transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub debit_account: AccountId,
    pub credit_account: AccountId,
    /// Always positive.
    pub amount: Coins,
    pub ledger: u32,
    pub op: OpCode,
    pub timestamp: DateTime<Utc>,
}

impl Transfer {
    /// Whether `other` describes the same movement of value. Timestamps are
    /// assigned by the ledger and are not compared.
    pub fn same_movement(&self, other: &Transfer) -> bool {
        self.id == other.id && self.matches(&other.spec())
    }

    /// Whether this transfer carries exactly the movement described by `spec`.
    pub fn matches(&self, spec: &TransferSpec) -> bool {
        self.debit_account == spec.debit
            && self.credit_account == spec.credit
            && self.amount == spec.amount
            && self.op == spec.op
    }

    pub fn spec(&self) -> TransferSpec {
        TransferSpec {
            debit: self.debit_account,
            credit: self.credit_account,
            amount: self.amount,
            op: self.op,
        }
    }
}

/// The movement a record expects to find on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSpec {
    pub debit: AccountId,
    pub credit: AccountId,
    pub amount: Coins,
    pub op: OpCode,
}

/// Posted totals of a ledger account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub id: AccountId,
    pub role: Role,
    pub debits_posted: Coins,
    pub credits_posted: Coins,
}

impl AccountBalance {
    pub fn new(id: AccountId, role: Role) -> Self {
        AccountBalance {
            id,
            role,
            debits_posted: Coins::ZERO,
            credits_posted: Coins::ZERO,
        }
    }

    /// `credits_posted - debits_posted`
    pub fn balance(&self) -> Coins {
        self.credits_posted - self.debits_posted
    }
}
