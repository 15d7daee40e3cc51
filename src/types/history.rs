//! Financial history items
//!
//! A user's history is a single timeline of credits and debits assembled from
//! coin purchases, transactions and referral rewards. The kind of row an item was
//! built from is kept as a tagged variant ([`HistoryEntry`]).

use super::ids::{RecordId, Role, UserId};
use super::money::Coins;
use super::records::{RecordStatus, RewardKind, TransactionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Whether an item added coins to the user's balance or took them away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

/// `type` filter of a history query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryFilter {
    #[default]
    All,
    Credit,
    Debit,
}

impl HistoryFilter {
    pub fn admits(self, direction: Direction) -> bool {
        match self {
            HistoryFilter::All => true,
            HistoryFilter::Credit => direction == Direction::Credit,
            HistoryFilter::Debit => direction == Direction::Debit,
        }
    }
}

impl FromStr for HistoryFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "all" => Ok(HistoryFilter::All),
            "credit" => Ok(HistoryFilter::Credit),
            "debit" => Ok(HistoryFilter::Debit),
            other => Err(format!("unknown history type '{}'", other)),
        }
    }
}

/// The row an item was projected from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum HistoryEntry {
    CoinPurchase { payment_method: String },
    TransactionDebit { kind: TransactionKind },
    TransactionCredit { kind: TransactionKind },
    Refund { refund_of: Option<RecordId> },
    ReferralReward { kind: RewardKind },
}

/// The other side of a movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counterparty {
    pub id: u64,
    pub role: Role,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// One line of a user's financial history.
///
/// `coins` is the (positive) ledger effect in `direction`; `amount` is the amount
/// the user sees on the originating row (fiat paid for a purchase, bill total for a
/// merchant payment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryItem {
    pub id: RecordId,
    pub direction: Direction,
    pub entry: HistoryEntry,
    pub amount: Coins,
    pub coins: Coins,
    pub description: String,
    pub counterparty: Option<Counterparty>,
    pub status: RecordStatus,
    pub timestamp: DateTime<Utc>,
}

impl HistoryItem {
    /// Counterparty user id, if the other side is a customer.
    pub fn counterparty_user(&self) -> Option<UserId> {
        self.counterparty
            .as_ref()
            .filter(|c| c.role == Role::Customer)
            .map(|c| UserId(c.id))
    }
}

/// A page of history plus the user's current ledger balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinancialHistory {
    pub items: Vec<HistoryItem>,
    pub total_count: u64,
    pub current_balance: Coins,
}
