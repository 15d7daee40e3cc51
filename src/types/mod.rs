//! Types module
//!
//! Contains core data structures used throughout the engine.
//! This module organizes types into logical submodules:
//! - `money`: minor-unit coin amounts
//! - `ids`: domain, account and transfer identifiers
//! - `ledger`: ledger transfers and account balances
//! - `records`: record-store rows and their status lifecycles
//! - `history`: financial history items
//! - `error`: error types for every layer

pub mod error;
pub mod history;
pub mod ids;
pub mod ledger;
pub mod money;
pub mod records;

pub use error::{EngineError, LedgerError, PolicyViolation, StoreError};
pub use history::{
    Counterparty, Direction, FinancialHistory, HistoryEntry, HistoryFilter, HistoryItem,
};
pub use ids::{AccountId, AdminId, MerchantId, Party, RecordId, Role, TransferId, UserId, COIN_LEDGER};
pub use ledger::{AccountBalance, OpCode, Transfer, TransferSpec};
pub use money::Coins;
pub use records::{
    CoinPurchase, FailureReason, Intent, NewIntent, NewPurchase, NewReferralReward, NewSettlement,
    NewTransaction, Page, Paged, PurchaseStatus, RecordStatus, ReferralReward, RewardKind,
    RewardStatus, Settlement, SettlementStatus, Transaction, TransactionKind, TransactionStatus,
    UserActivity, MAX_PAGE_LIMIT,
};
