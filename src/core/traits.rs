//! Core traits for the ledger, the record store and the user directory
//!
//! These are the seams between the coordinator and its collaborators. The engine
//! ships in-process implementations (see [`crate::core::memory`]); a deployment
//! can plug in a dedicated ledger service or a relational database behind the
//! same traits, and tests substitute fakes that inject failures.

use crate::types::{
    AccountBalance, AccountId, CoinPurchase, Coins, FailureReason, Intent, LedgerError,
    MerchantId, NewIntent, Page, Paged, RecordId, RecordStatus, Role, Settlement, StoreError,
    Transaction, Transfer, TransferId, UserActivity, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Double-entry balance store
///
/// The ledger is the system of record for balances. Posting is atomic: a
/// transfer is either visible to every later read or never happened.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create an account. Fails with `AccountExists` if the id is taken.
    async fn create_account(&self, id: AccountId, role: Role) -> Result<(), LedgerError>;

    /// Posted totals of an account.
    async fn lookup_account(&self, id: AccountId) -> Result<AccountBalance, LedgerError>;

    /// Post a transfer and return it as stored.
    ///
    /// # Errors
    ///
    /// * `TransferExists` - a transfer with the same id was already posted
    /// * `AccountMissing` - either side does not exist
    /// * `InsufficientFunds` - the debit would take a non-system account below zero
    /// * `Unavailable` - the ledger cannot be reached
    async fn post_transfer(&self, transfer: Transfer) -> Result<Transfer, LedgerError>;

    async fn lookup_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError>;

    /// Find the transfer whose id carries `tag` in its low 64 bits.
    async fn find_transfer_by_tag(&self, tag: u64) -> Result<Option<Transfer>, LedgerError>;
}

/// Relational store of intents, transactions, settlements and rewards
///
/// Plain reads observe the latest committed state. Writes only happen through a
/// [`RecordScope`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open a write scope over a snapshot of the current state.
    ///
    /// Acquiring a scope may wait for a free connection.
    async fn begin(&self) -> Result<Box<dyn RecordScope>, StoreError>;

    async fn get_purchase(&self, id: RecordId) -> Result<CoinPurchase, StoreError>;

    async fn get_transaction(&self, id: RecordId) -> Result<Transaction, StoreError>;

    async fn get_settlement(&self, id: RecordId) -> Result<Settlement, StoreError>;

    /// Any row by id, regardless of table.
    async fn find_intent(&self, id: RecordId) -> Result<Option<Intent>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Intent>, StoreError>;

    /// A user's coin purchases, newest first.
    async fn list_purchases_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Paged<CoinPurchase>, StoreError>;

    /// Transactions where the user is on either side, newest first.
    async fn list_transactions_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Paged<Transaction>, StoreError>;

    /// A merchant's settlements, newest first.
    async fn list_settlements_by_merchant(
        &self,
        merchant: MerchantId,
        page: Page,
    ) -> Result<Paged<Settlement>, StoreError>;

    /// Coins the user spent on merchant payments created at or after `since`.
    ///
    /// Pending rows count; failed rows do not; refunds do not reduce the total.
    async fn spent_since(&self, user: UserId, since: DateTime<Utc>) -> Result<Coins, StoreError>;

    /// Coins already claimed by refunds of `original` (pending or completed).
    async fn refunded_total(&self, original: RecordId) -> Result<Coins, StoreError>;

    /// Every row that touches the user.
    async fn user_activity(&self, user: UserId) -> Result<UserActivity, StoreError>;

    /// Pending rows created at or before `cutoff`, oldest first.
    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Intent>, StoreError>;
}

/// A write scope opened by [`RecordStore::begin`]
///
/// Reads inside the scope see the snapshot taken at `begin` plus the scope's own
/// writes. Status changes are buffered until [`commit`](RecordScope::commit).
///
/// Pending intents are written ahead: they become visible to other readers as
/// soon as they are inserted, so that a process dying after the ledger call
/// leaves a pending row behind for the reconciler. [`rollback`](RecordScope::rollback)
/// deletes them again. Dropping a scope without committing or rolling back
/// behaves like a crash: buffered updates are lost, inserted rows stay pending.
#[async_trait]
pub trait RecordScope: Send + Sync {
    /// Insert a pending row.
    ///
    /// # Errors
    ///
    /// * `DuplicateKey` - another row carries the same idempotency key
    /// * `BadArguments` - a refund exceeds what is left to refund on its original
    /// * `NotFound` - a refund names an original that does not exist
    async fn insert_pending(&mut self, new: NewIntent) -> Result<Intent, StoreError>;

    /// Buffer a status change. The transition is checked against the scope's view.
    async fn update_status(&mut self, id: RecordId, status: RecordStatus) -> Result<(), StoreError>;

    /// Buffer a move to the row's failure terminal with a reason.
    async fn mark_failed(&mut self, id: RecordId, reason: FailureReason) -> Result<(), StoreError>;

    /// Buffer a reversal of a completed transaction.
    ///
    /// Whether it becomes `reversed` or `partially_reversed` is decided at commit
    /// from the refunds completed by then, including those committed by this scope.
    async fn mark_reversed(&mut self, original: RecordId) -> Result<(), StoreError>;

    /// Read a row as this scope sees it.
    async fn get_intent(&self, id: RecordId) -> Result<Option<Intent>, StoreError>;

    /// Apply every buffered change atomically.
    ///
    /// # Errors
    ///
    /// * `Conflict` - a buffered transition is no longer legal against the
    ///   committed state; nothing is applied
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard buffered changes and delete rows inserted by this scope.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Profile of a customer as held by the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

/// Profile of a merchant as held by the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantProfile {
    pub id: MerchantId,
    pub name: String,
    /// Free-form category as registered (`restaurant`, `grocery`, ...).
    pub category: String,
}

/// Read-only view of the platform's user and merchant registry.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Batched user lookup. Unknown ids are absent from the result.
    async fn users(&self, ids: &[UserId]) -> Result<HashMap<UserId, UserProfile>, StoreError>;

    async fn merchant(&self, id: MerchantId) -> Result<Option<MerchantProfile>, StoreError>;
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
