//! Record-store entities
//!
//! Rows of the relational side of the engine: coin purchases, transactions,
//! settlements and referral rewards. Every value-moving row starts life as a
//! `pending` intent and is flipped to a terminal status by the coordinator (or by
//! the reconciler when the flip was lost).
//!
//! # Status lifecycles
//!
//! ```text
//! CoinPurchase  : pending -> completed -> refunded
//!                 pending -> failed
//! Transaction   : pending -> completed -> partially_reversed -> reversed
//!                 pending -> failed      completed -> reversed
//! Settlement    : pending -> completed | failed
//! ReferralReward: pending -> credited | expired
//! ```

use super::ids::{AccountId, MerchantId, Party, RecordId, TransferId, UserId};
use super::ledger::{OpCode, TransferSpec};
use super::money::Coins;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest page size accepted by paginated queries.
pub const MAX_PAGE_LIMIT: u32 = 100;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Status of a [`CoinPurchase`].
    PurchaseStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
);

status_enum!(
    /// Status of a [`Transaction`].
    TransactionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Reversed => "reversed",
        PartiallyReversed => "partially_reversed",
    }
);

status_enum!(
    /// Status of a [`Settlement`].
    SettlementStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
);

status_enum!(
    /// Status of a [`ReferralReward`]. `Expired` is the failure terminal.
    RewardStatus {
        Pending => "pending",
        Credited => "credited",
        Expired => "expired",
    }
);

status_enum!(
    /// What a [`Transaction`] row represents.
    TransactionKind {
        MerchantPayment => "merchant_payment",
        UserTransfer => "user_transfer",
        Refund => "refund",
    }
);

status_enum!(
    /// Which side of a referral a [`ReferralReward`] pays.
    RewardKind {
        Referrer => "referrer",
        Referee => "referee",
    }
);

status_enum!(
    /// Why an intent ended in its failure terminal.
    FailureReason {
        InsufficientFunds => "insufficient_funds",
        AccountMissing => "account_missing",
        NotPosted => "not_posted",
    }
);

/// Status of any record, used by scoped status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum RecordStatus {
    Purchase(PurchaseStatus),
    Transaction(TransactionStatus),
    Settlement(SettlementStatus),
    Reward(RewardStatus),
}

impl RecordStatus {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            RecordStatus::Purchase(PurchaseStatus::Pending)
                | RecordStatus::Transaction(TransactionStatus::Pending)
                | RecordStatus::Settlement(SettlementStatus::Pending)
                | RecordStatus::Reward(RewardStatus::Pending)
        )
    }

    /// Whether a row currently in `self` may be moved to `next`.
    ///
    /// Re-applying the current status is allowed so that a resumed or reconciled
    /// flip is harmless.
    pub fn can_become(self, next: RecordStatus) -> bool {
        use RecordStatus as S;

        if self == next {
            return true;
        }
        match (self, next) {
            (S::Purchase(from), S::Purchase(to)) => matches!(
                (from, to),
                (
                    PurchaseStatus::Pending,
                    PurchaseStatus::Completed | PurchaseStatus::Failed
                ) | (PurchaseStatus::Completed, PurchaseStatus::Refunded)
            ),
            (S::Transaction(from), S::Transaction(to)) => matches!(
                (from, to),
                (
                    TransactionStatus::Pending,
                    TransactionStatus::Completed | TransactionStatus::Failed
                ) | (
                        TransactionStatus::Completed | TransactionStatus::PartiallyReversed,
                        TransactionStatus::Reversed | TransactionStatus::PartiallyReversed
                    )
            ),
            (S::Settlement(from), S::Settlement(_)) => from == SettlementStatus::Pending,
            (S::Reward(from), S::Reward(_)) => from == RewardStatus::Pending,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Purchase(s) => s.as_str(),
            RecordStatus::Transaction(s) => s.as_str(),
            RecordStatus::Settlement(s) => s.as_str(),
            RecordStatus::Reward(s) => s.as_str(),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A top-up intent: fiat in, coins credited from the system account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinPurchase {
    pub id: RecordId,
    pub user_id: UserId,
    /// Fiat charged, in minor units of the fiat currency.
    pub fiat_amount: Coins,
    pub coins: Coins,
    pub payment_method: String,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
    pub external_payment_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub failure: Option<FailureReason>,
}

/// A value movement between two in-system accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: RecordId,
    pub debit: Party,
    pub credit: Party,
    pub kind: TransactionKind,
    pub original_amount: Coins,
    pub discount_amount: Coins,
    /// Coins actually moved on the ledger.
    pub final_amount: Coins,
    pub status: TransactionStatus,
    /// For refunds, the transaction or coin purchase being reversed.
    pub refund_of: Option<RecordId>,
    pub order_id: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub failure: Option<FailureReason>,
}

impl Transaction {
    /// The paying user, if the debit side is a user.
    pub fn payer(&self) -> Option<UserId> {
        self.debit.user()
    }

    /// Whether `user` is on either side of the movement.
    pub fn involves(&self, user: UserId) -> bool {
        self.debit == Party::User(user) || self.credit == Party::User(user)
    }

    /// The other side of the movement as seen from `user`.
    pub fn counterparty_of(&self, user: UserId) -> Option<Party> {
        if self.debit == Party::User(user) {
            Some(self.credit)
        } else if self.credit == Party::User(user) {
            Some(self.debit)
        } else {
            None
        }
    }

    /// Coins this row counts towards the payer's spending limits.
    pub fn coins_spent(&self) -> Coins {
        match (self.kind, self.status) {
            (TransactionKind::MerchantPayment, TransactionStatus::Failed) => Coins::ZERO,
            (TransactionKind::MerchantPayment, _) => self.final_amount,
            _ => Coins::ZERO,
        }
    }
}

/// A merchant payout of accrued coins to the settlement account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: RecordId,
    pub merchant_id: MerchantId,
    pub amount: Coins,
    pub status: SettlementStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub failure: Option<FailureReason>,
}

/// One side of a referral bonus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralReward {
    pub id: RecordId,
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub amount: Coins,
    pub kind: RewardKind,
    pub status: RewardStatus,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub failure: Option<FailureReason>,
}

impl ReferralReward {
    /// The user credited by this reward.
    pub fn beneficiary(&self) -> UserId {
        match self.kind {
            RewardKind::Referrer => self.referrer_id,
            RewardKind::Referee => self.referred_id,
        }
    }
}

/// Insert parameters for a pending [`CoinPurchase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    pub user_id: UserId,
    pub fiat_amount: Coins,
    pub coins: Coins,
    pub payment_method: String,
    pub external_payment_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Insert parameters for a pending [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub debit: Party,
    pub credit: Party,
    pub kind: TransactionKind,
    pub original_amount: Coins,
    pub discount_amount: Coins,
    pub final_amount: Coins,
    pub refund_of: Option<RecordId>,
    pub order_id: Option<String>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Insert parameters for a pending [`Settlement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSettlement {
    pub merchant_id: MerchantId,
    pub amount: Coins,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

/// Insert parameters for a pending [`ReferralReward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReferralReward {
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub amount: Coins,
    pub kind: RewardKind,
    pub idempotency_key: Option<String>,
}

/// Insert parameters for any pending intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewIntent {
    Purchase(NewPurchase),
    Transaction(NewTransaction),
    Settlement(NewSettlement),
    Reward(NewReferralReward),
}

impl NewIntent {
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            NewIntent::Purchase(r) => r.idempotency_key.as_deref(),
            NewIntent::Transaction(r) => r.idempotency_key.as_deref(),
            NewIntent::Settlement(r) => r.idempotency_key.as_deref(),
            NewIntent::Reward(r) => r.idempotency_key.as_deref(),
        }
    }
}

/// Any value-moving row, viewed as the intent it records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Purchase(CoinPurchase),
    Transaction(Transaction),
    Settlement(Settlement),
    Reward(ReferralReward),
}

impl Intent {
    pub fn id(&self) -> RecordId {
        match self {
            Intent::Purchase(r) => r.id,
            Intent::Transaction(r) => r.id,
            Intent::Settlement(r) => r.id,
            Intent::Reward(r) => r.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Intent::Purchase(r) => r.created_at,
            Intent::Transaction(r) => r.created_at,
            Intent::Settlement(r) => r.created_at,
            Intent::Reward(r) => r.created_at,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            Intent::Purchase(r) => r.idempotency_key.as_deref(),
            Intent::Transaction(r) => r.idempotency_key.as_deref(),
            Intent::Settlement(r) => r.idempotency_key.as_deref(),
            Intent::Reward(r) => r.idempotency_key.as_deref(),
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self {
            Intent::Purchase(r) => RecordStatus::Purchase(r.status),
            Intent::Transaction(r) => RecordStatus::Transaction(r.status),
            Intent::Settlement(r) => RecordStatus::Settlement(r.status),
            Intent::Reward(r) => RecordStatus::Reward(r.status),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_pending()
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            Intent::Purchase(r) => r.failure,
            Intent::Transaction(r) => r.failure,
            Intent::Settlement(r) => r.failure,
            Intent::Reward(r) => r.failure,
        }
    }

    /// Status the row takes once its transfer is on the ledger.
    pub fn completed_status(&self) -> RecordStatus {
        match self {
            Intent::Purchase(_) => RecordStatus::Purchase(PurchaseStatus::Completed),
            Intent::Transaction(_) => RecordStatus::Transaction(TransactionStatus::Completed),
            Intent::Settlement(_) => RecordStatus::Settlement(SettlementStatus::Completed),
            Intent::Reward(_) => RecordStatus::Reward(RewardStatus::Credited),
        }
    }

    /// Failure terminal of the row.
    pub fn failed_status(&self) -> RecordStatus {
        match self {
            Intent::Purchase(_) => RecordStatus::Purchase(PurchaseStatus::Failed),
            Intent::Transaction(_) => RecordStatus::Transaction(TransactionStatus::Failed),
            Intent::Settlement(_) => RecordStatus::Settlement(SettlementStatus::Failed),
            Intent::Reward(_) => RecordStatus::Reward(RewardStatus::Expired),
        }
    }

    /// The ledger movement this row stands for.
    pub fn transfer_spec(&self) -> TransferSpec {
        match self {
            Intent::Purchase(r) => TransferSpec {
                debit: AccountId::SYSTEM,
                credit: AccountId::for_user(r.user_id),
                amount: r.coins,
                op: OpCode::TopUp,
            },
            Intent::Transaction(r) => TransferSpec {
                debit: r.debit.account_id(),
                credit: r.credit.account_id(),
                amount: r.final_amount,
                op: match r.kind {
                    TransactionKind::MerchantPayment => OpCode::MerchantPayment,
                    TransactionKind::UserTransfer => OpCode::UserTransfer,
                    TransactionKind::Refund => OpCode::Refund,
                },
            },
            Intent::Settlement(r) => TransferSpec {
                debit: AccountId::for_merchant(r.merchant_id),
                credit: AccountId::SETTLEMENT,
                amount: r.amount,
                op: OpCode::Settlement,
            },
            Intent::Reward(r) => TransferSpec {
                debit: AccountId::SYSTEM,
                credit: AccountId::for_user(r.beneficiary()),
                amount: r.amount,
                op: OpCode::TopUp,
            },
        }
    }

    /// Transfer id the coordinator posts for this row.
    pub fn transfer_id(&self) -> TransferId {
        TransferId::for_record(self.created_at(), self.id())
    }

    pub fn entity(&self) -> &'static str {
        match self {
            Intent::Purchase(_) => "coin_purchase",
            Intent::Transaction(_) => "transaction",
            Intent::Settlement(_) => "settlement",
            Intent::Reward(_) => "referral_reward",
        }
    }

    /// Copy of the row with its status (and failure reason) replaced.
    ///
    /// Returns `None` when `status` belongs to a different entity.
    pub fn with_status(&self, status: RecordStatus, failure: Option<FailureReason>) -> Option<Intent> {
        let mut next = self.clone();
        match (&mut next, status) {
            (Intent::Purchase(r), RecordStatus::Purchase(s)) => {
                r.status = s;
                r.failure = failure;
            }
            (Intent::Transaction(r), RecordStatus::Transaction(s)) => {
                r.status = s;
                r.failure = failure;
            }
            (Intent::Settlement(r), RecordStatus::Settlement(s)) => {
                r.status = s;
                r.failure = failure;
            }
            (Intent::Reward(r), RecordStatus::Reward(s)) => {
                r.status = s;
                r.failure = failure;
            }
            _ => return None,
        }
        Some(next)
    }
}

/// 1-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Page { page, limit }
    }

    pub fn is_valid(&self) -> bool {
        self.page >= 1 && (1..=MAX_PAGE_LIMIT).contains(&self.limit)
    }

    /// `(page - 1) * limit`
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }

    /// Slice one page out of an already ordered list.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset())
            .take(self.limit as usize)
            .cloned()
            .collect()
    }
}

/// One page of results plus the size of the unpaged result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

/// Every value-moving row that touches one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserActivity {
    pub purchases: Vec<CoinPurchase>,
    pub transactions: Vec<Transaction>,
    pub rewards: Vec<ReferralReward>,
}
