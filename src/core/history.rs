//! Financial history projection
//!
//! Builds a user's unified credit/debit timeline from the record store. The
//! projection is pure: [`project`] maps rows to items, and
//! [`HistoryProjector`] adds filtering, pagination, counterparty enrichment and
//! a fresh ledger balance.
//!
//! # Design
//!
//! Only rows whose value actually moved are projected:
//!
//! - coin purchases that are `completed` or `refunded` (credit)
//! - transactions that are `completed`, `reversed` or `partially_reversed`
//!   (credit or debit depending on which side the user is on; refunds appear as
//!   their own completed rows)
//! - referral rewards that are `credited` (credit)
//!
//! With that rule the signed sum of `coins` over a user's full history equals
//! their ledger balance whenever no intent is pending.

use crate::core::ledger::LedgerAdapter;
use crate::core::traits::{Directory, RecordStore};
use crate::types::{
    AccountId, CoinPurchase, Coins, Counterparty, Direction, EngineError, FinancialHistory,
    HistoryEntry, HistoryFilter, HistoryItem, Page, Party, PurchaseStatus, RecordStatus,
    ReferralReward, RewardKind, RewardStatus, Role, Transaction, TransactionKind,
    TransactionStatus, UserActivity, UserId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn counterparty(party: Party) -> Counterparty {
    let (id, role) = match party {
        Party::System => (AccountId::SYSTEM.domain_id(), Role::System),
        Party::Settlement => (AccountId::SETTLEMENT.domain_id(), Role::System),
        Party::User(user) => (user.0, Role::Customer),
        Party::Merchant(merchant) => (merchant.0, Role::Merchant),
    };
    Counterparty {
        id,
        role,
        name: None,
        email: None,
    }
}

fn purchase_item(purchase: &CoinPurchase) -> Option<HistoryItem> {
    if !matches!(
        purchase.status,
        PurchaseStatus::Completed | PurchaseStatus::Refunded
    ) {
        return None;
    }
    Some(HistoryItem {
        id: purchase.id,
        direction: Direction::Credit,
        entry: HistoryEntry::CoinPurchase {
            payment_method: purchase.payment_method.clone(),
        },
        amount: purchase.fiat_amount,
        coins: purchase.coins,
        description: format!("Bought {} coins via {}", purchase.coins, purchase.payment_method),
        counterparty: None,
        status: RecordStatus::Purchase(purchase.status),
        timestamp: purchase.created_at,
    })
}

fn transaction_item(user: UserId, tx: &Transaction) -> Option<HistoryItem> {
    if !matches!(
        tx.status,
        TransactionStatus::Completed
            | TransactionStatus::Reversed
            | TransactionStatus::PartiallyReversed
    ) {
        return None;
    }
    let direction = if tx.debit == Party::User(user) {
        Direction::Debit
    } else if tx.credit == Party::User(user) {
        Direction::Credit
    } else {
        return None;
    };

    let entry = match (tx.kind, direction) {
        (TransactionKind::Refund, _) => HistoryEntry::Refund {
            refund_of: tx.refund_of,
        },
        (kind, Direction::Debit) => HistoryEntry::TransactionDebit { kind },
        (kind, Direction::Credit) => HistoryEntry::TransactionCredit { kind },
    };
    let description = tx.description.clone().unwrap_or_else(|| match tx.kind {
        TransactionKind::MerchantPayment => "Merchant payment".to_string(),
        TransactionKind::UserTransfer => "Coin transfer".to_string(),
        TransactionKind::Refund => "Refund".to_string(),
    });

    Some(HistoryItem {
        id: tx.id,
        direction,
        entry,
        amount: tx.original_amount,
        coins: tx.final_amount,
        description,
        counterparty: tx.counterparty_of(user).map(counterparty),
        status: RecordStatus::Transaction(tx.status),
        timestamp: tx.created_at,
    })
}

fn reward_item(user: UserId, reward: &ReferralReward) -> Option<HistoryItem> {
    if reward.status != RewardStatus::Credited || reward.beneficiary() != user {
        return None;
    }
    let (other, description) = match reward.kind {
        RewardKind::Referrer => (reward.referred_id, "Referral bonus for inviting a friend"),
        RewardKind::Referee => (reward.referrer_id, "Welcome bonus for joining by referral"),
    };
    Some(HistoryItem {
        id: reward.id,
        direction: Direction::Credit,
        entry: HistoryEntry::ReferralReward { kind: reward.kind },
        amount: reward.amount,
        coins: reward.amount,
        description: description.to_string(),
        counterparty: Some(counterparty(Party::User(other))),
        status: RecordStatus::Reward(reward.status),
        timestamp: reward.created_at,
    })
}

/// Every history item of `user`, newest first (ties broken by id, descending).
pub fn project(user: UserId, activity: &UserActivity) -> Vec<HistoryItem> {
    let mut items: Vec<HistoryItem> = activity
        .purchases
        .iter()
        .filter(|p| p.user_id == user)
        .filter_map(purchase_item)
        .chain(
            activity
                .transactions
                .iter()
                .filter_map(|tx| transaction_item(user, tx)),
        )
        .chain(activity.rewards.iter().filter_map(|r| reward_item(user, r)))
        .collect();
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
    items
}

/// Signed sum of the items' coin effects.
pub fn net_coins(items: &[HistoryItem]) -> Coins {
    items
        .iter()
        .map(|item| match item.direction {
            Direction::Credit => item.coins,
            Direction::Debit => Coins::ZERO - item.coins,
        })
        .sum()
}

/// Read side of a user's financial history.
pub struct HistoryProjector {
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    ledger: LedgerAdapter,
}

impl HistoryProjector {
    pub fn new(store: Arc<dyn RecordStore>, directory: Arc<dyn Directory>, ledger: LedgerAdapter) -> Self {
        Self {
            store,
            directory,
            ledger,
        }
    }

    /// One page of the user's history plus their current balance.
    ///
    /// User counterparties on the page are enriched with name and email through
    /// a single batched directory lookup. `total_count` counts every item that
    /// passes `filter`, not just the page.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` - page or limit out of bounds
    /// * `NotFound` - the user has no ledger account
    pub async fn financial_history(
        &self,
        user: UserId,
        filter: HistoryFilter,
        page: Page,
        cancel: &CancellationToken,
    ) -> Result<FinancialHistory, EngineError> {
        if !page.is_valid() {
            return Err(EngineError::invalid_input(format!(
                "page {} with limit {} is out of bounds",
                page.page, page.limit
            )));
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let activity = self.store.user_activity(user).await?;
        let items: Vec<HistoryItem> = project(user, &activity)
            .into_iter()
            .filter(|item| filter.admits(item.direction))
            .collect();
        let total_count = items.len() as u64;
        let mut items = page.slice(&items);

        let wanted: BTreeSet<UserId> = items.iter().filter_map(HistoryItem::counterparty_user).collect();
        if !wanted.is_empty() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let wanted: Vec<UserId> = wanted.into_iter().collect();
            let profiles = self.directory.users(&wanted).await?;
            for item in &mut items {
                let Some(other) = item.counterparty_user() else {
                    continue;
                };
                if let (Some(profile), Some(party)) = (profiles.get(&other), item.counterparty.as_mut()) {
                    party.name = Some(profile.name.clone());
                    party.email = Some(profile.email.clone());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let current_balance = self.ledger.balance(AccountId::for_user(user)).await?;
        debug!(user_id = %user, total_count, returned = items.len(), "financial history");

        Ok(FinancialHistory {
            items,
            total_count,
            current_balance,
        })
    }
}
