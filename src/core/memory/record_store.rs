//! In-process record store
//!
//! # Design
//!
//! Live rows sit in one [`Tables`] value behind a `parking_lot` lock and are
//! changed in place. Every change bumps a version counter. A scope remembers the
//! version it began at; when a row changes while older scopes are open, its
//! previous value is kept aside tagged with the replacing version, and a scope
//! reading that row gets the value as of its own begin version. Kept versions
//! are dropped as soon as the oldest scope that could read them closes.
//!
//! Pending intents are written ahead into the live tables as soon as they are
//! inserted; status changes are buffered in the scope and applied on commit
//! after every transition has been re-checked against the live rows.
//!
//! A `tokio` semaphore stands in for the connection pool: every plain read holds
//! a permit for its duration, every scope holds one from `begin` until it
//! finishes.

use crate::core::traits::{Clock, RecordScope, RecordStore};
use crate::types::{
    CoinPurchase, Coins, FailureReason, Intent, MerchantId, NewIntent, Page, Paged,
    PurchaseStatus, RecordId, RecordStatus, ReferralReward, RewardStatus, Settlement,
    SettlementStatus, StoreError, Transaction, TransactionKind, TransactionStatus,
    UserActivity, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Committed rows of every table.
#[derive(Debug, Default)]
struct Tables {
    purchases: BTreeMap<RecordId, CoinPurchase>,
    transactions: BTreeMap<RecordId, Transaction>,
    settlements: BTreeMap<RecordId, Settlement>,
    rewards: BTreeMap<RecordId, ReferralReward>,
    /// Idempotency key -> row
    keys: HashMap<String, RecordId>,
}

impl Tables {
    fn intent(&self, id: RecordId) -> Option<Intent> {
        if let Some(row) = self.purchases.get(&id) {
            return Some(Intent::Purchase(row.clone()));
        }
        if let Some(row) = self.transactions.get(&id) {
            return Some(Intent::Transaction(row.clone()));
        }
        if let Some(row) = self.settlements.get(&id) {
            return Some(Intent::Settlement(row.clone()));
        }
        self.rewards.get(&id).map(|row| Intent::Reward(row.clone()))
    }

    fn put(&mut self, intent: Intent) {
        match intent {
            Intent::Purchase(row) => {
                self.purchases.insert(row.id, row);
            }
            Intent::Transaction(row) => {
                self.transactions.insert(row.id, row);
            }
            Intent::Settlement(row) => {
                self.settlements.insert(row.id, row);
            }
            Intent::Reward(row) => {
                self.rewards.insert(row.id, row);
            }
        }
    }

    fn remove(&mut self, id: RecordId) {
        let key = self
            .intent(id)
            .and_then(|row| row.idempotency_key().map(str::to_string));
        if let Some(key) = key {
            if self.keys.get(&key) == Some(&id) {
                self.keys.remove(&key);
            }
        }
        self.purchases.remove(&id);
        self.transactions.remove(&id);
        self.settlements.remove(&id);
        self.rewards.remove(&id);
    }

    /// Amount a refund may at most reverse on `original`.
    fn refundable_amount(&self, original: RecordId) -> Option<Coins> {
        if let Some(purchase) = self.purchases.get(&original) {
            return Some(purchase.coins);
        }
        self.transactions.get(&original).map(|tx| tx.final_amount)
    }

    /// Sum of refunds of `original` in any of `statuses`.
    fn refunds_of(&self, original: RecordId, statuses: &[TransactionStatus]) -> Coins {
        self.transactions
            .values()
            .filter(|tx| tx.kind == TransactionKind::Refund && tx.refund_of == Some(original))
            .filter(|tx| statuses.contains(&tx.status))
            .map(|tx| tx.final_amount)
            .sum()
    }

    fn spent_since(&self, user: UserId, since: DateTime<Utc>) -> Coins {
        self.transactions
            .values()
            .filter(|tx| tx.payer() == Some(user) && tx.created_at >= since)
            .map(Transaction::coins_spent)
            .sum()
    }
}

/// Newest first, ties broken by the larger id.
fn newest_first<T>(rows: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, RecordId)) {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn paginate<T: Clone>(rows: Vec<T>, page: Page) -> Paged<T> {
    Paged {
        total_count: rows.len() as u64,
        items: page.slice(&rows),
    }
}

fn check_page(page: Page) -> Result<(), StoreError> {
    if page.is_valid() {
        Ok(())
    } else {
        Err(StoreError::BadArguments(format!(
            "page must be >= 1 and limit within 1..={}, got page {} limit {}",
            crate::types::MAX_PAGE_LIMIT,
            page.page,
            page.limit
        )))
    }
}

/// Live rows plus the older versions open scopes may still read.
#[derive(Debug, Default)]
struct State {
    tables: Tables,
    /// Bumped by every change to the live rows
    version: u64,
    /// Begin version -> number of open scopes that began there
    open: BTreeMap<u64, usize>,
    /// Row -> (replacing version, value before it), oldest first
    superseded: HashMap<RecordId, Vec<(u64, Option<Intent>)>>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Keep the current value of `id` for open scopes before it changes at `version`.
    fn preserve(&mut self, id: RecordId, version: u64) {
        if self.open.is_empty() {
            return;
        }
        let history = self.superseded.entry(id).or_default();
        if history.last().is_some_and(|(v, _)| *v == version) {
            return;
        }
        history.push((version, self.tables.intent(id)));
    }

    /// Row `id` as it was at `version`.
    fn as_of(&self, id: RecordId, version: u64) -> Option<Intent> {
        let before = self
            .superseded
            .get(&id)
            .and_then(|history| history.iter().find(|(v, _)| *v > version));
        match before {
            Some((_, row)) => row.clone(),
            None => self.tables.intent(id),
        }
    }

    fn open_scope(&mut self) -> u64 {
        let version = self.version;
        *self.open.entry(version).or_default() += 1;
        version
    }

    fn close_scope(&mut self, began: u64) {
        let oldest_before = self.open.keys().next().copied();
        if let Some(count) = self.open.get_mut(&began) {
            *count -= 1;
            if *count == 0 {
                self.open.remove(&began);
            }
        }
        let oldest = self.open.keys().next().copied();
        if oldest == oldest_before {
            return;
        }
        match oldest {
            None => self.superseded.clear(),
            Some(oldest) => self.superseded.retain(|_, history| {
                history.retain(|(v, _)| *v > oldest);
                !history.is_empty()
            }),
        }
    }
}

struct StoreInner {
    state: RwLock<State>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    pool: Arc<Semaphore>,
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInner")
            .field("next_id", &self.next_id)
            .field("available_connections", &self.pool.available_permits())
            .finish_non_exhaustive()
    }
}

impl StoreInner {
    fn tables(&self) -> MappedRwLockReadGuard<'_, Tables> {
        RwLockReadGuard::map(self.state.read(), |state| &state.tables)
    }

    async fn connection(&self) -> Result<OwnedSemaphorePermit, StoreError> {
        Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Unavailable("connection pool is closed".to_string()))
    }
}

/// Record store held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    inner: Arc<StoreInner>,
}

impl MemoryRecordStore {
    /// # Arguments
    ///
    /// * `clock` - stamps `created_at` on inserted rows
    /// * `max_connections` - size of the connection pool
    pub fn new(clock: Arc<dyn Clock>, max_connections: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(State::default()),
                next_id: AtomicU64::new(1),
                clock,
                pool: Arc::new(Semaphore::new(max_connections.max(1))),
            }),
        }
    }

    /// Refuse every further connection.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    /// Every row in the store, for audits and tests.
    pub fn all_intents(&self) -> Vec<Intent> {
        let tables = self.inner.tables();
        let ids: BTreeSet<RecordId> = tables
            .purchases
            .keys()
            .chain(tables.transactions.keys())
            .chain(tables.settlements.keys())
            .chain(tables.rewards.keys())
            .copied()
            .collect();
        ids.into_iter().filter_map(|id| tables.intent(id)).collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordScope>, StoreError> {
        let permit = self.inner.connection().await?;
        let began = self.inner.state.write().open_scope();
        Ok(Box::new(MemoryScope {
            inner: Arc::clone(&self.inner),
            began,
            inserted: Vec::new(),
            view: HashMap::new(),
            dirty: BTreeSet::new(),
            reversals: BTreeSet::new(),
            _permit: permit,
        }))
    }

    async fn get_purchase(&self, id: RecordId) -> Result<CoinPurchase, StoreError> {
        let _conn = self.inner.connection().await?;
        self.inner
            .tables()
            .purchases
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "coin_purchase", id })
    }

    async fn get_transaction(&self, id: RecordId) -> Result<Transaction, StoreError> {
        let _conn = self.inner.connection().await?;
        self.inner
            .tables()
            .transactions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "transaction", id })
    }

    async fn get_settlement(&self, id: RecordId) -> Result<Settlement, StoreError> {
        let _conn = self.inner.connection().await?;
        self.inner
            .tables()
            .settlements
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "settlement", id })
    }

    async fn find_intent(&self, id: RecordId) -> Result<Option<Intent>, StoreError> {
        let _conn = self.inner.connection().await?;
        Ok(self.inner.tables().intent(id))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Intent>, StoreError> {
        let _conn = self.inner.connection().await?;
        let tables = self.inner.tables();
        Ok(tables.keys.get(key).and_then(|id| tables.intent(*id)))
    }

    async fn list_purchases_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Paged<CoinPurchase>, StoreError> {
        check_page(page)?;
        let _conn = self.inner.connection().await?;
        let mut rows: Vec<CoinPurchase> = self
            .inner
            .tables()
            .purchases
            .values()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect();
        newest_first(&mut rows, |p| (p.created_at, p.id));
        Ok(paginate(rows, page))
    }

    async fn list_transactions_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Paged<Transaction>, StoreError> {
        check_page(page)?;
        let _conn = self.inner.connection().await?;
        let mut rows: Vec<Transaction> = self
            .inner
            .tables()
            .transactions
            .values()
            .filter(|tx| tx.involves(user))
            .cloned()
            .collect();
        newest_first(&mut rows, |tx| (tx.created_at, tx.id));
        Ok(paginate(rows, page))
    }

    async fn list_settlements_by_merchant(
        &self,
        merchant: MerchantId,
        page: Page,
    ) -> Result<Paged<Settlement>, StoreError> {
        check_page(page)?;
        let _conn = self.inner.connection().await?;
        let mut rows: Vec<Settlement> = self
            .inner
            .tables()
            .settlements
            .values()
            .filter(|s| s.merchant_id == merchant)
            .cloned()
            .collect();
        newest_first(&mut rows, |s| (s.created_at, s.id));
        Ok(paginate(rows, page))
    }

    async fn spent_since(&self, user: UserId, since: DateTime<Utc>) -> Result<Coins, StoreError> {
        let _conn = self.inner.connection().await?;
        Ok(self.inner.tables().spent_since(user, since))
    }

    async fn refunded_total(&self, original: RecordId) -> Result<Coins, StoreError> {
        let _conn = self.inner.connection().await?;
        Ok(self.inner.tables().refunds_of(
            original,
            &[TransactionStatus::Pending, TransactionStatus::Completed],
        ))
    }

    async fn user_activity(&self, user: UserId) -> Result<UserActivity, StoreError> {
        let _conn = self.inner.connection().await?;
        let tables = self.inner.tables();
        Ok(UserActivity {
            purchases: tables
                .purchases
                .values()
                .filter(|p| p.user_id == user)
                .cloned()
                .collect(),
            transactions: tables
                .transactions
                .values()
                .filter(|tx| tx.involves(user))
                .cloned()
                .collect(),
            rewards: tables
                .rewards
                .values()
                .filter(|r| r.beneficiary() == user)
                .cloned()
                .collect(),
        })
    }

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Intent>, StoreError> {
        let _conn = self.inner.connection().await?;
        let tables = self.inner.tables();
        let pending = tables
            .purchases
            .values()
            .filter(|r| r.status == PurchaseStatus::Pending)
            .map(|r| Intent::Purchase(r.clone()))
            .chain(
                tables
                    .transactions
                    .values()
                    .filter(|r| r.status == TransactionStatus::Pending)
                    .map(|r| Intent::Transaction(r.clone())),
            )
            .chain(
                tables
                    .settlements
                    .values()
                    .filter(|r| r.status == SettlementStatus::Pending)
                    .map(|r| Intent::Settlement(r.clone())),
            )
            .chain(
                tables
                    .rewards
                    .values()
                    .filter(|r| r.status == RewardStatus::Pending)
                    .map(|r| Intent::Reward(r.clone())),
            )
            .filter(|intent| intent.created_at() <= cutoff);

        let mut rows: Vec<Intent> = pending.collect();
        rows.sort_by_key(|intent| (intent.created_at(), intent.id()));
        Ok(rows)
    }
}

/// Write scope over a [`MemoryRecordStore`].
struct MemoryScope {
    inner: Arc<StoreInner>,
    /// Version of the live rows at `begin`
    began: u64,
    /// Rows this scope wrote ahead
    inserted: Vec<RecordId>,
    /// This scope's view of rows it inserted or updated
    view: HashMap<RecordId, Intent>,
    /// Rows with buffered status changes
    dirty: BTreeSet<RecordId>,
    /// Transactions to re-derive as reversed / partially reversed at commit
    reversals: BTreeSet<RecordId>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryScope {
    fn read(&self, id: RecordId) -> Option<Intent> {
        self.view
            .get(&id)
            .cloned()
            .or_else(|| self.inner.state.read().as_of(id, self.began))
    }

    fn require(&self, id: RecordId) -> Result<Intent, StoreError> {
        self.read(id).ok_or(StoreError::NotFound { entity: "record", id })
    }

    fn stage(
        &mut self,
        current: Intent,
        status: RecordStatus,
        failure: Option<FailureReason>,
    ) -> Result<(), StoreError> {
        if !current.status().can_become(status) {
            return Err(StoreError::Conflict(format!(
                "{} {} cannot move from {} to {}",
                current.entity(),
                current.id(),
                current.status(),
                status
            )));
        }
        let next = current.with_status(status, failure).ok_or_else(|| {
            StoreError::Conflict(format!(
                "status {} does not apply to {} {}",
                status,
                current.entity(),
                current.id()
            ))
        })?;
        self.dirty.insert(next.id());
        self.view.insert(next.id(), next);
        Ok(())
    }

    /// Check every buffered change against the live rows, then apply them all
    /// at one version. Nothing is applied if any check fails.
    fn apply(&self, state: &mut State) -> Result<(), StoreError> {
        let mut staged: Vec<Intent> = Vec::with_capacity(self.dirty.len() + self.reversals.len());
        for id in &self.dirty {
            let Some(next) = self.view.get(id) else {
                continue;
            };
            let live = state.tables.intent(*id).ok_or_else(|| {
                StoreError::Conflict(format!("{} {} no longer exists", next.entity(), id))
            })?;
            if !live.status().can_become(next.status()) {
                return Err(StoreError::Conflict(format!(
                    "{} {} is {} and cannot move to {}",
                    live.entity(),
                    id,
                    live.status(),
                    next.status()
                )));
            }
            staged.push(next.clone());
        }

        for original in &self.reversals {
            let current = staged
                .iter()
                .find_map(|row| match row {
                    Intent::Transaction(tx) if tx.id == *original => Some(tx.clone()),
                    _ => None,
                })
                .or_else(|| state.tables.transactions.get(original).cloned());
            let Some(tx) = current else {
                return Err(StoreError::Conflict(format!(
                    "transaction {} no longer exists",
                    original
                )));
            };

            let mut refunded = state
                .tables
                .refunds_of(*original, &[TransactionStatus::Completed]);
            for row in &staged {
                let Intent::Transaction(refund) = row else {
                    continue;
                };
                if refund.kind != TransactionKind::Refund || refund.refund_of != Some(*original) {
                    continue;
                }
                let was = state.tables.transactions.get(&refund.id).map(|t| t.status);
                if was == Some(TransactionStatus::Completed) {
                    refunded -= refund.final_amount;
                }
                if refund.status == TransactionStatus::Completed {
                    refunded += refund.final_amount;
                }
            }

            let status = if refunded >= tx.final_amount {
                TransactionStatus::Reversed
            } else {
                TransactionStatus::PartiallyReversed
            };
            if !RecordStatus::Transaction(tx.status).can_become(RecordStatus::Transaction(status)) {
                return Err(StoreError::Conflict(format!(
                    "transaction {} is {} and cannot move to {}",
                    original, tx.status, status
                )));
            }
            staged.push(Intent::Transaction(Transaction { status, ..tx }));
        }

        if staged.is_empty() {
            return Ok(());
        }
        let version = state.next_version();
        for row in staged {
            state.preserve(row.id(), version);
            state.tables.put(row);
        }
        Ok(())
    }

    /// Validate a refund against the live state, which already includes refunds
    /// written ahead by concurrent scopes.
    fn check_refund(live: &Tables, original: RecordId, amount: Coins) -> Result<(), StoreError> {
        let Some(limit) = live.refundable_amount(original) else {
            return Err(StoreError::NotFound {
                entity: "record",
                id: original,
            });
        };
        let claimed = live.refunds_of(
            original,
            &[TransactionStatus::Pending, TransactionStatus::Completed],
        );
        if claimed + amount > limit {
            return Err(StoreError::BadArguments(format!(
                "refund of {} exceeds the {} left to refund on {}",
                amount,
                limit - claimed,
                original
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordScope for MemoryScope {
    async fn insert_pending(&mut self, new: NewIntent) -> Result<Intent, StoreError> {
        let created_at = self.inner.clock.now();
        let mut state = self.inner.state.write();

        if let Some(key) = new.idempotency_key() {
            if state.tables.keys.contains_key(key) {
                return Err(StoreError::DuplicateKey(key.to_string()));
            }
        }
        if let NewIntent::Transaction(tx) = &new {
            if let (TransactionKind::Refund, Some(original)) = (tx.kind, tx.refund_of) {
                Self::check_refund(&state.tables, original, tx.final_amount)?;
            }
        }

        let id = RecordId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let intent = match new {
            NewIntent::Purchase(p) => Intent::Purchase(CoinPurchase {
                id,
                user_id: p.user_id,
                fiat_amount: p.fiat_amount,
                coins: p.coins,
                payment_method: p.payment_method,
                status: PurchaseStatus::Pending,
                created_at,
                external_payment_id: p.external_payment_id,
                idempotency_key: p.idempotency_key,
                failure: None,
            }),
            NewIntent::Transaction(t) => Intent::Transaction(Transaction {
                id,
                debit: t.debit,
                credit: t.credit,
                kind: t.kind,
                original_amount: t.original_amount,
                discount_amount: t.discount_amount,
                final_amount: t.final_amount,
                status: TransactionStatus::Pending,
                refund_of: t.refund_of,
                order_id: t.order_id,
                description: t.description,
                idempotency_key: t.idempotency_key,
                created_at,
                failure: None,
            }),
            NewIntent::Settlement(s) => Intent::Settlement(Settlement {
                id,
                merchant_id: s.merchant_id,
                amount: s.amount,
                status: SettlementStatus::Pending,
                period_start: s.period_start,
                period_end: s.period_end,
                created_at,
                idempotency_key: s.idempotency_key,
                failure: None,
            }),
            NewIntent::Reward(r) => Intent::Reward(ReferralReward {
                id,
                referrer_id: r.referrer_id,
                referred_id: r.referred_id,
                amount: r.amount,
                kind: r.kind,
                status: RewardStatus::Pending,
                created_at,
                idempotency_key: r.idempotency_key,
                failure: None,
            }),
        };

        let version = state.next_version();
        state.preserve(id, version);
        if let Some(key) = intent.idempotency_key() {
            state.tables.keys.insert(key.to_string(), id);
        }
        state.tables.put(intent.clone());
        drop(state);

        self.inserted.push(id);
        self.view.insert(id, intent.clone());
        Ok(intent)
    }

    async fn update_status(&mut self, id: RecordId, status: RecordStatus) -> Result<(), StoreError> {
        let current = self.require(id)?;
        let failure = current.failure();
        self.stage(current, status, failure)
    }

    async fn mark_failed(&mut self, id: RecordId, reason: FailureReason) -> Result<(), StoreError> {
        let current = self.require(id)?;
        let status = current.failed_status();
        self.stage(current, status, Some(reason))
    }

    async fn mark_reversed(&mut self, original: RecordId) -> Result<(), StoreError> {
        match self.require(original)? {
            Intent::Transaction(tx) => {
                let current = RecordStatus::Transaction(tx.status);
                if !current.can_become(RecordStatus::Transaction(TransactionStatus::Reversed)) {
                    return Err(StoreError::Conflict(format!(
                        "transaction {} is {} and cannot be reversed",
                        tx.id, tx.status
                    )));
                }
                self.reversals.insert(original);
                Ok(())
            }
            other => Err(StoreError::Conflict(format!(
                "{} {} is not a transaction",
                other.entity(),
                original
            ))),
        }
    }

    async fn get_intent(&self, id: RecordId) -> Result<Option<Intent>, StoreError> {
        Ok(self.read(id))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.apply(&mut self.inner.state.write())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if self.inserted.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.write();
            let version = state.next_version();
            for id in &self.inserted {
                state.preserve(*id, version);
                state.tables.remove(*id);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        self.inner.state.write().close_scope(self.began);
    }
}
