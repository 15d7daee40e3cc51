//! Shared fixtures for the integration tests
//!
//! [`Harness`] wires a full engine over the in-process ledger and record store,
//! pins the clock, and wraps both stores so a test can inject the two faults the
//! scenarios need:
//!
//! - `fail_next_commit` makes the next scope commit fail after the ledger call
//!   (the scope is dropped, leaving the written-ahead row pending)
//! - `gate_payments` makes merchant-payment transfers wait on a barrier, so
//!   concurrent payments all pass their advisory checks before any posts
//! - `fail_next_post` makes the next transfer fail with a given ledger error
//! - `cancel_after_post` cancels a request's token once its transfer is posted

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use coin_rewards_engine::config::Config;
use coin_rewards_engine::core::clock::ManualClock;
use coin_rewards_engine::core::memory::{MemoryDirectory, MemoryLedger, MemoryRecordStore};
use coin_rewards_engine::core::traits::{Ledger, RecordScope, RecordStore};
use coin_rewards_engine::service::*;
use coin_rewards_engine::types::*;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

/// Monday 2026-03-02 12:00 UTC: restaurants are open.
pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Ledger wrapper that can hold merchant payments at a barrier and inject
/// faults around the next transfer.
pub struct GatedLedger {
    inner: Arc<MemoryLedger>,
    gate: Mutex<Option<Arc<Barrier>>>,
    fault: Mutex<Option<LedgerError>>,
    cancel_on_post: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl Ledger for GatedLedger {
    async fn create_account(&self, id: AccountId, role: Role) -> Result<(), LedgerError> {
        self.inner.create_account(id, role).await
    }

    async fn lookup_account(&self, id: AccountId) -> Result<AccountBalance, LedgerError> {
        self.inner.lookup_account(id).await
    }

    async fn post_transfer(&self, transfer: Transfer) -> Result<Transfer, LedgerError> {
        let gate = self.gate.lock().clone();
        if let (Some(barrier), OpCode::MerchantPayment) = (gate, transfer.op) {
            barrier.wait().await;
        }
        let fault = self.fault.lock().take();
        if let Some(error) = fault {
            return Err(error);
        }
        let posted = self.inner.post_transfer(transfer).await;
        let cancel = self.cancel_on_post.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        posted
    }

    async fn lookup_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        self.inner.lookup_transfer(id).await
    }

    async fn find_transfer_by_tag(&self, tag: u64) -> Result<Option<Transfer>, LedgerError> {
        self.inner.find_transfer_by_tag(tag).await
    }
}

/// Record store wrapper whose next commit can be made to fail.
pub struct FaultyStore {
    inner: MemoryRecordStore,
    fail_commit: Arc<AtomicBool>,
}

struct FaultyScope {
    inner: Box<dyn RecordScope>,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl RecordScope for FaultyScope {
    async fn insert_pending(&mut self, new: NewIntent) -> Result<Intent, StoreError> {
        self.inner.insert_pending(new).await
    }

    async fn update_status(&mut self, id: RecordId, status: RecordStatus) -> Result<(), StoreError> {
        self.inner.update_status(id, status).await
    }

    async fn mark_failed(&mut self, id: RecordId, reason: FailureReason) -> Result<(), StoreError> {
        self.inner.mark_failed(id, reason).await
    }

    async fn mark_reversed(&mut self, original: RecordId) -> Result<(), StoreError> {
        self.inner.mark_reversed(original).await
    }

    async fn get_intent(&self, id: RecordId) -> Result<Option<Intent>, StoreError> {
        self.inner.get_intent(id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            // the process "dies": nothing buffered reaches the store
            drop(self.inner);
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn begin(&self) -> Result<Box<dyn RecordScope>, StoreError> {
        Ok(Box::new(FaultyScope {
            inner: self.inner.begin().await?,
            fail_commit: Arc::clone(&self.fail_commit),
        }))
    }

    async fn get_purchase(&self, id: RecordId) -> Result<CoinPurchase, StoreError> {
        self.inner.get_purchase(id).await
    }

    async fn get_transaction(&self, id: RecordId) -> Result<Transaction, StoreError> {
        self.inner.get_transaction(id).await
    }

    async fn get_settlement(&self, id: RecordId) -> Result<Settlement, StoreError> {
        self.inner.get_settlement(id).await
    }

    async fn find_intent(&self, id: RecordId) -> Result<Option<Intent>, StoreError> {
        self.inner.find_intent(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Intent>, StoreError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn list_purchases_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Paged<CoinPurchase>, StoreError> {
        self.inner.list_purchases_by_user(user, page).await
    }

    async fn list_transactions_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Paged<Transaction>, StoreError> {
        self.inner.list_transactions_by_user(user, page).await
    }

    async fn list_settlements_by_merchant(
        &self,
        merchant: MerchantId,
        page: Page,
    ) -> Result<Paged<Settlement>, StoreError> {
        self.inner.list_settlements_by_merchant(merchant, page).await
    }

    async fn spent_since(&self, user: UserId, since: DateTime<Utc>) -> Result<Coins, StoreError> {
        self.inner.spent_since(user, since).await
    }

    async fn refunded_total(&self, original: RecordId) -> Result<Coins, StoreError> {
        self.inner.refunded_total(original).await
    }

    async fn user_activity(&self, user: UserId) -> Result<UserActivity, StoreError> {
        self.inner.user_activity(user).await
    }

    async fn list_pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Intent>, StoreError> {
        self.inner.list_pending_before(cutoff).await
    }
}

/// A running engine plus direct handles on everything behind it.
pub struct Harness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<MemoryLedger>,
    pub store: MemoryRecordStore,
    pub directory: Arc<MemoryDirectory>,
    gated: Arc<GatedLedger>,
    fail_commit: Arc<AtomicBool>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(noon()));
        let ledger = Arc::new(MemoryLedger::new());
        let gated = Arc::new(GatedLedger {
            inner: Arc::clone(&ledger),
            gate: Mutex::new(None),
            fault: Mutex::new(None),
            cancel_on_post: Mutex::new(None),
        });
        let store = MemoryRecordStore::new(clock.clone(), 8);
        let fail_commit = Arc::new(AtomicBool::new(false));
        let faulty = Arc::new(FaultyStore {
            inner: store.clone(),
            fail_commit: Arc::clone(&fail_commit),
        });
        let directory = Arc::new(MemoryDirectory::new());

        let engine = EngineBuilder::new(config)
            .with_clock(clock.clone())
            .with_ledger(gated.clone())
            .with_store(faulty)
            .with_directory(directory.clone())
            .build()
            .unwrap();
        engine.start().await.unwrap();

        Self {
            engine,
            clock,
            ledger,
            store,
            directory,
            gated,
            fail_commit,
        }
    }

    pub fn service(&self) -> &PaymentService {
        &self.engine.service
    }

    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Hold merchant-payment transfers until `parties` of them are waiting.
    pub fn gate_payments(&self, parties: usize) {
        *self.gated.gate.lock() = Some(Arc::new(Barrier::new(parties)));
    }

    /// Fail the next transfer with `error` before it reaches the ledger.
    pub fn fail_next_post(&self, error: LedgerError) {
        *self.gated.fault.lock() = Some(error);
    }

    /// Cancel `cancel` right after the next transfer has been posted.
    pub fn cancel_after_post(&self, cancel: CancellationToken) {
        *self.gated.cancel_on_post.lock() = Some(cancel);
    }

    pub async fn register(&self, id: u64, name: &str) -> UserId {
        let user = UserId(id);
        self.directory
            .upsert_user(user, name, format!("{}@example.com", name.to_lowercase()));
        self.service()
            .register_user(RegisterUserRequest { user_id: user }, &token())
            .await
            .unwrap();
        user
    }

    pub async fn merchant(&self, id: u64, name: &str, category: &str) -> MerchantId {
        let merchant = MerchantId(id);
        self.directory.upsert_merchant(merchant, name, category);
        self.service()
            .register_merchant(RegisterMerchantRequest { merchant_id: merchant }, &token())
            .await
            .unwrap();
        merchant
    }

    pub async fn top_up(&self, user: UserId, amount: &str) -> CoinPurchaseResponse {
        self.service()
            .initiate_coin_purchase(
                InitiateCoinPurchaseRequest {
                    user_id: user,
                    amount: dec(amount),
                    payment_method: "stripe".to_string(),
                    external_payment_id: None,
                    idempotency_key: None,
                },
                &token(),
            )
            .await
            .unwrap()
    }

    pub fn pay_request(&self, user: UserId, merchant: MerchantId, amount: &str) -> PayToMerchantRequest {
        PayToMerchantRequest {
            user_id: user,
            merchant_id: merchant,
            amount: dec(amount),
            order_id: None,
            idempotency_key: None,
        }
    }

    pub async fn balance(&self, user: UserId) -> Decimal {
        self.service()
            .get_balance(GetBalanceRequest { user_id: user }, &token())
            .await
            .unwrap()
            .balance
    }

    pub async fn merchant_balance(&self, merchant: MerchantId) -> Decimal {
        self.service()
            .get_merchant_balance(GetMerchantBalanceRequest { merchant_id: merchant }, &token())
            .await
            .unwrap()
            .balance
    }

    pub async fn history(&self, user: UserId) -> FinancialHistoryResponse {
        self.service()
            .get_financial_history(
                FinancialHistoryRequest {
                    user_id: user,
                    page: 1,
                    limit: 100,
                    filter: HistoryFilter::All,
                },
                &token(),
            )
            .await
            .unwrap()
    }

    /// Every settled row has exactly one matching ledger transfer, and every
    /// ledger transfer belongs to a settled row.
    pub fn assert_no_phantom_value(&self) {
        let transfers: HashMap<u64, Transfer> = self
            .ledger
            .transfers()
            .into_iter()
            .map(|t| (t.id.tag(), t))
            .collect();
        let mut settled = 0;
        for intent in self.store.all_intents() {
            let posted = transfers.get(&intent.id().0);
            if intent.is_pending() || intent.status() == intent.failed_status() {
                assert!(posted.is_none(), "{} {} has a transfer", intent.entity(), intent.id());
                continue;
            }
            settled += 1;
            let transfer = posted.unwrap_or_else(|| panic!("{} {} has no transfer", intent.entity(), intent.id()));
            assert_eq!(transfer.id, intent.transfer_id());
            assert!(transfer.matches(&intent.transfer_spec()));
        }
        assert_eq!(settled, transfers.len(), "transfers without a settled row");
    }

    /// Sum over every ledger account: only top-ups and settlements change it.
    pub fn ledger_total(&self) -> Coins {
        self.ledger
            .accounts()
            .iter()
            .filter(|a| !a.id.is_system())
            .map(|a| a.balance())
            .sum()
    }
}
