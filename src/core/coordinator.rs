//! Payment coordinator
//!
//! Joins the ledger (balances) and the record store (intents and history) under
//! one failure model. Every value-moving operation follows the same discipline:
//!
//! ```text
//! 1. resolve inputs, run policy              -> reject without writing
//! 2. begin a record-store scope
//! 3. insert the intent as pending            (written ahead, visible)
//! 4. post the ledger transfer                (id = created_at_ns << 64 | record id)
//! 5. ok                  -> flip to completed, commit
//! 6. insufficient funds
//!    / missing account   -> flip to failed, commit, return the typed error
//! 7. anything else       -> roll back (the pending row disappears); an
//!                           unreachable ledger is a TransientFailure, a
//!                           malformed transfer is InvalidInput
//! 8. commit fails after 5 -> the row stays pending; the reconciler closes it
//! ```
//!
//! Cancellation is honoured before every suspension point up to step 4. Once the
//! transfer has been issued the status flip always runs.
//!
//! Idempotency keys are namespaced per operation and stored on the intent. A
//! retry with a known key returns the prior outcome if the row is terminal and
//! resumes at step 4, with the same transfer id, if it is still pending. A key
//! reused with different parties or amount is rejected as `InvalidInput`.
//! Requests rejected before step 3 write nothing, so their keys stay free.

use crate::core::events::{EventBus, EventOutcome, PaymentEvent};
use crate::core::ledger::{AccountCreation, LedgerAdapter};
use crate::core::policy::{Gate, MerchantCategory, PaymentCheck, Policy};
use crate::core::traits::{Clock, Directory, RecordScope, RecordStore};
use crate::types::{
    AccountId, AdminId, CoinPurchase, Coins, EngineError, FailureReason, Intent, MerchantId, NewIntent,
    NewPurchase, NewReferralReward, NewSettlement, NewTransaction, Party, PolicyViolation,
    PurchaseStatus, RecordId, RecordStatus, ReferralReward, RewardKind, Role, Settlement,
    StoreError, Transaction, TransactionKind, TransactionStatus, UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Payment method recorded on signup-bonus top-ups.
pub const SIGNUP_BONUS_METHOD: &str = "signup_bonus";

/// Buy coins with fiat, credited 1:1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUpRequest {
    pub user: UserId,
    pub fiat_amount: Coins,
    pub payment_method: String,
    pub external_payment_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Pay a merchant bill with coins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantPaymentRequest {
    pub user: UserId,
    pub merchant: MerchantId,
    /// Bill total the discount is computed from
    pub original_amount: Coins,
    pub order_id: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Move coins between two customers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTransferRequest {
    pub from: UserId,
    pub to: UserId,
    pub amount: Coins,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Reverse a transaction (fully or partially) or a coin purchase (fully).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub original: RecordId,
    /// Defaults to everything still refundable
    pub amount: Option<Coins>,
    pub idempotency_key: Option<String>,
}

/// Pay a merchant's accrued coins out to the settlement account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub merchant: MerchantId,
    pub amount: Coins,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

/// Result of a top-up or payment verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub purchase: CoinPurchase,
    pub new_balance: Coins,
}

/// Result of a payment, transfer or refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction: Transaction,
    /// Fresh ledger balance of the paying user
    pub remaining_balance: Coins,
}

/// Result of registering a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub account: AccountCreation,
    pub signup_bonus: Option<CoinPurchase>,
    pub balance: Coins,
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

fn namespaced(prefix: &str, key: Option<String>) -> Option<String> {
    key.map(|key| format!("{}:{}", prefix, key))
}

fn key_mismatch(intent: &Intent) -> EngineError {
    EngineError::invalid_input(format!(
        "idempotency key belongs to {} {}",
        intent.entity(),
        intent.id()
    ))
}

fn reused_key(prior: &Intent) -> EngineError {
    EngineError::invalid_input(format!(
        "idempotency key of {} {} was used for a different request",
        prior.entity(),
        prior.id()
    ))
}

/// Reject a keyed retry whose body does not describe the stored row.
fn ensure_same_request(prior: &Intent, same: bool) -> Result<(), EngineError> {
    if same {
        Ok(())
    } else {
        Err(reused_key(prior))
    }
}

/// Whether `prior` was written for the same request as `new`: same kind,
/// parties and amount.
fn same_request(prior: &Intent, new: &NewIntent) -> bool {
    match (prior, new) {
        (Intent::Purchase(row), NewIntent::Purchase(new)) => {
            row.user_id == new.user_id && row.fiat_amount == new.fiat_amount && row.coins == new.coins
        }
        (Intent::Transaction(row), NewIntent::Transaction(new)) => {
            row.kind == new.kind
                && row.debit == new.debit
                && row.credit == new.credit
                && row.original_amount == new.original_amount
                && row.refund_of == new.refund_of
        }
        (Intent::Settlement(row), NewIntent::Settlement(new)) => {
            row.merchant_id == new.merchant_id && row.amount == new.amount
        }
        (Intent::Reward(row), NewIntent::Reward(new)) => {
            row.referrer_id == new.referrer_id
                && row.referred_id == new.referred_id
                && row.kind == new.kind
        }
        _ => false,
    }
}

/// Buffer the status changes that complete `intent`: the intent itself and,
/// for refunds, the row being refunded.
pub(crate) async fn stage_completion(
    scope: &mut dyn RecordScope,
    intent: &Intent,
) -> Result<(), StoreError> {
    scope
        .update_status(intent.id(), intent.completed_status())
        .await?;

    let Intent::Transaction(tx) = intent else {
        return Ok(());
    };
    let (TransactionKind::Refund, Some(original)) = (tx.kind, tx.refund_of) else {
        return Ok(());
    };
    match scope.get_intent(original).await? {
        Some(Intent::Purchase(_)) => {
            scope
                .update_status(original, RecordStatus::Purchase(PurchaseStatus::Refunded))
                .await
        }
        Some(Intent::Transaction(_)) => scope.mark_reversed(original).await,
        _ => Err(StoreError::NotFound {
            entity: "record",
            id: original,
        }),
    }
}

/// Orchestrates ledger, record store and policy into value-moving operations.
pub struct PaymentCoordinator {
    ledger: LedgerAdapter,
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn Directory>,
    policy: Policy,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for PaymentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentCoordinator")
            .field("ledger", &self.ledger)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PaymentCoordinator {
    pub fn new(
        ledger: LedgerAdapter,
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn Directory>,
        policy: Policy,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            ledger,
            store,
            directory,
            policy,
            clock,
            events,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Create the system and settlement accounts. Safe to call on every start.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        self.ledger.create(AccountId::SYSTEM, Role::System).await?;
        self.ledger.create(AccountId::SETTLEMENT, Role::System).await?;
        info!("system accounts ready");
        Ok(())
    }

    /// Create a customer's account and credit the signup bonus.
    ///
    /// Both steps are idempotent: registering the same user twice credits the
    /// bonus once.
    pub async fn register_user(
        &self,
        user: UserId,
        cancel: &CancellationToken,
    ) -> Result<Registration, EngineError> {
        checkpoint(cancel)?;
        let account = self.ledger.create_account(user.0, Role::Customer).await?;
        info!(user_id = %user, ?account, "customer account");

        let signup_bonus = if self.policy.signup_bonus.is_positive() {
            let new = NewIntent::Purchase(NewPurchase {
                user_id: user,
                fiat_amount: Coins::ZERO,
                coins: self.policy.signup_bonus,
                payment_method: SIGNUP_BONUS_METHOD.to_string(),
                external_payment_id: None,
                idempotency_key: Some(format!("signup:{}", user)),
            });
            match self.execute(new, cancel).await? {
                Intent::Purchase(purchase) => Some(purchase),
                other => return Err(key_mismatch(&other)),
            }
        } else {
            None
        };

        Ok(Registration {
            account,
            signup_bonus,
            balance: self.balance(user).await?,
        })
    }

    pub async fn register_merchant(&self, merchant: MerchantId) -> Result<AccountCreation, EngineError> {
        let account = self.ledger.create_account(merchant.0, Role::Merchant).await?;
        info!(merchant_id = %merchant, ?account, "merchant account");
        Ok(account)
    }

    pub async fn register_admin(&self, admin: AdminId) -> Result<AccountCreation, EngineError> {
        Ok(self.ledger.create_account(admin.0, Role::Admin).await?)
    }

    /// Ledger balance of a customer.
    pub async fn balance(&self, user: UserId) -> Result<Coins, EngineError> {
        Ok(self.ledger.balance(AccountId::for_user(user)).await?)
    }

    /// Ledger balance of a merchant.
    pub async fn merchant_balance(&self, merchant: MerchantId) -> Result<Coins, EngineError> {
        Ok(self.ledger.balance(AccountId::for_merchant(merchant)).await?)
    }

    /// Buy coins: SYSTEM -> user, recorded as a coin purchase.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` - empty payment method
    /// * `PolicyRejected(MinPurchase)` - amount below the minimum purchase
    /// * `NotFound` - the user has no account (the purchase is recorded as failed)
    /// * `TransientFailure` - ledger or store unavailable
    pub async fn top_up(
        &self,
        request: TopUpRequest,
        cancel: &CancellationToken,
    ) -> Result<PurchaseReceipt, EngineError> {
        let key = namespaced("topup", request.idempotency_key);
        let intent = match self.prior(key.as_deref(), cancel).await? {
            Some(prior) => {
                let same = matches!(&prior, Intent::Purchase(p)
                    if p.user_id == request.user && p.fiat_amount == request.fiat_amount);
                ensure_same_request(&prior, same)?;
                self.replay(prior, cancel).await?
            }
            None => {
                if request.payment_method.trim().is_empty() {
                    return Err(EngineError::invalid_input("payment method is required"));
                }
                if request.fiat_amount < self.policy.min_purchase {
                    return Err(EngineError::PolicyRejected(PolicyViolation::MinPurchase));
                }
                let new = NewIntent::Purchase(NewPurchase {
                    user_id: request.user,
                    fiat_amount: request.fiat_amount,
                    coins: request.fiat_amount,
                    payment_method: request.payment_method,
                    external_payment_id: request.external_payment_id,
                    idempotency_key: key,
                });
                self.execute(new, cancel).await?
            }
        };

        let Intent::Purchase(purchase) = intent else {
            return Err(key_mismatch(&intent));
        };
        let new_balance = self.balance(purchase.user_id).await?;
        Ok(PurchaseReceipt {
            purchase,
            new_balance,
        })
    }

    /// Report a coin purchase's outcome, resuming it first if it is still
    /// pending.
    pub async fn verify_payment(
        &self,
        purchase_id: RecordId,
        cancel: &CancellationToken,
    ) -> Result<PurchaseReceipt, EngineError> {
        checkpoint(cancel)?;
        let mut purchase = self.store.get_purchase(purchase_id).await?;

        if purchase.status == PurchaseStatus::Pending {
            match self.replay(Intent::Purchase(purchase.clone()), cancel).await {
                Ok(Intent::Purchase(resumed)) => purchase = resumed,
                Ok(other) => return Err(key_mismatch(&other)),
                Err(e) if e.is_retryable() => return Err(e),
                Err(_) => purchase = self.store.get_purchase(purchase_id).await?,
            }
        }

        let new_balance = self.balance(purchase.user_id).await?;
        Ok(PurchaseReceipt {
            purchase,
            new_balance,
        })
    }

    /// Pay a merchant: the policy prices the bill, the user pays the discount
    /// value in coins, the merchant is credited.
    ///
    /// The balance read feeding the policy is advisory. Two concurrent payments
    /// can both pass it; the ledger then accepts one and rejects the other with
    /// `InsufficientFunds`, which is recorded as a failed transaction.
    pub async fn pay_to_merchant(
        &self,
        request: MerchantPaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<TransactionReceipt, EngineError> {
        let key = namespaced("pay", request.idempotency_key);
        if let Some(prior) = self.prior(key.as_deref(), cancel).await? {
            let same = matches!(&prior, Intent::Transaction(tx)
                if tx.kind == TransactionKind::MerchantPayment
                    && tx.debit == Party::User(request.user)
                    && tx.credit == Party::Merchant(request.merchant)
                    && tx.original_amount == request.original_amount);
            ensure_same_request(&prior, same)?;
            let intent = self.replay(prior, cancel).await?;
            return self.transaction_receipt(intent, request.user).await;
        }

        checkpoint(cancel)?;
        let merchant = self
            .directory
            .merchant(request.merchant)
            .await?
            .ok_or_else(|| EngineError::not_found("merchant", request.merchant))?;
        let category = MerchantCategory::parse(&merchant.category);

        checkpoint(cancel)?;
        let balance = self.balance(request.user).await?;

        checkpoint(cancel)?;
        let now = self.clock.now();
        let day_spent = self
            .store
            .spent_since(request.user, self.policy.day_window_start(now))
            .await?;
        checkpoint(cancel)?;
        let month_spent = self
            .store
            .spent_since(request.user, self.policy.month_window_start(now))
            .await?;

        let input = PaymentCheck {
            original: request.original_amount,
            category,
            balance,
            day_spent,
            month_spent,
            now,
        };
        for gate in Gate::ALL {
            checkpoint(cancel)?;
            if let Err(violation) = self.policy.check(gate, &input) {
                info!(
                    user_id = %request.user,
                    merchant_id = %request.merchant,
                    amount = %request.original_amount,
                    ?violation,
                    "payment rejected by policy"
                );
                return Err(EngineError::PolicyRejected(violation));
            }
        }

        let category = category.ok_or(EngineError::PolicyRejected(PolicyViolation::UnknownCategory))?;
        let quote = self.policy.quote(request.original_amount, category);
        if !quote.coins_required.is_positive() {
            return Err(EngineError::invalid_input(format!(
                "a {} payment of {} carries no coins",
                category, request.original_amount
            )));
        }

        let new = NewIntent::Transaction(NewTransaction {
            debit: Party::User(request.user),
            credit: Party::Merchant(request.merchant),
            kind: TransactionKind::MerchantPayment,
            original_amount: request.original_amount,
            discount_amount: quote.discount_amount,
            final_amount: quote.coins_required,
            refund_of: None,
            order_id: request.order_id,
            description: Some(format!("Payment to {}", merchant.name)),
            idempotency_key: key,
        });
        let intent = self.execute(new, cancel).await?;
        self.transaction_receipt(intent, request.user).await
    }

    /// Move coins from one customer to another.
    pub async fn transfer_to_user(
        &self,
        request: UserTransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransactionReceipt, EngineError> {
        let key = namespaced("transfer", request.idempotency_key);
        if let Some(prior) = self.prior(key.as_deref(), cancel).await? {
            let same = matches!(&prior, Intent::Transaction(tx)
                if tx.kind == TransactionKind::UserTransfer
                    && tx.debit == Party::User(request.from)
                    && tx.credit == Party::User(request.to)
                    && tx.final_amount == request.amount);
            ensure_same_request(&prior, same)?;
            let intent = self.replay(prior, cancel).await?;
            return self.transaction_receipt(intent, request.from).await;
        }

        if request.from == request.to {
            return Err(EngineError::invalid_input("cannot transfer coins to yourself"));
        }
        if !request.amount.is_positive() {
            return Err(EngineError::invalid_input(format!(
                "transfer amount must be positive, got {}",
                request.amount
            )));
        }

        checkpoint(cancel)?;
        let balance = self.balance(request.from).await?;
        if balance < request.amount {
            return Err(EngineError::InsufficientFunds {
                account: AccountId::for_user(request.from),
            });
        }
        checkpoint(cancel)?;
        // the recipient must exist before anything is written
        self.balance(request.to).await?;

        let new = NewIntent::Transaction(NewTransaction {
            debit: Party::User(request.from),
            credit: Party::User(request.to),
            kind: TransactionKind::UserTransfer,
            original_amount: request.amount,
            discount_amount: Coins::ZERO,
            final_amount: request.amount,
            refund_of: None,
            order_id: None,
            description: request.description,
            idempotency_key: key,
        });
        let intent = self.execute(new, cancel).await?;
        self.transaction_receipt(intent, request.from).await
    }

    /// Reverse value: a transaction's credit side pays its debit side back, or a
    /// coin purchase's coins return to the system account.
    ///
    /// Partial refunds of a transaction accumulate; the original is
    /// `partially_reversed` until the refunds cover its full amount, then
    /// `reversed`. Coin purchases can only be refunded in full.
    pub async fn refund(
        &self,
        request: RefundRequest,
        cancel: &CancellationToken,
    ) -> Result<Transaction, EngineError> {
        let key = namespaced("refund", request.idempotency_key);
        if let Some(prior) = self.prior(key.as_deref(), cancel).await? {
            // without an amount the retry asks for whatever the first request took
            let same = matches!(&prior, Intent::Transaction(tx)
                if tx.kind == TransactionKind::Refund
                    && tx.refund_of == Some(request.original)
                    && request.amount.map_or(true, |amount| amount == tx.final_amount));
            ensure_same_request(&prior, same)?;
            return match self.replay(prior, cancel).await? {
                Intent::Transaction(refund) => Ok(refund),
                other => Err(key_mismatch(&other)),
            };
        }

        checkpoint(cancel)?;
        let original = self
            .store
            .find_intent(request.original)
            .await?
            .ok_or_else(|| EngineError::not_found("transaction", request.original))?;

        let new = match original {
            Intent::Transaction(tx) => {
                if tx.kind == TransactionKind::Refund {
                    return Err(EngineError::invalid_input("a refund cannot be refunded"));
                }
                if !matches!(
                    tx.status,
                    TransactionStatus::Completed | TransactionStatus::PartiallyReversed
                ) {
                    return Err(EngineError::invalid_input(format!(
                        "transaction {} is {} and cannot be refunded",
                        tx.id, tx.status
                    )));
                }
                checkpoint(cancel)?;
                let remaining = tx.final_amount - self.store.refunded_total(tx.id).await?;
                let amount = request.amount.unwrap_or(remaining);
                if !amount.is_positive() || amount > remaining {
                    return Err(EngineError::invalid_input(format!(
                        "refund amount {} must be positive and at most {}",
                        amount, remaining
                    )));
                }
                NewTransaction {
                    debit: tx.credit,
                    credit: tx.debit,
                    kind: TransactionKind::Refund,
                    original_amount: amount,
                    discount_amount: Coins::ZERO,
                    final_amount: amount,
                    refund_of: Some(tx.id),
                    order_id: tx.order_id,
                    description: Some(format!("Refund of transaction {}", tx.id)),
                    idempotency_key: key,
                }
            }
            Intent::Purchase(purchase) => {
                if purchase.status != PurchaseStatus::Completed {
                    return Err(EngineError::invalid_input(format!(
                        "coin purchase {} is {} and cannot be refunded",
                        purchase.id, purchase.status
                    )));
                }
                let amount = request.amount.unwrap_or(purchase.coins);
                if amount != purchase.coins {
                    return Err(EngineError::invalid_input(format!(
                        "coin purchases are refunded in full ({})",
                        purchase.coins
                    )));
                }
                NewTransaction {
                    debit: Party::User(purchase.user_id),
                    credit: Party::System,
                    kind: TransactionKind::Refund,
                    original_amount: purchase.fiat_amount,
                    discount_amount: Coins::ZERO,
                    final_amount: purchase.coins,
                    refund_of: Some(purchase.id),
                    order_id: purchase.external_payment_id,
                    description: Some(format!("Refund of coin purchase {}", purchase.id)),
                    idempotency_key: key,
                }
            }
            other => {
                return Err(EngineError::invalid_input(format!(
                    "{} {} cannot be refunded",
                    other.entity(),
                    other.id()
                )))
            }
        };

        match self.execute(NewIntent::Transaction(new), cancel).await? {
            Intent::Transaction(refund) => Ok(refund),
            other => Err(key_mismatch(&other)),
        }
    }

    /// Drain a merchant's coins to the settlement account.
    pub async fn settle_merchant(
        &self,
        request: SettlementRequest,
        cancel: &CancellationToken,
    ) -> Result<Settlement, EngineError> {
        let key = namespaced("settle", request.idempotency_key);
        let intent = match self.prior(key.as_deref(), cancel).await? {
            Some(prior) => {
                let same = matches!(&prior, Intent::Settlement(row)
                    if row.merchant_id == request.merchant && row.amount == request.amount);
                ensure_same_request(&prior, same)?;
                self.replay(prior, cancel).await?
            }
            None => {
                if request.period_start >= request.period_end {
                    return Err(EngineError::invalid_input(
                        "settlement period must start before it ends",
                    ));
                }
                if !request.amount.is_positive() {
                    return Err(EngineError::invalid_input(format!(
                        "settlement amount must be positive, got {}",
                        request.amount
                    )));
                }
                let new = NewIntent::Settlement(NewSettlement {
                    merchant_id: request.merchant,
                    amount: request.amount,
                    period_start: request.period_start,
                    period_end: request.period_end,
                    idempotency_key: key,
                });
                self.execute(new, cancel).await?
            }
        };

        match intent {
            Intent::Settlement(settlement) => Ok(settlement),
            other => Err(key_mismatch(&other)),
        }
    }

    /// Credit both sides of a referral from the system account.
    ///
    /// Without a caller key, the pair itself is the key: a referral pays out once.
    pub async fn grant_referral_rewards(
        &self,
        referrer: UserId,
        referred: UserId,
        idempotency_key: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReferralReward>, EngineError> {
        if referrer == referred {
            return Err(EngineError::invalid_input("a user cannot refer themselves"));
        }
        let base = namespaced("referral", idempotency_key)
            .unwrap_or_else(|| format!("referral:{}:{}", referrer, referred));

        let mut rewards = Vec::with_capacity(2);
        for (kind, amount) in [
            (RewardKind::Referrer, self.policy.referrer_bonus),
            (RewardKind::Referee, self.policy.referee_bonus),
        ] {
            if !amount.is_positive() {
                continue;
            }
            let key = format!("{}:{}", base, kind);
            let intent = match self.prior(Some(&key), cancel).await? {
                Some(prior) => {
                    let same = matches!(&prior, Intent::Reward(row)
                        if row.referrer_id == referrer && row.referred_id == referred);
                    ensure_same_request(&prior, same)?;
                    self.replay(prior, cancel).await?
                }
                None => {
                    let new = NewIntent::Reward(NewReferralReward {
                        referrer_id: referrer,
                        referred_id: referred,
                        amount,
                        kind,
                        idempotency_key: Some(key),
                    });
                    self.execute(new, cancel).await?
                }
            };
            match intent {
                Intent::Reward(reward) => rewards.push(reward),
                other => return Err(key_mismatch(&other)),
            }
        }
        Ok(rewards)
    }

    async fn transaction_receipt(
        &self,
        intent: Intent,
        payer: UserId,
    ) -> Result<TransactionReceipt, EngineError> {
        let Intent::Transaction(transaction) = intent else {
            return Err(key_mismatch(&intent));
        };
        let remaining_balance = self.balance(payer).await?;
        Ok(TransactionReceipt {
            transaction,
            remaining_balance,
        })
    }

    async fn prior(
        &self,
        key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Intent>, EngineError> {
        let Some(key) = key else {
            return Ok(None);
        };
        checkpoint(cancel)?;
        Ok(self.store.find_by_idempotency_key(key).await?)
    }

    /// Outcome of an intent found under an idempotency key.
    async fn replay(&self, prior: Intent, cancel: &CancellationToken) -> Result<Intent, EngineError> {
        let key = prior.idempotency_key().unwrap_or_default().to_string();

        if prior.is_pending() {
            info!(record_id = %prior.id(), key = %key, "resuming pending intent");
            checkpoint(cancel)?;
            let scope = self.store.begin().await?;
            if cancel.is_cancelled() {
                scope.rollback().await?;
                return Err(EngineError::Cancelled);
            }
            return self.settle(scope, prior).await;
        }

        debug!(record_id = %prior.id(), key = %key, status = %prior.status(), "duplicate request, returning prior outcome");
        if prior.status() == prior.failed_status() {
            let reason = prior.failure().unwrap_or(FailureReason::NotPosted);
            return Err(EngineError::from_failure(reason, &prior));
        }
        Ok(prior)
    }

    /// Steps 2 to 8 for a new intent.
    async fn execute(&self, new: NewIntent, cancel: &CancellationToken) -> Result<Intent, EngineError> {
        checkpoint(cancel)?;
        let mut scope = self.store.begin().await?;
        if cancel.is_cancelled() {
            scope.rollback().await?;
            return Err(EngineError::Cancelled);
        }

        let keyed = new.idempotency_key().is_some().then(|| new.clone());
        let intent = match scope.insert_pending(new).await {
            Ok(intent) => intent,
            Err(StoreError::DuplicateKey(key)) => {
                // a request with the same key got there first
                scope.rollback().await?;
                let prior = self
                    .store
                    .find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| EngineError::transient(format!("intent for key {} vanished", key)))?;
                if !keyed.is_some_and(|new| same_request(&prior, &new)) {
                    return Err(reused_key(&prior));
                }
                return self.replay(prior, cancel).await;
            }
            Err(e) => {
                if let Err(rollback) = scope.rollback().await {
                    warn!(error = %rollback, "rollback after failed insert");
                }
                return Err(e.into());
            }
        };

        if cancel.is_cancelled() {
            scope.rollback().await?;
            return Err(EngineError::Cancelled);
        }
        self.settle(scope, intent).await
    }

    /// Steps 4 to 8: post the transfer and flip the intent.
    async fn settle(
        &self,
        mut scope: Box<dyn RecordScope>,
        intent: Intent,
    ) -> Result<Intent, EngineError> {
        let spec = intent.transfer_spec();
        let transfer_id = intent.transfer_id();

        match self.ledger.post_transfer(transfer_id, spec).await {
            Ok(_) => {
                let flipped = match stage_completion(scope.as_mut(), &intent).await {
                    Ok(()) => scope.commit().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = flipped {
                    warn!(
                        record_id = %intent.id(),
                        transfer_id = %transfer_id,
                        error = %e,
                        "transfer posted but status flip failed, left pending for the reconciler"
                    );
                    return Err(EngineError::transient(format!(
                        "{} {} is posted but not yet recorded as completed",
                        intent.entity(),
                        intent.id()
                    )));
                }

                info!(
                    record_id = %intent.id(),
                    transfer_id = %transfer_id,
                    op = %spec.op,
                    amount = %spec.amount,
                    "intent completed"
                );
                self.publish(&intent, EventOutcome::Completed);
                let completed = intent.completed_status();
                Ok(intent.with_status(completed, None).unwrap_or(intent))
            }
            Err(ledger_error) => match ledger_error.failure_reason() {
                Some(reason) => {
                    let marked = match scope.mark_failed(intent.id(), reason).await {
                        Ok(()) => scope.commit().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = marked {
                        warn!(
                            record_id = %intent.id(),
                            error = %e,
                            "could not record failed intent, left pending for the reconciler"
                        );
                    }
                    info!(
                        record_id = %intent.id(),
                        op = %spec.op,
                        reason = %reason,
                        "intent rejected by ledger"
                    );
                    self.publish(&intent, EventOutcome::Failed);
                    Err(ledger_error.into())
                }
                None => {
                    if let Err(e) = scope.rollback().await {
                        warn!(record_id = %intent.id(), error = %e, "rollback failed");
                    }
                    warn!(record_id = %intent.id(), error = %ledger_error, "ledger call failed, intent rolled back");
                    Err(ledger_error.into())
                }
            },
        }
    }

    fn publish(&self, intent: &Intent, outcome: EventOutcome) {
        let spec = intent.transfer_spec();
        self.events.publish(PaymentEvent {
            record_id: intent.id(),
            op: spec.op,
            debit: spec.debit,
            credit: spec.credit,
            amount: spec.amount,
            outcome,
        });
    }
}
