//! Service surface
//!
//! One method per operation, each taking a typed request and a request-scoped
//! [`CancellationToken`] and returning a typed response or an [`EngineError`].
//! The service converts decimal amounts into [`Coins`], validates pagination
//! and delegates to the coordinator, the history projector or the record store.
//!
//! The transport in [`crate::rpc`] is a thin JSON binding of this type; tests and
//! embedding processes call it directly.

pub mod builder;
pub mod dto;

pub use builder::{Engine, EngineBuilder};
pub use dto::*;

use crate::core::coordinator::{
    MerchantPaymentRequest, PaymentCoordinator, RefundRequest, SettlementRequest, TopUpRequest,
    UserTransferRequest,
};
use crate::core::history::HistoryProjector;
use crate::core::ledger::AccountCreation;
use crate::core::traits::RecordStore;
use crate::types::{Coins, EngineError, Page, PurchaseStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn page(page: u32, limit: u32) -> Result<Page, EngineError> {
    let requested = Page::new(page, limit);
    if requested.is_valid() {
        Ok(requested)
    } else {
        Err(EngineError::invalid_input(format!(
            "page must be at least 1 and limit between 1 and {}, got page {} limit {}",
            crate::types::MAX_PAGE_LIMIT,
            page,
            limit
        )))
    }
}

fn cancelled(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Protocol-agnostic payment service
pub struct PaymentService {
    coordinator: Arc<PaymentCoordinator>,
    projector: Arc<HistoryProjector>,
    store: Arc<dyn RecordStore>,
}

impl PaymentService {
    pub fn new(
        coordinator: Arc<PaymentCoordinator>,
        projector: Arc<HistoryProjector>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            coordinator,
            projector,
            store,
        }
    }

    pub async fn get_balance(
        &self,
        request: GetBalanceRequest,
        cancel: &CancellationToken,
    ) -> Result<BalanceResponse, EngineError> {
        cancelled(cancel)?;
        let balance = self.coordinator.balance(request.user_id).await?;
        Ok(BalanceResponse {
            user_id: request.user_id,
            balance: balance.to_decimal(),
        })
    }

    /// Buy coins. The top-up is posted immediately, so a successful call returns
    /// status `completed` and the new balance.
    pub async fn initiate_coin_purchase(
        &self,
        request: InitiateCoinPurchaseRequest,
        cancel: &CancellationToken,
    ) -> Result<CoinPurchaseResponse, EngineError> {
        debug!(user_id = %request.user_id, amount = %request.amount, "initiate_coin_purchase");
        let fiat_amount = dto::parse_amount("amount", request.amount)?;
        let receipt = self
            .coordinator
            .top_up(
                TopUpRequest {
                    user: request.user_id,
                    fiat_amount,
                    payment_method: request.payment_method,
                    external_payment_id: request.external_payment_id,
                    idempotency_key: request.idempotency_key,
                },
                cancel,
            )
            .await?;
        Ok(CoinPurchaseResponse {
            payment_id: receipt.purchase.id,
            status: receipt.purchase.status,
            coins_to_receive: receipt.purchase.coins.to_decimal(),
            new_balance: receipt.new_balance.to_decimal(),
        })
    }

    pub async fn verify_payment(
        &self,
        request: VerifyPaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<VerifyPaymentResponse, EngineError> {
        let receipt = self
            .coordinator
            .verify_payment(request.payment_id, cancel)
            .await?;
        let success = receipt.purchase.status == PurchaseStatus::Completed;
        Ok(VerifyPaymentResponse {
            success,
            status: receipt.purchase.status,
            coins_added: if success {
                receipt.purchase.coins.to_decimal()
            } else {
                Coins::ZERO.to_decimal()
            },
            new_balance: receipt.new_balance.to_decimal(),
        })
    }

    pub async fn refund_payment(
        &self,
        request: RefundPaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<RefundPaymentResponse, EngineError> {
        debug!(payment_id = %request.payment_id, "refund_payment");
        let amount = request
            .amount
            .map(|amount| dto::parse_amount("amount", amount))
            .transpose()?;
        let refund = self
            .coordinator
            .refund(
                RefundRequest {
                    original: request.payment_id,
                    amount,
                    idempotency_key: request.idempotency_key,
                },
                cancel,
            )
            .await?;
        Ok(RefundPaymentResponse {
            success: true,
            refund_id: refund.id,
            amount: refund.final_amount.to_decimal(),
        })
    }

    pub async fn pay_to_merchant(
        &self,
        request: PayToMerchantRequest,
        cancel: &CancellationToken,
    ) -> Result<PayToMerchantResponse, EngineError> {
        debug!(user_id = %request.user_id, merchant_id = %request.merchant_id, amount = %request.amount, "pay_to_merchant");
        let original_amount = dto::parse_amount("amount", request.amount)?;
        let receipt = self
            .coordinator
            .pay_to_merchant(
                MerchantPaymentRequest {
                    user: request.user_id,
                    merchant: request.merchant_id,
                    original_amount,
                    order_id: request.order_id,
                    idempotency_key: request.idempotency_key,
                },
                cancel,
            )
            .await?;
        Ok(PayToMerchantResponse {
            success: true,
            transaction_id: receipt.transaction.id,
            discount_amount: receipt.transaction.discount_amount.to_decimal(),
            final_amount: receipt.transaction.final_amount.to_decimal(),
            remaining_balance: receipt.remaining_balance.to_decimal(),
        })
    }

    pub async fn transfer_to_user(
        &self,
        request: TransferToUserRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferToUserResponse, EngineError> {
        debug!(from = %request.from_user_id, to = %request.to_user_id, amount = %request.amount, "transfer_to_user");
        let amount = dto::parse_amount("amount", request.amount)?;
        let receipt = self
            .coordinator
            .transfer_to_user(
                UserTransferRequest {
                    from: request.from_user_id,
                    to: request.to_user_id,
                    amount,
                    description: request.description,
                    idempotency_key: request.idempotency_key,
                },
                cancel,
            )
            .await?;
        Ok(TransferToUserResponse {
            success: true,
            transaction_id: receipt.transaction.id,
            remaining_balance: receipt.remaining_balance.to_decimal(),
        })
    }

    /// A user's coin purchases, newest first.
    pub async fn get_payment_history(
        &self,
        request: UserHistoryRequest,
        cancel: &CancellationToken,
    ) -> Result<PaymentHistoryResponse, EngineError> {
        let page = page(request.page, request.limit)?;
        cancelled(cancel)?;
        let listed = self
            .store
            .list_purchases_by_user(request.user_id, page)
            .await?;
        Ok(PaymentHistoryResponse {
            purchases: listed.items.iter().map(PurchaseView::from).collect(),
            total_count: listed.total_count,
        })
    }

    /// Transactions on either side of which the user appears, newest first.
    pub async fn get_transaction_history(
        &self,
        request: UserHistoryRequest,
        cancel: &CancellationToken,
    ) -> Result<TransactionHistoryResponse, EngineError> {
        let page = page(request.page, request.limit)?;
        cancelled(cancel)?;
        let listed = self
            .store
            .list_transactions_by_user(request.user_id, page)
            .await?;
        Ok(TransactionHistoryResponse {
            transactions: listed.items.iter().map(TransactionView::from).collect(),
            total_count: listed.total_count,
        })
    }

    pub async fn get_financial_history(
        &self,
        request: FinancialHistoryRequest,
        cancel: &CancellationToken,
    ) -> Result<FinancialHistoryResponse, EngineError> {
        let page = page(request.page, request.limit)?;
        let history = self
            .projector
            .financial_history(request.user_id, request.filter, page, cancel)
            .await?;
        Ok(FinancialHistoryResponse {
            items: history.items.into_iter().map(HistoryItemView::from).collect(),
            total_count: history.total_count,
            current_balance: history.current_balance.to_decimal(),
        })
    }

    pub async fn initiate_settlement(
        &self,
        request: InitiateSettlementRequest,
        cancel: &CancellationToken,
    ) -> Result<InitiateSettlementResponse, EngineError> {
        debug!(merchant_id = %request.merchant_id, amount = %request.amount, "initiate_settlement");
        let amount = dto::parse_amount("amount", request.amount)?;
        let settlement = self
            .coordinator
            .settle_merchant(
                SettlementRequest {
                    merchant: request.merchant_id,
                    amount,
                    period_start: request.period_start,
                    period_end: request.period_end,
                    idempotency_key: request.idempotency_key,
                },
                cancel,
            )
            .await?;
        Ok(InitiateSettlementResponse {
            success: true,
            settlement_id: settlement.id,
            status: settlement.status,
        })
    }

    pub async fn get_settlements(
        &self,
        request: GetSettlementsRequest,
        cancel: &CancellationToken,
    ) -> Result<GetSettlementsResponse, EngineError> {
        let page = page(request.page, request.limit)?;
        cancelled(cancel)?;
        let listed = self
            .store
            .list_settlements_by_merchant(request.merchant_id, page)
            .await?;
        Ok(GetSettlementsResponse {
            settlements: listed.items.iter().map(SettlementView::from).collect(),
            total_count: listed.total_count,
        })
    }

    /// Open a customer account and credit the signup bonus once.
    pub async fn register_user(
        &self,
        request: RegisterUserRequest,
        cancel: &CancellationToken,
    ) -> Result<RegisterUserResponse, EngineError> {
        let registration = self
            .coordinator
            .register_user(request.user_id, cancel)
            .await?;
        Ok(RegisterUserResponse {
            user_id: request.user_id,
            created: registration.account == AccountCreation::Created,
            signup_bonus: registration
                .signup_bonus
                .map(|bonus| bonus.coins)
                .unwrap_or(Coins::ZERO)
                .to_decimal(),
            balance: registration.balance.to_decimal(),
        })
    }

    pub async fn register_merchant(
        &self,
        request: RegisterMerchantRequest,
        cancel: &CancellationToken,
    ) -> Result<RegisterMerchantResponse, EngineError> {
        cancelled(cancel)?;
        let account = self
            .coordinator
            .register_merchant(request.merchant_id)
            .await?;
        Ok(RegisterMerchantResponse {
            merchant_id: request.merchant_id,
            created: account == AccountCreation::Created,
        })
    }

    pub async fn grant_referral_rewards(
        &self,
        request: GrantReferralRequest,
        cancel: &CancellationToken,
    ) -> Result<GrantReferralResponse, EngineError> {
        let rewards = self
            .coordinator
            .grant_referral_rewards(
                request.referrer_id,
                request.referred_id,
                request.idempotency_key,
                cancel,
            )
            .await?;
        Ok(GrantReferralResponse {
            rewards: rewards.iter().map(RewardView::from).collect(),
        })
    }

    pub async fn get_merchant_balance(
        &self,
        request: GetMerchantBalanceRequest,
        cancel: &CancellationToken,
    ) -> Result<MerchantBalanceResponse, EngineError> {
        cancelled(cancel)?;
        let balance = self
            .coordinator
            .merchant_balance(request.merchant_id)
            .await?;
        Ok(MerchantBalanceResponse {
            merchant_id: request.merchant_id,
            balance: balance.to_decimal(),
        })
    }
}
