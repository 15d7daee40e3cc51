//! Request and response types of the service surface
//!
//! Monetary fields are [`Decimal`]s with two places, serialised as strings.
//! Optional request fields may be omitted from the JSON body.

use crate::types::{
    CoinPurchase, Coins, Counterparty, Direction, EngineError, HistoryEntry, HistoryFilter,
    HistoryItem, MerchantId, Party, PurchaseStatus, RecordId, RecordStatus, ReferralReward,
    RewardKind, RewardStatus, Settlement, SettlementStatus, Transaction, TransactionKind,
    TransactionStatus, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

/// Convert a caller-supplied amount into coins.
///
/// # Errors
///
/// `InvalidInput` if the amount is negative or out of range. Extra decimal
/// places are rounded half-to-even.
pub fn parse_amount(field: &str, value: Decimal) -> Result<Coins, EngineError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(EngineError::invalid_input(format!(
            "{} must not be negative, got {}",
            field, value
        )));
    }
    Coins::from_decimal(value)
        .ok_or_else(|| EngineError::invalid_input(format!("{} is out of range: {}", field, value)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBalanceRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateCoinPurchaseRequest {
    pub user_id: UserId,
    /// Fiat amount, converted 1:1 into coins
    pub amount: Decimal,
    pub payment_method: String,
    #[serde(default)]
    pub external_payment_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinPurchaseResponse {
    pub payment_id: RecordId,
    pub status: PurchaseStatus,
    pub coins_to_receive: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyPaymentRequest {
    pub payment_id: RecordId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    pub status: PurchaseStatus,
    pub coins_added: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPaymentRequest {
    /// Transaction or coin purchase to refund
    pub payment_id: RecordId,
    /// Defaults to everything still refundable
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPaymentResponse {
    pub success: bool,
    pub refund_id: RecordId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayToMerchantRequest {
    pub user_id: UserId,
    pub merchant_id: MerchantId,
    /// Bill total before discount
    pub amount: Decimal,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayToMerchantResponse {
    pub success: bool,
    pub transaction_id: RecordId,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub remaining_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToUserRequest {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToUserResponse {
    pub success: bool,
    pub transaction_id: RecordId,
    pub remaining_balance: Decimal,
}

/// Paged listing of a user's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserHistoryRequest {
    pub user_id: UserId,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseView {
    pub id: RecordId,
    pub amount: Decimal,
    pub coins: Decimal,
    pub payment_method: String,
    pub status: PurchaseStatus,
    pub external_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&CoinPurchase> for PurchaseView {
    fn from(p: &CoinPurchase) -> Self {
        Self {
            id: p.id,
            amount: p.fiat_amount.to_decimal(),
            coins: p.coins.to_decimal(),
            payment_method: p.payment_method.clone(),
            status: p.status,
            external_payment_id: p.external_payment_id.clone(),
            created_at: p.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentHistoryResponse {
    pub purchases: Vec<PurchaseView>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: RecordId,
    pub kind: TransactionKind,
    pub debit: Party,
    pub credit: Party,
    pub original_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub status: TransactionStatus,
    pub refund_of: Option<RecordId>,
    pub order_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            kind: tx.kind,
            debit: tx.debit,
            credit: tx.credit,
            original_amount: tx.original_amount.to_decimal(),
            discount_amount: tx.discount_amount.to_decimal(),
            final_amount: tx.final_amount.to_decimal(),
            status: tx.status,
            refund_of: tx.refund_of,
            order_id: tx.order_id.clone(),
            description: tx.description.clone(),
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHistoryResponse {
    pub transactions: Vec<TransactionView>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialHistoryRequest {
    pub user_id: UserId,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(rename = "type", default)]
    pub filter: HistoryFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryItemView {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub direction: Direction,
    #[serde(flatten)]
    pub entry: HistoryEntry,
    pub amount: Decimal,
    pub coins: Decimal,
    pub description: String,
    pub counterparty: Option<Counterparty>,
    pub status: RecordStatus,
    pub timestamp: DateTime<Utc>,
}

impl From<HistoryItem> for HistoryItemView {
    fn from(item: HistoryItem) -> Self {
        Self {
            id: item.id,
            direction: item.direction,
            entry: item.entry,
            amount: item.amount.to_decimal(),
            coins: item.coins.to_decimal(),
            description: item.description,
            counterparty: item.counterparty,
            status: item.status,
            timestamp: item.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinancialHistoryResponse {
    pub items: Vec<HistoryItemView>,
    pub total_count: u64,
    pub current_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateSettlementRequest {
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateSettlementResponse {
    pub success: bool,
    pub settlement_id: RecordId,
    pub status: SettlementStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSettlementsRequest {
    pub merchant_id: MerchantId,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementView {
    pub id: RecordId,
    pub amount: Decimal,
    pub status: SettlementStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&Settlement> for SettlementView {
    fn from(s: &Settlement) -> Self {
        Self {
            id: s.id,
            amount: s.amount.to_decimal(),
            status: s.status,
            period_start: s.period_start,
            period_end: s.period_end,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSettlementsResponse {
    pub settlements: Vec<SettlementView>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUserResponse {
    pub user_id: UserId,
    /// False when the account already existed
    pub created: bool,
    pub signup_bonus: Decimal,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMerchantRequest {
    pub merchant_id: MerchantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMerchantResponse {
    pub merchant_id: MerchantId,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReferralRequest {
    pub referrer_id: UserId,
    pub referred_id: UserId,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardView {
    pub id: RecordId,
    pub user_id: UserId,
    pub kind: RewardKind,
    pub amount: Decimal,
    pub status: RewardStatus,
}

impl From<&ReferralReward> for RewardView {
    fn from(r: &ReferralReward) -> Self {
        Self {
            id: r.id,
            user_id: r.beneficiary(),
            kind: r.kind,
            amount: r.amount.to_decimal(),
            status: r.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReferralResponse {
    pub rewards: Vec<RewardView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMerchantBalanceRequest {
    pub merchant_id: MerchantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantBalanceResponse {
    pub merchant_id: MerchantId,
    pub balance: Decimal,
}
