//! JSON-over-HTTP transport
//!
//! Every service method is exposed as `POST /rpc/<method>` taking and returning
//! the method's request and response types as JSON. `GET /health` answers
//! liveness probes.
//!
//! Each request runs under a child of the server's shutdown token, so shutting
//! the server down cancels the requests still in flight.
//!
//! | Error kind           | Status |
//! |----------------------|--------|
//! | `invalid_input`      | 400    |
//! | `not_found`          | 404    |
//! | `insufficient_funds` | 409    |
//! | `policy_rejected`    | 422    |
//! | `transient_failure`  | 503    |
//! | `cancelled`          | 503    |
//! | `inconsistent`       | 500    |

use crate::service::*;
use crate::types::{EngineError, PolicyViolation};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
struct RpcState {
    service: Arc<PaymentService>,
    shutdown: CancellationToken,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<PolicyViolation>,
}

/// An [`EngineError`] on its way to the client.
#[derive(Debug)]
pub struct RpcError(pub EngineError);

impl From<EngineError> for RpcError {
    fn from(error: EngineError) -> Self {
        RpcError(error)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::PolicyRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InsufficientFunds { .. } => StatusCode::CONFLICT,
            EngineError::TransientFailure(_) | EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Inconsistent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(kind = self.0.kind(), error = %self.0, "request failed");
        }

        let body = ErrorResponse {
            kind: self.0.kind(),
            message: self.0.to_string(),
            violation: match self.0 {
                EngineError::PolicyRejected(violation) => Some(violation),
                _ => None,
            },
        };
        (status, Json(body)).into_response()
    }
}

macro_rules! rpc_methods {
    ($($method:ident: $request:ty => $response:ty;)+) => {
        $(
            async fn $method(
                State(state): State<RpcState>,
                Json(request): Json<$request>,
            ) -> Result<Json<$response>, RpcError> {
                let cancel = state.shutdown.child_token();
                Ok(Json(state.service.$method(request, &cancel).await?))
            }
        )+

        fn rpc_routes() -> Router<RpcState> {
            Router::new()
                $(.route(concat!("/rpc/", stringify!($method)), post($method)))+
        }
    };
}

rpc_methods! {
    get_balance: GetBalanceRequest => BalanceResponse;
    initiate_coin_purchase: InitiateCoinPurchaseRequest => CoinPurchaseResponse;
    verify_payment: VerifyPaymentRequest => VerifyPaymentResponse;
    refund_payment: RefundPaymentRequest => RefundPaymentResponse;
    pay_to_merchant: PayToMerchantRequest => PayToMerchantResponse;
    transfer_to_user: TransferToUserRequest => TransferToUserResponse;
    get_payment_history: UserHistoryRequest => PaymentHistoryResponse;
    get_transaction_history: UserHistoryRequest => TransactionHistoryResponse;
    get_financial_history: FinancialHistoryRequest => FinancialHistoryResponse;
    initiate_settlement: InitiateSettlementRequest => InitiateSettlementResponse;
    get_settlements: GetSettlementsRequest => GetSettlementsResponse;
    register_user: RegisterUserRequest => RegisterUserResponse;
    register_merchant: RegisterMerchantRequest => RegisterMerchantResponse;
    grant_referral_rewards: GrantReferralRequest => GrantReferralResponse;
    get_merchant_balance: GetMerchantBalanceRequest => MerchantBalanceResponse;
}

async fn health() -> &'static str {
    "ok"
}

/// Routes for `service`; requests are cancelled when `shutdown` is.
pub fn router(service: Arc<PaymentService>, shutdown: CancellationToken) -> Router {
    rpc_routes()
        .route("/health", get(health))
        .with_state(RpcState { service, shutdown })
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "rpc listener bound");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
