use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::api::error::ApiError;
use crate::api::requests::{DepositRequest, ScheduleWithdrawalRequest, TransactionListQuery};
use crate::api::responses::{
    ApiResponse, HealthResponse, TransactionResponse, WalletMutationResponse, WalletResponse,
};
use crate::api::routes::AppState;
use crate::error::AppError;
use crate::repositories::TransactionRepository;
use crate::services::{WalletService, WithdrawalService};

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let db_healthy = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();

    let limiter_healthy = match &state.redis_client {
        Some(client) => client.get_multiplexed_async_connection().await.is_ok(),
        None => true,
    };

    let response = HealthResponse {
        status: if db_healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        database: db_healthy,
        rate_limiter_backend: limiter_healthy,
    };

    Json(ApiResponse::success(response))
}

/// Prometheus metrics endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    match &state.metrics_handle {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

// ============================================================================
// Wallet handlers
// ============================================================================

/// Create a new wallet with zero balance.
pub async fn create_wallet(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<WalletResponse>>), ApiError> {
    let wallet = WalletService::new(state.pool.clone()).create_wallet().await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(WalletResponse::from(wallet))),
    ))
}

/// Fetch one wallet.
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<i64>,
) -> Result<Json<ApiResponse<WalletResponse>>, ApiError> {
    let wallet = WalletService::new(state.pool.clone())
        .get_wallet(wallet_id)
        .await?;
    Ok(Json(ApiResponse::success(WalletResponse::from(wallet))))
}

/// Credit a wallet synchronously.
pub async fn deposit(
    State(state): State<AppState>,
    Path(wallet_id): Path<i64>,
    Json(request): Json<DepositRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WalletMutationResponse>>), ApiError> {
    let outcome = WalletService::new(state.pool.clone())
        .deposit(wallet_id, request.amount, request.idempotency_key.as_deref())
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(ApiResponse::success(WalletMutationResponse {
            wallet: WalletResponse::from(outcome.wallet),
            transaction: TransactionResponse::from(outcome.transaction),
        })),
    ))
}

/// Schedule a future-dated withdrawal.
pub async fn schedule_withdrawal(
    State(state): State<AppState>,
    Path(wallet_id): Path<i64>,
    Json(request): Json<ScheduleWithdrawalRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WalletMutationResponse>>), ApiError> {
    let outcome = WithdrawalService::new(state.pool.clone())
        .schedule_withdrawal(
            wallet_id,
            request.amount,
            request.execute_at,
            request.idempotency_key.as_deref(),
        )
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(ApiResponse::success(WalletMutationResponse {
            wallet: WalletResponse::from(outcome.wallet),
            transaction: TransactionResponse::from(outcome.transaction),
        })),
    ))
}

// ============================================================================
// Transaction handlers
// ============================================================================

/// List a wallet's transactions, newest first.
pub async fn list_wallet_transactions(
    State(state): State<AppState>,
    Path(wallet_id): Path<i64>,
    Query(query): Query<TransactionListQuery>,
) -> Result<Json<ApiResponse<Vec<TransactionResponse>>>, ApiError> {
    // 404 on unknown wallet rather than an empty list.
    WalletService::new(state.pool.clone())
        .get_wallet(wallet_id)
        .await?;

    let transactions = TransactionRepository::new(state.pool.clone())
        .list_for_wallet(
            wallet_id,
            query.transaction_type,
            query.status,
            query.effective_limit(),
        )
        .await?;

    Ok(Json(ApiResponse::success(
        transactions.into_iter().map(TransactionResponse::from).collect(),
    )))
}

/// Fetch one transaction.
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<i64>,
) -> Result<Json<ApiResponse<TransactionResponse>>, ApiError> {
    let transaction = TransactionRepository::new(state.pool.clone())
        .find_by_id(transaction_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("transaction={transaction_id} does not exist"))
        })?;

    Ok(Json(ApiResponse::success(TransactionResponse::from(
        transaction,
    ))))
}
