use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Transaction, Wallet};

/// Standard response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub id: i64,
    pub uuid: uuid::Uuid,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Wallet> for WalletResponse {
    fn from(wallet: Wallet) -> Self {
        Self {
            id: wallet.id,
            uuid: wallet.uuid,
            balance: wallet.balance,
            created_at: wallet.created_at,
            updated_at: wallet.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: i64,
    pub wallet_id: i64,
    #[serde(rename = "type")]
    pub transaction_type: crate::models::TransactionType,
    pub status: crate::models::TransactionStatus,
    pub amount: i64,
    pub execute_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub external_reference: Option<String>,
    pub bank_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            id: tx.id,
            wallet_id: tx.wallet_id,
            transaction_type: tx.transaction_type,
            status: tx.status,
            amount: tx.amount,
            execute_at: tx.execute_at,
            idempotency_key: tx.idempotency_key,
            external_reference: tx.external_reference,
            bank_reference: tx.bank_reference,
            failure_reason: tx.failure_reason,
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

/// Wallet plus the transaction a mutation produced.
#[derive(Debug, Serialize)]
pub struct WalletMutationResponse {
    pub wallet: WalletResponse,
    pub transaction: TransactionResponse,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub database: bool,
    pub rate_limiter_backend: bool,
}
