use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{TransactionStatus, TransactionType};

/// Request body for a synchronous deposit.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub amount: i64,
    pub idempotency_key: Option<String>,
}

/// Request body for scheduling a withdrawal.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleWithdrawalRequest {
    pub amount: i64,
    pub execute_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

/// Filters for listing a wallet's transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionListQuery {
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub limit: Option<i64>,
}

impl TransactionListQuery {
    const DEFAULT_LIMIT: i64 = 50;
    const MAX_LIMIT: i64 = 500;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}
