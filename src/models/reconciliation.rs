use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reconciliation_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Pending,
    Resolved,
}

/// One-to-one companion of a withdrawal whose bank outcome is ambiguous.
/// Created when a transfer classifies as UNKNOWN or when a PROCESSING row
/// times out; resolved by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationTask {
    pub id: i64,
    pub transaction_id: i64,
    pub reason: String,
    pub status: ReconciliationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationTask {
    pub fn is_pending(&self) -> bool {
        self.status == ReconciliationStatus::Pending
    }
}
