use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Type of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Synchronous credit to a wallet.
    Deposit,
    /// Deferred debit executed against the bank at `execute_at`.
    Withdrawal,
}

/// Status of a transaction in its lifecycle.
///
/// Withdrawals move SCHEDULED -> PROCESSING -> {SUCCEEDED, FAILED, UNKNOWN};
/// UNKNOWN is resolved to a terminal state by reconciliation. Deposits are
/// created directly in SUCCEEDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Scheduled,
    Processing,
    Succeeded,
    Failed,
    /// The bank outcome could not be determined; the debit stands until a
    /// reconciliation task resolves it.
    Unknown,
}

impl TransactionStatus {
    /// Returns true once the transaction can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Succeeded | TransactionStatus::Failed)
    }

    /// Returns true for states the workers still have to act on.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransactionStatus::Processing | TransactionStatus::Unknown)
    }
}

/// A ledger transaction row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub wallet_id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    /// Positive amount in minor units.
    pub amount: i64,
    /// Present iff this is a withdrawal.
    pub execute_at: Option<DateTime<Utc>>,
    /// Globally unique when present; doubles as the bank idempotency key
    /// for withdrawals and as the client dedup key for both types.
    pub idempotency_key: Option<String>,
    pub external_reference: Option<String>,
    pub bank_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A withdrawal qualifies for execution once `execute_at` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.transaction_type == TransactionType::Withdrawal
            && matches!(self.execute_at, Some(at) if at <= now)
    }

    pub fn is_withdrawal(&self) -> bool {
        self.transaction_type == TransactionType::Withdrawal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn withdrawal(status: TransactionStatus, execute_at: DateTime<Utc>) -> Transaction {
        Transaction {
            id: 1,
            wallet_id: 1,
            transaction_type: TransactionType::Withdrawal,
            status,
            amount: 100,
            execute_at: Some(execute_at),
            idempotency_key: None,
            external_reference: None,
            bank_reference: None,
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransactionStatus::Succeeded.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::Scheduled.is_terminal());
        assert!(!TransactionStatus::Processing.is_terminal());
        assert!(!TransactionStatus::Unknown.is_terminal());
    }

    #[test]
    fn transient_statuses() {
        assert!(TransactionStatus::Processing.is_transient());
        assert!(TransactionStatus::Unknown.is_transient());
        assert!(!TransactionStatus::Scheduled.is_transient());
        assert!(!TransactionStatus::Succeeded.is_transient());
    }

    #[test]
    fn due_at_or_before_now() {
        let now = Utc::now();
        assert!(withdrawal(TransactionStatus::Scheduled, now).is_due(now));
        assert!(withdrawal(TransactionStatus::Scheduled, now - Duration::seconds(1)).is_due(now));
        assert!(!withdrawal(TransactionStatus::Scheduled, now + Duration::seconds(1)).is_due(now));
    }

    #[test]
    fn deposit_is_never_due() {
        let now = Utc::now();
        let mut tx = withdrawal(TransactionStatus::Scheduled, now);
        tx.transaction_type = TransactionType::Deposit;
        tx.execute_at = None;
        assert!(!tx.is_due(now));
    }
}
