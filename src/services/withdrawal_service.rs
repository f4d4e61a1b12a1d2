use chrono::{DateTime, DurationRound, Utc};
use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::gateway::TransferGateway;
use crate::idempotency;
use crate::models::{Transaction, TransactionStatus, TransactionType, Wallet};
use crate::repositories::{
    transaction_repository, wallet_repository, TransactionRepository, WalletRepository,
};
use crate::services::wallet_service::validate_positive_amount;
use crate::workers::executor::{self, ClaimedWithdrawal, FinalizeOutcome};

const SCHEDULE_KEY_ATTEMPTS: u32 = 3;

/// Result of scheduling a withdrawal.
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub wallet: Wallet,
    pub transaction: Transaction,
    pub created: bool,
}

/// Service for deferred withdrawals: scheduling and direct execution.
pub struct WithdrawalService {
    pool: PgPool,
}

impl WithdrawalService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a SCHEDULED withdrawal. Funds are not reserved; the balance
    /// check happens at claim time. Scheduling requires a strictly future
    /// `execute_at` even though execution treats `execute_at <= now` as due.
    pub async fn schedule_withdrawal(
        &self,
        wallet_id: i64,
        amount: i64,
        execute_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> Result<ScheduleOutcome> {
        validate_positive_amount(amount)?;
        validate_future_execute_at(execute_at, Utc::now())?;
        // The store keeps microsecond precision; truncate up front so a
        // replayed request compares equal to what was persisted.
        let execute_at = execute_at
            .duration_trunc(chrono::Duration::microseconds(1))
            .unwrap_or(execute_at);

        let wallet = WalletRepository::new(self.pool.clone())
            .find_by_id(wallet_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("wallet={wallet_id} does not exist")))?;

        let mut uow = self.pool.begin().await.map_err(AppError::Database)?;

        let (transaction, created) = match idempotency_key {
            None => {
                // No client key: pre-assign the bank idempotency key so the
                // row is retry-safe from the first claim onward.
                let tx = insert_scheduled_with_fresh_key(&mut uow, wallet.id, amount, execute_at)
                    .await?;
                (tx, true)
            }
            Some(key) => {
                let key = idempotency::normalize_client_key(key)?;
                match transaction_repository::find_by_key(&mut uow, &key).await? {
                    Some(existing) => {
                        check_withdrawal_payload(&existing, wallet.id, amount, execute_at)?;
                        (existing, false)
                    }
                    None => {
                        let inserted = transaction_repository::insert_if_key_free(
                            &mut uow,
                            transaction_repository::NewTransaction {
                                wallet_id: wallet.id,
                                transaction_type: TransactionType::Withdrawal,
                                status: TransactionStatus::Scheduled,
                                amount,
                                execute_at: Some(execute_at),
                                idempotency_key: Some(&key),
                            },
                        )
                        .await?;
                        match inserted {
                            Some(tx) => (tx, true),
                            None => {
                                let existing = transaction_repository::find_by_key(&mut uow, &key)
                                    .await?
                                    .ok_or_else(|| {
                                        AppError::Internal(
                                            "idempotency key vanished during dedup".to_string(),
                                        )
                                    })?;
                                check_withdrawal_payload(&existing, wallet.id, amount, execute_at)?;
                                (existing, false)
                            }
                        }
                    }
                }
            }
        };

        uow.commit().await.map_err(AppError::Database)?;

        tracing::info!(
            event = "withdrawal_scheduled",
            wallet_id = wallet.id,
            transaction_id = transaction.id,
            amount,
            execute_at = %execute_at,
            created,
            "withdrawal scheduled"
        );

        Ok(ScheduleOutcome {
            wallet,
            transaction,
            created,
        })
    }

    /// Executes one specific due withdrawal: claim, bank call, finalize.
    /// Precondition violations (wrong type, wrong status, not yet due)
    /// surface as `InvalidTransactionState`.
    pub async fn execute_withdrawal(
        &self,
        transaction_id: i64,
        gateway: &dyn TransferGateway,
    ) -> Result<Transaction> {
        let now = Utc::now();
        let mut uow = self.pool.begin().await.map_err(AppError::Database)?;

        let tx = transaction_repository::lock(&mut uow, transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::InvalidTransactionState(format!(
                    "transaction={transaction_id} does not exist"
                ))
            })?;

        if !tx.is_withdrawal() {
            return Err(AppError::InvalidTransactionState(
                "only withdrawal transactions can be executed".to_string(),
            ));
        }
        if tx.status != TransactionStatus::Scheduled {
            return Err(AppError::InvalidTransactionState(format!(
                "transaction status must be SCHEDULED, got={:?}",
                tx.status
            )));
        }
        if matches!(tx.execute_at, Some(at) if at > now) {
            return Err(AppError::InvalidTransactionState(
                "transaction execute_at is in the future and cannot be executed yet".to_string(),
            ));
        }

        let wallet = wallet_repository::lock(&mut uow, tx.wallet_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("wallet={} does not exist", tx.wallet_id))
            })?;

        if !wallet_repository::try_debit(&mut uow, wallet.id, tx.amount).await? {
            transaction_repository::mark_failed(&mut uow, tx.id, "INSUFFICIENT_FUNDS").await?;
            uow.commit().await.map_err(AppError::Database)?;
            return self.refetch(transaction_id).await;
        }

        let key = idempotency::ensure_withdrawal_key(&mut uow, &tx).await?;
        transaction_repository::mark_processing(&mut uow, tx.id).await?;
        uow.commit().await.map_err(AppError::Database)?;

        let claim = ClaimedWithdrawal {
            transaction_id: tx.id,
            wallet_owner_ref: wallet.uuid,
            amount: tx.amount,
            idempotency_key: key,
        };

        let result = executor::call_gateway(gateway, &claim).await;
        let outcome = executor::finalize_claimed_withdrawal(&self.pool, &claim, &result).await?;

        if outcome == FinalizeOutcome::Skipped {
            return Err(AppError::InvalidTransactionState(format!(
                "transaction={transaction_id} was finalized concurrently"
            )));
        }

        self.refetch(transaction_id).await
    }

    async fn refetch(&self, transaction_id: i64) -> Result<Transaction> {
        TransactionRepository::new(self.pool.clone())
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!("transaction={transaction_id} vanished"))
            })
    }
}

async fn insert_scheduled_with_fresh_key(
    conn: &mut sqlx::PgConnection,
    wallet_id: i64,
    amount: i64,
    execute_at: DateTime<Utc>,
) -> Result<Transaction> {
    for _ in 0..SCHEDULE_KEY_ATTEMPTS {
        let key = idempotency::generate_key();
        let inserted = transaction_repository::insert_if_key_free(
            conn,
            transaction_repository::NewTransaction {
                wallet_id,
                transaction_type: TransactionType::Withdrawal,
                status: TransactionStatus::Scheduled,
                amount,
                execute_at: Some(execute_at),
                idempotency_key: Some(&key),
            },
        )
        .await?;
        if let Some(tx) = inserted {
            return Ok(tx);
        }
    }
    Err(AppError::Internal(
        "failed to generate a unique idempotency key".to_string(),
    ))
}

pub(crate) fn validate_future_execute_at(execute_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if execute_at <= now {
        return Err(AppError::Validation(
            "execute_at must be in the future".to_string(),
        ));
    }
    Ok(())
}

fn check_withdrawal_payload(
    existing: &Transaction,
    wallet_id: i64,
    amount: i64,
    execute_at: DateTime<Utc>,
) -> Result<()> {
    if existing.transaction_type != TransactionType::Withdrawal
        || existing.wallet_id != wallet_id
        || existing.amount != amount
        || existing.execute_at != Some(execute_at)
    {
        return Err(AppError::IdempotencyConflict(
            "idempotency_key already used with a different withdrawal payload".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn execute_at_must_be_strictly_future() {
        let now = Utc::now();
        assert!(validate_future_execute_at(now, now).is_err());
        assert!(validate_future_execute_at(now - Duration::seconds(1), now).is_err());
        assert!(validate_future_execute_at(now + Duration::seconds(1), now).is_ok());
    }
}
