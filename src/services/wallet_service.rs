use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::idempotency;
use crate::models::{Transaction, TransactionStatus, TransactionType, Wallet};
use crate::repositories::{transaction_repository, wallet_repository, WalletRepository};

/// Result of a deposit call; `created` is false when a client idempotency
/// key replayed an earlier request.
#[derive(Debug)]
pub struct DepositOutcome {
    pub wallet: Wallet,
    pub transaction: Transaction,
    pub created: bool,
}

/// Service for wallet lifecycle and synchronous credits.
pub struct WalletService {
    pool: PgPool,
}

impl WalletService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_wallet(&self) -> Result<Wallet> {
        WalletRepository::new(self.pool.clone()).create().await
    }

    pub async fn get_wallet(&self, wallet_id: i64) -> Result<Wallet> {
        WalletRepository::new(self.pool.clone())
            .find_by_id(wallet_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("wallet={wallet_id} does not exist")))
    }

    /// Credits the wallet and records a SUCCEEDED deposit, all under the
    /// wallet row lock. With a client key the call is deduplicated: a
    /// matching replay returns the original transaction without a second
    /// credit, a mismatched replay is a conflict.
    pub async fn deposit(
        &self,
        wallet_id: i64,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<DepositOutcome> {
        validate_positive_amount(amount)?;

        let mut uow = self.pool.begin().await.map_err(AppError::Database)?;

        let wallet = wallet_repository::lock(&mut uow, wallet_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("wallet={wallet_id} does not exist")))?;

        let (transaction, created) = match idempotency_key {
            None => {
                let tx = transaction_repository::insert(
                    &mut uow,
                    transaction_repository::NewTransaction {
                        wallet_id: wallet.id,
                        transaction_type: TransactionType::Deposit,
                        status: TransactionStatus::Succeeded,
                        amount,
                        execute_at: None,
                        idempotency_key: None,
                    },
                )
                .await?;
                wallet_repository::credit(&mut uow, wallet.id, amount).await?;
                (tx, true)
            }
            Some(key) => {
                let key = idempotency::normalize_client_key(key)?;
                match transaction_repository::find_by_key(&mut uow, &key).await? {
                    Some(existing) => {
                        check_deposit_payload(&existing, wallet.id, amount)?;
                        (existing, false)
                    }
                    None => {
                        let inserted = transaction_repository::insert_if_key_free(
                            &mut uow,
                            transaction_repository::NewTransaction {
                                wallet_id: wallet.id,
                                transaction_type: TransactionType::Deposit,
                                status: TransactionStatus::Succeeded,
                                amount,
                                execute_at: None,
                                idempotency_key: Some(&key),
                            },
                        )
                        .await?;
                        match inserted {
                            Some(tx) => {
                                wallet_repository::credit(&mut uow, wallet.id, amount).await?;
                                (tx, true)
                            }
                            None => {
                                // Lost the insert race to a concurrent replay.
                                let existing = transaction_repository::find_by_key(&mut uow, &key)
                                    .await?
                                    .ok_or_else(|| {
                                        AppError::Internal(
                                            "idempotency key vanished during dedup".to_string(),
                                        )
                                    })?;
                                check_deposit_payload(&existing, wallet.id, amount)?;
                                (existing, false)
                            }
                        }
                    }
                }
            }
        };

        let wallet = wallet_repository::fetch(&mut uow, wallet.id)
            .await?
            .ok_or_else(|| AppError::Internal("wallet row vanished mid-transaction".to_string()))?;

        uow.commit().await.map_err(AppError::Database)?;

        tracing::info!(
            event = "deposit_recorded",
            wallet_id = wallet.id,
            transaction_id = transaction.id,
            amount,
            created,
            "deposit completed"
        );

        Ok(DepositOutcome {
            wallet,
            transaction,
            created,
        })
    }
}

pub(crate) fn validate_positive_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(AppError::Validation(
            "amount must be a positive integer in minor units".to_string(),
        ));
    }
    Ok(())
}

fn check_deposit_payload(existing: &Transaction, wallet_id: i64, amount: i64) -> Result<()> {
    if existing.transaction_type != TransactionType::Deposit
        || existing.wallet_id != wallet_id
        || existing.amount != amount
    {
        return Err(AppError::IdempotencyConflict(
            "idempotency_key already used with a different deposit payload".to_string(),
        ));
    }
    Ok(())
}
