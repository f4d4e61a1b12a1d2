use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::gateway::{TransferGateway, TransferOutcome, TransferResult};
use crate::idempotency;
use crate::observability::metrics;
use crate::repositories::{reconciliation_repository, transaction_repository, wallet_repository};

/// Counters for one executor run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub insufficient_funds: u64,
    pub reconciliation_queued: u64,
    pub unknown: u64,
}

/// A withdrawal claimed for execution: everything the bank call needs,
/// captured before the claim transaction committed.
#[derive(Debug, Clone)]
pub struct ClaimedWithdrawal {
    pub transaction_id: i64,
    pub wallet_owner_ref: Uuid,
    pub amount: i64,
    pub idempotency_key: String,
}

/// How a claimed withdrawal was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Succeeded,
    Failed,
    Unknown,
    /// Another worker or the reconciler finalized the row first.
    Skipped,
}

enum ClaimOutcome {
    Claimed(ClaimedWithdrawal),
    InsufficientFunds { transaction_id: i64 },
    /// Stale row routed straight to reconciliation because the bank cannot
    /// be trusted to deduplicate a retry.
    RoutedToReconciliation { transaction_id: i64 },
}

/// Drains due (and stale) withdrawals: claim, call the bank, finalize.
/// Repeats until `limit` items were processed or no claim is available.
/// Never lets a claimed row leak: every path ends in a terminal status, an
/// UNKNOWN with a reconciliation task, or a row the next tick will recover.
pub async fn execute_due_withdrawals(
    pool: &PgPool,
    gateway: &dyn TransferGateway,
    settings: &Settings,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<ExecutorSummary> {
    let mut summary = ExecutorSummary::default();
    if limit <= 0 {
        return Ok(summary);
    }

    let skip_locked = settings.database.claim_skip_locked;
    let stale_after = settings.worker.processing_stale_seconds;
    let honors_idempotency = settings.bank.honors_idempotency;
    let max_lock_retries = settings.worker.lock_contention_max_retries;
    let backoff = settings.worker.lock_contention_backoff_seconds;

    tracing::info!(
        event = "executor_start",
        limit,
        now = %now,
        stale_after_seconds = stale_after,
        "executor run starting"
    );

    let mut lock_retries = 0u32;

    while summary.processed < limit as u64 {
        let claimed = match next_claim(pool, now, stale_after, honors_idempotency, skip_locked).await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_lock_contention() => {
                lock_retries += 1;
                tracing::warn!(
                    event = "executor_lock_contention",
                    retry = lock_retries,
                    max_retries = max_lock_retries,
                    "claim hit lock contention"
                );
                if lock_retries > max_lock_retries {
                    tracing::warn!(
                        event = "executor_lock_contention_exhausted",
                        retries = lock_retries,
                        "giving up on this run"
                    );
                    break;
                }
                if backoff > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let Some(outcome) = claimed else { break };
        lock_retries = 0;

        match outcome {
            ClaimOutcome::InsufficientFunds { transaction_id } => {
                summary.processed += 1;
                summary.failed += 1;
                summary.insufficient_funds += 1;
                metrics::record_withdrawal_finalized("insufficient_funds");
                tracing::info!(
                    event = "withdrawal_failed_insufficient_funds",
                    transaction_id,
                    "withdrawal failed before any bank call"
                );
            }
            ClaimOutcome::RoutedToReconciliation { transaction_id } => {
                summary.processed += 1;
                summary.unknown += 1;
                summary.reconciliation_queued += 1;
                metrics::record_reconciliation_queued();
                tracing::warn!(
                    event = "withdrawal_stale_routed_to_reconciliation",
                    transaction_id,
                    "stale row queued for reconciliation, bank not re-invoked"
                );
            }
            ClaimOutcome::Claimed(claim) => {
                tracing::info!(
                    event = "withdrawal_execution_start",
                    transaction_id = claim.transaction_id,
                    wallet_owner_ref = %claim.wallet_owner_ref,
                    amount = claim.amount,
                    "executing claimed withdrawal"
                );

                let result = call_gateway(gateway, &claim).await;

                match finalize_claimed_withdrawal(pool, &claim, &result).await? {
                    FinalizeOutcome::Succeeded => {
                        summary.processed += 1;
                        summary.succeeded += 1;
                        metrics::record_withdrawal_finalized("succeeded");
                    }
                    FinalizeOutcome::Failed => {
                        summary.processed += 1;
                        summary.failed += 1;
                        metrics::record_withdrawal_finalized("failed");
                    }
                    FinalizeOutcome::Unknown => {
                        summary.processed += 1;
                        summary.unknown += 1;
                        summary.reconciliation_queued += 1;
                        metrics::record_withdrawal_finalized("unknown");
                        metrics::record_reconciliation_queued();
                    }
                    FinalizeOutcome::Skipped => {}
                }
            }
        }
    }

    tracing::info!(
        event = "executor_end",
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        insufficient_funds = summary.insufficient_funds,
        reconciliation_queued = summary.reconciliation_queued,
        unknown = summary.unknown,
        "executor run finished"
    );

    Ok(summary)
}

async fn next_claim(
    pool: &PgPool,
    now: DateTime<Utc>,
    stale_after_seconds: i64,
    honors_idempotency: bool,
    skip_locked: bool,
) -> Result<Option<ClaimOutcome>> {
    if let Some(outcome) = claim_next_due_withdrawal(pool, now, skip_locked).await? {
        return Ok(Some(outcome));
    }
    claim_stale_processing_withdrawal(pool, now, stale_after_seconds, honors_idempotency, skip_locked)
        .await
}

/// One claim unit of work for a due SCHEDULED withdrawal: lock the row,
/// lock the wallet, conditionally debit, install the idempotency key and
/// move to PROCESSING. Commits before any bank traffic.
async fn claim_next_due_withdrawal(
    pool: &PgPool,
    now: DateTime<Utc>,
    skip_locked: bool,
) -> Result<Option<ClaimOutcome>> {
    let mut uow = pool.begin().await.map_err(AppError::Database)?;

    let Some(tx) = transaction_repository::claim_next_due(&mut uow, now, skip_locked).await? else {
        return Ok(None);
    };

    let wallet = wallet_repository::lock(&mut uow, tx.wallet_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("wallet={} vanished", tx.wallet_id)))?;

    if !wallet_repository::try_debit(&mut uow, wallet.id, tx.amount).await? {
        transaction_repository::mark_failed(&mut uow, tx.id, "INSUFFICIENT_FUNDS").await?;
        uow.commit().await.map_err(AppError::Database)?;
        return Ok(Some(ClaimOutcome::InsufficientFunds {
            transaction_id: tx.id,
        }));
    }

    let key = idempotency::ensure_withdrawal_key(&mut uow, &tx).await?;
    transaction_repository::mark_processing(&mut uow, tx.id).await?;
    uow.commit().await.map_err(AppError::Database)?;

    tracing::info!(
        event = "withdrawal_claimed",
        transaction_id = tx.id,
        wallet_id = tx.wallet_id,
        amount = tx.amount,
        idempotency_key = %key,
        claim_type = "scheduled",
        "claimed due withdrawal"
    );

    Ok(Some(ClaimOutcome::Claimed(ClaimedWithdrawal {
        transaction_id: tx.id,
        wallet_owner_ref: wallet.uuid,
        amount: tx.amount,
        idempotency_key: key,
    })))
}

/// Recovers a PROCESSING row presumed abandoned by a dead worker. With a
/// bank that honors idempotency keys the transfer is retried under the same
/// key; without one a retry could double-pay, so the row goes to
/// reconciliation instead.
async fn claim_stale_processing_withdrawal(
    pool: &PgPool,
    now: DateTime<Utc>,
    stale_after_seconds: i64,
    honors_idempotency: bool,
    skip_locked: bool,
) -> Result<Option<ClaimOutcome>> {
    let stale_before = now - chrono::Duration::seconds(stale_after_seconds);
    let mut uow = pool.begin().await.map_err(AppError::Database)?;

    let Some(tx) =
        transaction_repository::claim_next_stale(&mut uow, stale_before, skip_locked).await?
    else {
        return Ok(None);
    };

    let wallet = wallet_repository::lock(&mut uow, tx.wallet_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("wallet={} vanished", tx.wallet_id)))?;

    if !honors_idempotency {
        mark_unknown_and_queue_reconciliation(
            &mut uow,
            tx.id,
            "STALE_PROCESSING_WITHOUT_BANK_IDEMPOTENCY",
        )
        .await?;
        uow.commit().await.map_err(AppError::Database)?;
        return Ok(Some(ClaimOutcome::RoutedToReconciliation {
            transaction_id: tx.id,
        }));
    }

    let key = idempotency::ensure_withdrawal_key(&mut uow, &tx).await?;
    transaction_repository::touch_for_retry(&mut uow, tx.id).await?;
    uow.commit().await.map_err(AppError::Database)?;

    tracing::warn!(
        event = "withdrawal_reclaimed_processing",
        transaction_id = tx.id,
        wallet_id = tx.wallet_id,
        idempotency_key = %key,
        "reclaimed stale PROCESSING withdrawal for retry"
    );

    Ok(Some(ClaimOutcome::Claimed(ClaimedWithdrawal {
        transaction_id: tx.id,
        wallet_owner_ref: wallet.uuid,
        amount: tx.amount,
        idempotency_key: key,
    })))
}

/// Invokes the gateway outside any open unit of work. Errors never escape:
/// an unclassified failure is an UNKNOWN outcome by definition.
pub async fn call_gateway(
    gateway: &dyn TransferGateway,
    claim: &ClaimedWithdrawal,
) -> TransferResult {
    match gateway
        .transfer(
            &claim.idempotency_key,
            &claim.wallet_owner_ref.to_string(),
            claim.amount,
            claim.transaction_id,
        )
        .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                event = "executor_gateway_exception",
                transaction_id = claim.transaction_id,
                error = %e,
                "gateway call failed, treating outcome as unknown"
            );
            TransferResult::unknown(format!("gateway_exception:{}", e.kind()))
        }
    }
}

/// Finalizes a claimed withdrawal in a fresh unit of work. Skips when the
/// row is no longer PROCESSING. Refunds only on FINAL_FAILURE; an UNKNOWN
/// outcome keeps the debit and queues reconciliation.
pub async fn finalize_claimed_withdrawal(
    pool: &PgPool,
    claim: &ClaimedWithdrawal,
    result: &TransferResult,
) -> Result<FinalizeOutcome> {
    let mut uow = pool.begin().await.map_err(AppError::Database)?;

    let tx = transaction_repository::lock(&mut uow, claim.transaction_id)
        .await?
        .ok_or_else(|| {
            AppError::Internal(format!("transaction={} vanished", claim.transaction_id))
        })?;
    let wallet = wallet_repository::lock(&mut uow, tx.wallet_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("wallet={} vanished", tx.wallet_id)))?;

    if tx.status != crate::models::TransactionStatus::Processing {
        tracing::info!(
            event = "withdrawal_finalize_skipped",
            transaction_id = tx.id,
            current_status = ?tx.status,
            "row already finalized elsewhere"
        );
        return Ok(FinalizeOutcome::Skipped);
    }

    match result.outcome {
        TransferOutcome::Success => {
            let reference = result
                .reference
                .as_deref()
                .unwrap_or(claim.idempotency_key.as_str());
            transaction_repository::mark_succeeded(&mut uow, tx.id, reference).await?;
            uow.commit().await.map_err(AppError::Database)?;
            tracing::info!(
                event = "withdrawal_succeeded",
                transaction_id = tx.id,
                wallet_id = wallet.id,
                reference,
                "withdrawal settled"
            );
            Ok(FinalizeOutcome::Succeeded)
        }
        TransferOutcome::Unknown => {
            let reason = result
                .error_reason
                .as_deref()
                .unwrap_or("UNKNOWN_TRANSFER_OUTCOME");
            mark_unknown_and_queue_reconciliation(&mut uow, tx.id, reason).await?;
            uow.commit().await.map_err(AppError::Database)?;
            tracing::warn!(
                event = "withdrawal_outcome_unknown",
                transaction_id = tx.id,
                wallet_id = wallet.id,
                reason,
                "debit stands pending reconciliation"
            );
            Ok(FinalizeOutcome::Unknown)
        }
        TransferOutcome::FinalFailure => {
            let reason = result.error_reason.as_deref().unwrap_or("BANK_TRANSFER_FAILED");
            wallet_repository::credit(&mut uow, wallet.id, tx.amount).await?;
            transaction_repository::mark_failed(&mut uow, tx.id, reason).await?;
            uow.commit().await.map_err(AppError::Database)?;
            tracing::warn!(
                event = "withdrawal_failed_refunded",
                transaction_id = tx.id,
                wallet_id = wallet.id,
                reason,
                amount = tx.amount,
                "withdrawal rejected, wallet refunded"
            );
            Ok(FinalizeOutcome::Failed)
        }
    }
}

/// Moves a withdrawal to UNKNOWN and (re)opens its reconciliation task.
/// Caller holds the transaction row lock.
pub(crate) async fn mark_unknown_and_queue_reconciliation(
    conn: &mut sqlx::PgConnection,
    transaction_id: i64,
    reason: &str,
) -> Result<()> {
    transaction_repository::mark_unknown(conn, transaction_id, reason).await?;
    reconciliation_repository::upsert_pending(conn, transaction_id, reason).await?;
    Ok(())
}
