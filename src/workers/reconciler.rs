use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::gateway::{TransferGateway, TransferOutcome};
use crate::models::{ReconciliationTask, TransactionStatus};
use crate::observability::metrics;
use crate::repositories::{
    reconciliation_repository, transaction_repository, wallet_repository, ReconciliationRepository,
};
use crate::workers::executor::mark_unknown_and_queue_reconciliation;

/// Counters for one reconciler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSummary {
    pub stale_marked_unknown: u64,
    pub resolved_success: u64,
    pub resolved_failure: u64,
    pub pending: u64,
    pub resolved: u64,
}

enum TaskResolution {
    Skipped,
    Resolved,
    ResolvedSuccess,
    ResolvedFailure,
    Pending,
}

/// Two-phase reconciliation pass: time out stuck PROCESSING rows, then
/// drain pending tasks by querying the bank's status endpoint. Refunds
/// happen only on a definitive failure answer from the bank.
pub async fn reconcile_withdrawals(
    pool: &PgPool,
    gateway: &dyn TransferGateway,
    settings: &Settings,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<ReconcilerSummary> {
    let mut summary = ReconcilerSummary::default();
    if limit <= 0 {
        return Ok(summary);
    }

    summary.stale_marked_unknown = mark_stale_processing_unknown(
        pool,
        now,
        settings.worker.processing_timeout_seconds,
        settings.database.claim_skip_locked,
        limit,
    )
    .await?;

    let pending_tasks = ReconciliationRepository::new(pool.clone())
        .list_pending(limit)
        .await?;

    for task in pending_tasks {
        match resolve_pending_task(pool, gateway, &task).await? {
            TaskResolution::ResolvedSuccess => {
                summary.resolved_success += 1;
                metrics::record_reconciliation_resolved("success");
            }
            TaskResolution::ResolvedFailure => {
                summary.resolved_failure += 1;
                metrics::record_reconciliation_resolved("failure");
            }
            TaskResolution::Resolved => {
                summary.resolved += 1;
                metrics::record_reconciliation_resolved("already_final");
            }
            TaskResolution::Pending => summary.pending += 1,
            TaskResolution::Skipped => {}
        }
    }

    tracing::info!(
        event = "reconciler_end",
        stale_marked_unknown = summary.stale_marked_unknown,
        resolved_success = summary.resolved_success,
        resolved_failure = summary.resolved_failure,
        pending = summary.pending,
        resolved = summary.resolved,
        "reconciler run finished"
    );

    Ok(summary)
}

/// Phase A: every PROCESSING withdrawal untouched for longer than the
/// processing timeout moves to UNKNOWN with a reconciliation task. The
/// executor's monotonic `updated_at` bumps keep live rows out of this sweep.
async fn mark_stale_processing_unknown(
    pool: &PgPool,
    now: DateTime<Utc>,
    timeout_seconds: i64,
    skip_locked: bool,
    limit: i64,
) -> Result<u64> {
    let stale_before = now - chrono::Duration::seconds(timeout_seconds);
    let mut processed = 0u64;

    while processed < limit as u64 {
        let mut uow = pool.begin().await.map_err(AppError::Database)?;

        let Some(tx) =
            transaction_repository::claim_next_stale(&mut uow, stale_before, skip_locked).await?
        else {
            break;
        };

        mark_unknown_and_queue_reconciliation(
            &mut uow,
            tx.id,
            "PROCESSING_TIMEOUT_RECONCILIATION_REQUIRED",
        )
        .await?;
        uow.commit().await.map_err(AppError::Database)?;

        tracing::warn!(
            event = "reconciler_marked_unknown",
            transaction_id = tx.id,
            "PROCESSING timed out, queued for reconciliation"
        );
        processed += 1;
    }

    Ok(processed)
}

/// Phase B: resolves one pending task under task -> transaction -> wallet
/// locks. Transactions already terminal resolve the task immediately;
/// otherwise the bank's status endpoint decides.
async fn resolve_pending_task(
    pool: &PgPool,
    gateway: &dyn TransferGateway,
    task: &ReconciliationTask,
) -> Result<TaskResolution> {
    let mut uow = pool.begin().await.map_err(AppError::Database)?;

    let Some(locked_task) = reconciliation_repository::lock(&mut uow, task.id).await? else {
        return Ok(TaskResolution::Skipped);
    };
    let tx = transaction_repository::lock(&mut uow, locked_task.transaction_id)
        .await?
        .ok_or_else(|| {
            AppError::Internal(format!(
                "transaction={} vanished",
                locked_task.transaction_id
            ))
        })?;
    let wallet = wallet_repository::lock(&mut uow, tx.wallet_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("wallet={} vanished", tx.wallet_id)))?;

    if !locked_task.is_pending() {
        return Ok(TaskResolution::Skipped);
    }

    if tx.status == TransactionStatus::Succeeded {
        reconciliation_repository::resolve(&mut uow, locked_task.id, "ALREADY_SUCCEEDED").await?;
        uow.commit().await.map_err(AppError::Database)?;
        return Ok(TaskResolution::Resolved);
    }
    if tx.status == TransactionStatus::Failed {
        reconciliation_repository::resolve(&mut uow, locked_task.id, "ALREADY_FAILED").await?;
        uow.commit().await.map_err(AppError::Database)?;
        return Ok(TaskResolution::Resolved);
    }
    if !tx.status.is_transient() {
        return Ok(TaskResolution::Skipped);
    }

    if !gateway.can_query_status() {
        tracing::warn!(
            event = "reconciler_status_endpoint_missing",
            transaction_id = tx.id,
            idempotency_key = tx.idempotency_key.as_deref(),
            "cannot reconcile without a status endpoint"
        );
        return Ok(TaskResolution::Pending);
    }

    let Some(idempotency_key) = tx.idempotency_key.as_deref() else {
        // A withdrawal can only reach PROCESSING/UNKNOWN with a key installed.
        return Err(AppError::Internal(format!(
            "transaction={} in {:?} without idempotency key",
            tx.id, tx.status
        )));
    };

    let reference = tx
        .external_reference
        .as_deref()
        .or(tx.bank_reference.as_deref());

    let status_result = match gateway
        .query_transfer_status(idempotency_key, tx.id, reference)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                event = "reconciler_status_query_exception",
                transaction_id = tx.id,
                error = %e,
                "status query failed, leaving task pending"
            );
            return Ok(TaskResolution::Pending);
        }
    };

    match status_result.outcome {
        TransferOutcome::Success => {
            let reference = status_result
                .reference
                .as_deref()
                .unwrap_or(idempotency_key);
            transaction_repository::mark_succeeded(&mut uow, tx.id, reference).await?;
            reconciliation_repository::resolve(&mut uow, locked_task.id, "RECONCILED_SUCCESS")
                .await?;
            uow.commit().await.map_err(AppError::Database)?;
            tracing::info!(
                event = "reconciler_resolved_success",
                transaction_id = tx.id,
                idempotency_key,
                reference,
                "reconciled to SUCCEEDED"
            );
            Ok(TaskResolution::ResolvedSuccess)
        }
        TransferOutcome::FinalFailure => {
            let reason = status_result
                .error_reason
                .as_deref()
                .unwrap_or("RECONCILED_FINAL_FAILURE");
            wallet_repository::credit(&mut uow, wallet.id, tx.amount).await?;
            transaction_repository::mark_failed(&mut uow, tx.id, reason).await?;
            reconciliation_repository::resolve(&mut uow, locked_task.id, "RECONCILED_FINAL_FAILURE")
                .await?;
            uow.commit().await.map_err(AppError::Database)?;
            tracing::warn!(
                event = "reconciler_resolved_final_failure",
                transaction_id = tx.id,
                idempotency_key,
                reason,
                "reconciled to FAILED, wallet refunded"
            );
            Ok(TaskResolution::ResolvedFailure)
        }
        TransferOutcome::Unknown => {
            tracing::warn!(
                event = "reconciler_still_unknown",
                transaction_id = tx.id,
                idempotency_key,
                reason = status_result.error_reason.as_deref(),
                "bank still cannot answer, task stays pending"
            );
            Ok(TaskResolution::Pending)
        }
    }
}
