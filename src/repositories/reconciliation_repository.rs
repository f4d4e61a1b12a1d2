use sqlx::{PgConnection, PgPool};

use crate::error::{AppError, Result};
use crate::models::ReconciliationTask;

const COLUMNS: &str = "id, transaction_id, reason, status, created_at, updated_at";

/// Repository for withdrawal reconciliation tasks.
pub struct ReconciliationRepository {
    pool: PgPool,
}

impl ReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_transaction(
        &self,
        transaction_id: i64,
    ) -> Result<Option<ReconciliationTask>> {
        let sql = format!("SELECT {COLUMNS} FROM withdrawal_reconciliation_tasks WHERE transaction_id = $1");
        let row = sqlx::query_as::<_, ReconciliationTask>(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Pending tasks in resolution order, oldest first.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<ReconciliationTask>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM withdrawal_reconciliation_tasks
            WHERE status = 'PENDING'
            ORDER BY created_at, id
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, ReconciliationTask>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows)
    }
}

// Transaction-scoped operations.

/// Creates the task for a transaction, or reopens an existing one with the
/// new reason. Keeps the one-task-per-transaction invariant: an UNKNOWN
/// withdrawal always has exactly one PENDING task after this call.
pub async fn upsert_pending(
    conn: &mut PgConnection,
    transaction_id: i64,
    reason: &str,
) -> Result<ReconciliationTask> {
    let sql = format!(
        r#"
        INSERT INTO withdrawal_reconciliation_tasks (transaction_id, reason, status)
        VALUES ($1, $2, 'PENDING')
        ON CONFLICT (transaction_id) DO UPDATE
        SET reason = EXCLUDED.reason, status = 'PENDING', updated_at = NOW()
        RETURNING {COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, ReconciliationTask>(&sql)
        .bind(transaction_id)
        .bind(reason)
        .fetch_one(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(row)
}

/// Acquires the task row lock and returns the current row.
pub async fn lock(conn: &mut PgConnection, id: i64) -> Result<Option<ReconciliationTask>> {
    let sql = format!("SELECT {COLUMNS} FROM withdrawal_reconciliation_tasks WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, ReconciliationTask>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from_locking)?;

    Ok(row)
}

pub async fn resolve(conn: &mut PgConnection, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE withdrawal_reconciliation_tasks
        SET status = 'RESOLVED', reason = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(())
}
