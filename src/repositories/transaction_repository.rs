use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::error::{AppError, Result};
use crate::models::{Transaction, TransactionStatus, TransactionType};

const COLUMNS: &str = "id, wallet_id, type, status, amount, execute_at, idempotency_key, \
                       external_reference, bank_reference, failure_reason, created_at, updated_at";

/// Repository for transaction rows.
pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {COLUMNS} FROM transactions WHERE id = $1");
        let row = sqlx::query_as::<_, Transaction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Lists a wallet's transactions, newest first, with optional filters.
    pub async fn list_for_wallet(
        &self,
        wallet_id: i64,
        transaction_type: Option<TransactionType>,
        status: Option<TransactionStatus>,
        limit: i64,
    ) -> Result<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM transactions
            WHERE wallet_id = $1
              AND ($2::transaction_type IS NULL OR type = $2)
              AND ($3::transaction_status IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, Transaction>(&sql)
            .bind(wallet_id)
            .bind(transaction_type)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows)
    }
}

// Transaction-scoped operations. Callers hold an open unit of work and are
// responsible for lock ordering (transaction row before wallet row).

pub struct NewTransaction<'a> {
    pub wallet_id: i64,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: i64,
    pub execute_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<&'a str>,
}

/// Inserts a row, failing on idempotency-key conflicts.
pub async fn insert(conn: &mut PgConnection, new: NewTransaction<'_>) -> Result<Transaction> {
    let sql = format!(
        r#"
        INSERT INTO transactions (wallet_id, type, status, amount, execute_at, idempotency_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(new.wallet_id)
        .bind(new.transaction_type)
        .bind(new.status)
        .bind(new.amount)
        .bind(new.execute_at)
        .bind(new.idempotency_key)
        .fetch_one(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(row)
}

/// Inserts a keyed row; returns None when the key already exists so the
/// caller can fall back to the existing row (client dedup).
pub async fn insert_if_key_free(
    conn: &mut PgConnection,
    new: NewTransaction<'_>,
) -> Result<Option<Transaction>> {
    let sql = format!(
        r#"
        INSERT INTO transactions (wallet_id, type, status, amount, execute_at, idempotency_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
        RETURNING {COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(new.wallet_id)
        .bind(new.transaction_type)
        .bind(new.status)
        .bind(new.amount)
        .bind(new.execute_at)
        .bind(new.idempotency_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(row)
}

pub async fn find_by_key(conn: &mut PgConnection, key: &str) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {COLUMNS} FROM transactions WHERE idempotency_key = $1");
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(row)
}

/// Acquires the transaction row lock and returns the current row.
pub async fn lock(conn: &mut PgConnection, id: i64) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from_locking)?;

    Ok(row)
}

/// Selects and locks the oldest due SCHEDULED withdrawal. With skip-locked
/// enabled, parallel workers pick disjoint rows; otherwise NOWAIT surfaces
/// contention as a retryable error.
pub async fn claim_next_due(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    skip_locked: bool,
) -> Result<Option<Transaction>> {
    let lock_clause = if skip_locked { "FOR UPDATE SKIP LOCKED" } else { "FOR UPDATE NOWAIT" };
    let sql = format!(
        r#"
        SELECT {COLUMNS}
        FROM transactions
        WHERE type = 'WITHDRAWAL' AND status = 'SCHEDULED' AND execute_at <= $1
        ORDER BY execute_at, id
        LIMIT 1
        {lock_clause}
        "#
    );
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from_locking)?;

    Ok(row)
}

/// Selects and locks the oldest PROCESSING withdrawal untouched since
/// `stale_before`.
pub async fn claim_next_stale(
    conn: &mut PgConnection,
    stale_before: DateTime<Utc>,
    skip_locked: bool,
) -> Result<Option<Transaction>> {
    let lock_clause = if skip_locked { "FOR UPDATE SKIP LOCKED" } else { "FOR UPDATE NOWAIT" };
    let sql = format!(
        r#"
        SELECT {COLUMNS}
        FROM transactions
        WHERE type = 'WITHDRAWAL' AND status = 'PROCESSING' AND updated_at <= $1
        ORDER BY updated_at, id
        LIMIT 1
        {lock_clause}
        "#
    );
    let row = sqlx::query_as::<_, Transaction>(&sql)
        .bind(stale_before)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from_locking)?;

    Ok(row)
}

pub async fn mark_processing(conn: &mut PgConnection, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'PROCESSING', failure_reason = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(())
}

pub async fn mark_succeeded(conn: &mut PgConnection, id: i64, reference: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'SUCCEEDED',
            external_reference = $2,
            bank_reference = $2,
            failure_reason = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(reference)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(())
}

pub async fn mark_failed(conn: &mut PgConnection, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'FAILED', failure_reason = $2, updated_at = NOW()
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

pub async fn mark_unknown(conn: &mut PgConnection, id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'UNKNOWN', failure_reason = $2, updated_at = NOW()
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

/// Bumps `updated_at` and clears the failure reason on a PROCESSING row
/// being reclaimed for another bank attempt.
pub async fn touch_for_retry(conn: &mut PgConnection, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET failure_reason = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(())
}

/// Installs a bank idempotency key only when none is set yet. Returns false
/// when another writer won the race.
pub async fn install_idempotency_key(
    conn: &mut PgConnection,
    id: i64,
    key: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET idempotency_key = $2, updated_at = NOW()
        WHERE id = $1 AND idempotency_key IS NULL
        "#,
    )
    .bind(id)
    .bind(key)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(result.rows_affected() > 0)
}

pub async fn fetch_idempotency_key(conn: &mut PgConnection, id: i64) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT idempotency_key FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(AppError::Database)?;

    Ok(row.and_then(|(key,)| key))
}

pub async fn key_exists(conn: &mut PgConnection, key: &str) -> Result<bool> {
    let row: (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM transactions WHERE idempotency_key = $1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(AppError::Database)?;

    Ok(row.0)
}
