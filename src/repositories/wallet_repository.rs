use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::Wallet;

/// Repository for wallet rows.
pub struct WalletRepository {
    pool: PgPool,
}

impl WalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a wallet with a fresh external UUID and zero balance.
    pub async fn create(&self) -> Result<Wallet> {
        let row = sqlx::query_as::<_, Wallet>(
            r#"
            INSERT INTO wallets (uuid)
            VALUES ($1)
            RETURNING id, uuid, balance, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Wallet>> {
        let row = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, uuid, balance, created_at, updated_at
            FROM wallets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, uuid, balance, created_at, updated_at
            FROM wallets
            WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}

// Row-locked operations for use inside an open database transaction.
// Lock order everywhere is transaction row first, wallet row second.

/// Acquires the wallet row lock and returns the current row.
pub async fn lock(conn: &mut PgConnection, id: i64) -> Result<Option<Wallet>> {
    let row = sqlx::query_as::<_, Wallet>(
        r#"
        SELECT id, uuid, balance, created_at, updated_at
        FROM wallets
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(AppError::from_locking)?;

    Ok(row)
}

/// Conditionally debits the wallet. Returns false when the balance guard
/// rejects the update (insufficient funds); the caller must not proceed
/// with the withdrawal in that case.
pub async fn try_debit(conn: &mut PgConnection, id: i64, amount: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE wallets
        SET balance = balance - $2, updated_at = NOW()
        WHERE id = $1 AND balance >= $2
        "#,
    )
    .bind(id)
    .bind(amount)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(result.rows_affected() > 0)
}

/// Credits the wallet unconditionally (deposits and refunds).
pub async fn credit(conn: &mut PgConnection, id: i64, amount: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE wallets
        SET balance = balance + $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(amount)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(())
}

/// Re-reads the wallet row inside the current transaction.
pub async fn fetch(conn: &mut PgConnection, id: i64) -> Result<Option<Wallet>> {
    let row = sqlx::query_as::<_, Wallet>(
        r#"
        SELECT id, uuid, balance, created_at, updated_at
        FROM wallets
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    Ok(row)
}
