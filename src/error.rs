use thiserror::Error;

/// Unified error type for the wallet engine.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),

    #[error("lock contention: {0}")]
    LockContention(String),

    #[error("bank request error: {0}")]
    Bank(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AppError>;

// Postgres error codes signalling transient lock contention:
// 55P03 lock_not_available, 40001 serialization_failure, 40P01 deadlock_detected.
const LOCK_CONTENTION_CODES: [&str; 3] = ["55P03", "40001", "40P01"];

impl AppError {
    /// Short stable tag per variant, used in log fields and
    /// `gateway_exception:<kind>` failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "Database",
            AppError::Validation(_) => "Validation",
            AppError::NotFound(_) => "NotFound",
            AppError::InvalidTransactionState(_) => "InvalidTransactionState",
            AppError::IdempotencyConflict(_) => "IdempotencyConflict",
            AppError::LockContention(_) => "LockContention",
            AppError::Bank(_) => "Bank",
            AppError::Config(_) => "Config",
            AppError::Internal(_) => "Internal",
        }
    }

    /// Classifies a sqlx error, surfacing engine-level locking failures as
    /// the retryable `LockContention` variant.
    pub fn from_locking(err: sqlx::Error) -> AppError {
        if let Some(db_err) = err.as_database_error() {
            if let Some(code) = db_err.code() {
                if LOCK_CONTENTION_CODES.contains(&code.as_ref()) {
                    return AppError::LockContention(db_err.message().to_string());
                }
            }
        }
        AppError::Database(err)
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, AppError::LockContention(_))
    }
}
