pub mod reconciliation_repository;
pub mod transaction_repository;
pub mod wallet_repository;

pub use reconciliation_repository::ReconciliationRepository;
pub use transaction_repository::TransactionRepository;
pub use wallet_repository::WalletRepository;

use sqlx::PgPool;

/// Database connection pool type alias.
pub type DbPool = PgPool;
