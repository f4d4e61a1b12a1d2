pub mod reconciliation;
pub mod transaction;
pub mod wallet;

pub use reconciliation::{ReconciliationStatus, ReconciliationTask};
pub use transaction::{Transaction, TransactionStatus, TransactionType};
pub use wallet::Wallet;
