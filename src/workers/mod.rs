pub mod executor;
pub mod reconciler;

pub use executor::{execute_due_withdrawals, ClaimedWithdrawal, ExecutorSummary, FinalizeOutcome};
pub use reconciler::{reconcile_withdrawals, ReconcilerSummary};
