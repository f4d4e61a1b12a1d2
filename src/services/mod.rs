pub mod wallet_service;
pub mod withdrawal_service;

pub use wallet_service::{DepositOutcome, WalletService};
pub use withdrawal_service::{ScheduleOutcome, WithdrawalService};
