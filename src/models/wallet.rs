use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A customer wallet. The balance is held in integer minor units and may
/// only be mutated inside a database transaction holding the wallet row
/// lock; at rest it is never negative (CHECK constraint).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub id: i64,
    /// External identity, used as the owner reference sent to the bank.
    pub uuid: Uuid,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Checks whether the wallet can cover a debit of `amount`.
    pub fn covers(&self, amount: i64) -> bool {
        self.balance >= amount
    }
}
