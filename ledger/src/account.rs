// ledger/src/account.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A wallet-holding party. `balance` is in minor units and only ever
/// changes through an executed plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub balance: u64,
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: 0,
            blocked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_cover(&self, amount: u64) -> bool {
        self.balance >= amount
    }
}
