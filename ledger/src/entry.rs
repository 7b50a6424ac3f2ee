// ledger/src/entry.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::LedgerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Direction::Credit),
            "debit" => Ok(Direction::Debit),
            other => Err(LedgerError::Storage(format!("unknown direction: {other}"))),
        }
    }
}

/// What caused a balance mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    GatewayPayment,
    SessionChat,
    SessionCall,
    AdminAdjustment,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::GatewayPayment => "gateway_payment",
            Source::SessionChat => "session_chat",
            Source::SessionCall => "session_call",
            Source::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway_payment" => Ok(Source::GatewayPayment),
            "session_chat" => Ok(Source::SessionChat),
            "session_call" => Ok(Source::SessionCall),
            "admin_adjustment" => Ok(Source::AdminAdjustment),
            other => Err(LedgerError::Storage(format!("unknown source: {other}"))),
        }
    }
}

/// Immutable record of one balance mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account: Uuid,
    pub direction: Direction,
    pub source: Source,
    pub amount: u64,
    pub remark: String,
    /// Balance of `account` right after this entry was applied.
    pub balance_after: u64,
    /// blake3 hash of the caller-supplied key, if any.
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub(crate) fn new(
        account: Uuid,
        direction: Direction,
        source: Source,
        amount: u64,
        remark: String,
        balance_after: u64,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account,
            direction,
            source,
            amount,
            remark,
            balance_after,
            idempotency_key,
            created_at: Utc::now(),
        }
    }

    pub fn signed_amount(&self) -> i128 {
        match self.direction {
            Direction::Credit => self.amount as i128,
            Direction::Debit => -(self.amount as i128),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_its_tag() {
        for source in [
            Source::GatewayPayment,
            Source::SessionChat,
            Source::SessionCall,
            Source::AdminAdjustment,
        ] {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("refund".parse::<Source>().is_err());
    }

    #[test]
    fn signed_amount_follows_direction() {
        let account = Uuid::now_v7();
        let credit = LedgerEntry::new(
            account,
            Direction::Credit,
            Source::GatewayPayment,
            500,
            "top up".to_string(),
            500,
            None,
        );
        let debit = LedgerEntry::new(
            account,
            Direction::Debit,
            Source::SessionChat,
            200,
            "chat".to_string(),
            300,
            None,
        );
        assert_eq!(credit.signed_amount() + debit.signed_amount(), 300);
    }
}
