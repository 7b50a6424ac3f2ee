//! Pre-flight check before a session may start.
//!
//! Stores run the same [`evaluate`] again while holding the consultant and
//! client rows, so the result here is advisory. The authoritative balance
//! check is the settlement debit.
use ledger::Account;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ConsultantProfile, Error, session::SessionKind};

/// What the client is about to be billed and what they must hold to start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quote {
    pub kind: SessionKind,
    pub rate: u64,
    pub required_balance: u64,
    pub balance: u64,
}

pub fn required_balance(rate: u64, min_balance_minutes: u32) -> u64 {
    rate.saturating_mul(min_balance_minutes as u64)
}

/// Availability first, then the balance floor. The floor is inclusive.
pub fn evaluate(
    profile: &ConsultantProfile,
    client: &Account,
    kind: SessionKind,
    min_balance_minutes: u32,
) -> Result<Quote, Error> {
    if client.id == profile.id {
        return Err(Error::Validation(
            "a consultant cannot book a session with themselves".to_string(),
        ));
    }
    if client.blocked {
        return Err(Error::Forbidden(format!("account {} is blocked", client.id)));
    }
    if !profile.available {
        debug!(consultant = %profile.id, "eligibility rejected: consultant unavailable");
        return Err(Error::Unavailable);
    }

    let rate = profile.rate_for(kind);
    let required = required_balance(rate, min_balance_minutes);
    if client.balance < required {
        debug!(
            client = %client.id,
            balance = client.balance,
            required,
            "eligibility rejected: balance below floor"
        );
        return Err(Error::InsufficientBalance);
    }

    Ok(Quote {
        kind,
        rate,
        required_balance: required,
        balance: client.balance,
    })
}
