//! Gateway payment orders and their confirmation.
//!
//! An order is recorded before checkout with the account and amount it is
//! for. The gateway signs `"{order_id}|{payment_id}"` with HMAC-SHA256 and
//! sends the hex digest. A verified confirmation credits the amount stored
//! on the order to the account stored on the order, once.
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ledger::LedgerEntry;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Paid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Paid => "paid",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(OrderStatus::Created),
            "paid" => Ok(OrderStatus::Paid),
            other => Err(Error::Storage(format!("unknown order status: {other}"))),
        }
    }
}

/// A wallet top-up the gateway was asked to collect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentOrder {
    /// Gateway order id.
    pub id: String,
    pub account: Uuid,
    /// Minor units.
    pub amount: u64,
    pub status: OrderStatus,
    pub payment_id: Option<String>,
    /// Ledger entry written when the order was paid.
    pub entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentOrder {
    pub fn new(
        id: impl Into<String>,
        account: Uuid,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("order id is required".to_string()));
        }
        if amount == 0 {
            return Err(Error::Validation("payment amount must be positive".to_string()));
        }
        Ok(Self {
            id,
            account,
            amount,
            status: OrderStatus::Created,
            payment_id: None,
            entry_id: None,
            created_at: now,
            paid_at: None,
        })
    }

    pub fn is_paid(&self) -> bool {
        self.status == OrderStatus::Paid
    }

    pub fn paid(&self, payment_id: &str, entry_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            status: OrderStatus::Paid,
            payment_id: Some(payment_id.to_string()),
            entry_id: Some(entry_id),
            paid_at: Some(now),
            ..self.clone()
        }
    }
}

/// What the gateway sends back after checkout. Account and amount are
/// never taken from here; they come from the stored order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

impl PaymentConfirmation {
    pub fn idempotency_key(&self) -> String {
        format!("gateway-payment:{}", self.payment_id)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.order_id.is_empty() || self.payment_id.is_empty() {
            return Err(Error::Validation(
                "order id and payment id are required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub entry: LedgerEntry,
    /// The payment had already been credited; nothing changed.
    pub replayed: bool,
}

fn mac(secret: &str, order_id: &str, payment_id: &str) -> Result<HmacSha256, Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("gateway secret: {e}")))?;
    mac.update(order_id.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    Ok(mac)
}

/// Hex signature the gateway is expected to send.
pub fn sign(secret: &str, order_id: &str, payment_id: &str) -> Result<String, Error> {
    Ok(hex::encode(
        mac(secret, order_id, payment_id)?.finalize().into_bytes(),
    ))
}

/// Constant-time check of the gateway signature.
pub fn verify_signature(secret: &str, confirmation: &PaymentConfirmation) -> Result<(), Error> {
    let invalid = || Error::Forbidden("invalid payment signature".to_string());
    let provided = hex::decode(confirmation.signature.trim()).map_err(|_| invalid())?;
    mac(secret, &confirmation.order_id, &confirmation.payment_id)?
        .verify_slice(&provided)
        .map_err(|_| invalid())
}
