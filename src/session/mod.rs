//! Billable chat and call sessions.
//!
//! One [`Session`] type covers every kind. Chat goes live on creation;
//! voice and video ring first (`Requested`) and go live when the consultant
//! accepts. The methods here are the pure state machine; stores persist the
//! result with a compare-and-set on the previous status.
//!
//! ```text
//!             accept                 end (billed)
//! Requested ─────────► Active ─────────────────► Completed
//!     │
//!     └─ reject / cancel / end before pickup / ring timeout ─► Cancelled
//! ```
mod query;
mod service;

pub use query::SessionQuery;
pub use service::{ReapReport, Settlement};

use chrono::{DateTime, Utc};
use ledger::Source;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, InvalidState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Chat,
    Voice,
    Video,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Chat => "chat",
            SessionKind::Voice => "voice",
            SessionKind::Video => "video",
        }
    }

    /// Calls ring until the consultant picks up.
    pub fn requires_accept(&self) -> bool {
        !matches!(self, SessionKind::Chat)
    }

    /// Ledger source tag for this kind's settlement debit.
    pub fn ledger_source(&self) -> Source {
        match self {
            SessionKind::Chat => Source::SessionChat,
            SessionKind::Voice | SessionKind::Video => Source::SessionCall,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(SessionKind::Chat),
            "voice" => Ok(SessionKind::Voice),
            "video" => Ok(SessionKind::Video),
            other => Err(Error::Validation(format!("unknown session kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Requested,
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Requested => "requested",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(SessionStatus::Requested),
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown session status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Rejected,
    CallerCancelled,
    EndedBeforePickup,
    RingTimeout,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Rejected => "rejected",
            CancelReason::CallerCancelled => "caller_cancelled",
            CancelReason::EndedBeforePickup => "ended_before_pickup",
            CancelReason::RingTimeout => "ring_timeout",
        }
    }
}

impl FromStr for CancelReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rejected" => Ok(CancelReason::Rejected),
            "caller_cancelled" => Ok(CancelReason::CallerCancelled),
            "ended_before_pickup" => Ok(CancelReason::EndedBeforePickup),
            "ring_timeout" => Ok(CancelReason::RingTimeout),
            other => Err(Error::Validation(format!("unknown cancel reason: {other}"))),
        }
    }
}

/// Billed duration and amount for one session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bill {
    pub minutes: u64,
    pub amount: u64,
}

impl Bill {
    /// Whole minutes rounded up; any live session bills at least one.
    pub fn compute(
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        rate: u64,
    ) -> Result<Self, Error> {
        let elapsed_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        let minutes = elapsed_ms.div_ceil(60_000).max(1);
        let amount = minutes
            .checked_mul(rate)
            .ok_or_else(|| Error::Validation("session charge overflows".to_string()))?;
        Ok(Self { minutes, amount })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub client: Uuid,
    pub consultant: Uuid,
    pub kind: SessionKind,
    pub status: SessionStatus,
    /// Per-minute rate copied from the consultant when the session started.
    pub rate: u64,
    /// Real-time media channel.
    pub channel: String,
    pub requested_at: DateTime<Utc>,
    /// Billing clock start. Reset when a call is accepted.
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: u64,
    pub charged_amount: u64,
    /// Charge forgiven by the waive-charge settlement policy.
    pub waived_amount: u64,
    pub cancel_reason: Option<CancelReason>,
    pub updated_at: DateTime<Utc>,
}

/// What ending a session amounts to, decided before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Cancel,
    Bill(Bill),
}

impl Session {
    pub fn new(
        client: Uuid,
        consultant: Uuid,
        kind: SessionKind,
        rate: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::now_v7();
        let status = if kind.requires_accept() {
            SessionStatus::Requested
        } else {
            SessionStatus::Active
        };
        Self {
            id,
            client,
            consultant,
            kind,
            status,
            rate,
            channel: format!("{}_{}", kind.as_str(), id.simple()),
            requested_at: now,
            started_at: now,
            ended_at: None,
            duration_minutes: 0,
            charged_amount: 0,
            waived_amount: 0,
            cancel_reason: None,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, account: Uuid) -> bool {
        account == self.client || account == self.consultant
    }

    pub fn ensure_participant(&self, actor: Uuid) -> Result<(), Error> {
        if self.is_participant(actor) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "{actor} is not a participant of session {}",
                self.id
            )))
        }
    }

    /// The other side of the session from `actor`.
    pub fn counterpart(&self, actor: Uuid) -> Uuid {
        if actor == self.client {
            self.consultant
        } else {
            self.client
        }
    }

    fn ensure_ringing(&self) -> Result<(), Error> {
        match self.status {
            SessionStatus::Requested => Ok(()),
            s if s.is_terminal() => Err(Error::InvalidState(InvalidState::AlreadyTerminal)),
            _ => Err(Error::InvalidState(InvalidState::NotRequested)),
        }
    }

    fn ensure_consultant(&self, actor: Uuid) -> Result<(), Error> {
        if actor == self.consultant {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "only the addressed consultant may answer session {}",
                self.id
            )))
        }
    }

    /// Consultant picks up. Billing starts now.
    pub fn accept(&self, actor: Uuid, now: DateTime<Utc>) -> Result<Session, Error> {
        self.ensure_consultant(actor)?;
        self.ensure_ringing()?;
        let mut next = self.clone();
        next.status = SessionStatus::Active;
        next.started_at = now;
        next.updated_at = now;
        Ok(next)
    }

    pub fn reject(&self, actor: Uuid, now: DateTime<Utc>) -> Result<Session, Error> {
        self.ensure_consultant(actor)?;
        self.ensure_ringing()?;
        Ok(self.cancelled(CancelReason::Rejected, now))
    }

    /// Caller gives up before pickup.
    pub fn cancel_request(&self, actor: Uuid, now: DateTime<Utc>) -> Result<Session, Error> {
        if actor != self.client {
            return Err(Error::Forbidden(format!(
                "only the caller may cancel session {}",
                self.id
            )));
        }
        self.ensure_ringing()?;
        Ok(self.cancelled(CancelReason::CallerCancelled, now))
    }

    pub fn expire(&self, now: DateTime<Utc>) -> Result<Session, Error> {
        self.ensure_ringing()?;
        Ok(self.cancelled(CancelReason::RingTimeout, now))
    }

    fn cancelled(&self, reason: CancelReason, now: DateTime<Utc>) -> Session {
        let mut next = self.clone();
        next.status = SessionStatus::Cancelled;
        next.cancel_reason = Some(reason);
        next.ended_at = Some(now);
        next.updated_at = now;
        next
    }

    /// Decide what ending at `ended_at` means. `actor` is `None` when the
    /// system ends the session.
    pub fn plan_end(
        &self,
        actor: Option<Uuid>,
        ended_at: DateTime<Utc>,
    ) -> Result<EndOutcome, Error> {
        if let Some(actor) = actor {
            self.ensure_participant(actor)?;
        }
        match self.status {
            SessionStatus::Requested => Ok(EndOutcome::Cancel),
            SessionStatus::Active => Ok(EndOutcome::Bill(Bill::compute(
                self.started_at,
                ended_at,
                self.rate,
            )?)),
            SessionStatus::Completed | SessionStatus::Cancelled => {
                Err(Error::InvalidState(InvalidState::AlreadyTerminal))
            }
        }
    }

    pub fn ended_before_pickup(&self, now: DateTime<Utc>) -> Session {
        self.cancelled(CancelReason::EndedBeforePickup, now)
    }

    /// Terminal copy carrying the bill. `charged + waived` equals the bill.
    pub fn completed(&self, bill: Bill, waived: bool, ended_at: DateTime<Utc>) -> Session {
        let mut next = self.clone();
        next.status = SessionStatus::Completed;
        next.ended_at = Some(ended_at);
        next.duration_minutes = bill.minutes;
        if waived {
            next.charged_amount = 0;
            next.waived_amount = bill.amount;
        } else {
            next.charged_amount = bill.amount;
            next.waived_amount = 0;
        }
        next.updated_at = ended_at;
        next
    }

    /// Ledger key for the settlement debit; a session is debited at most once.
    pub fn settlement_key(&self) -> String {
        format!("session-settlement:{}", self.id)
    }

    pub fn settlement_remark(&self, bill: &Bill) -> String {
        let unit = if bill.minutes == 1 { "minute" } else { "minutes" };
        format!("{} session {} - {} {unit}", self.kind, self.id, bill.minutes)
    }
}
