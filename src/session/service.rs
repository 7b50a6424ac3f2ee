//! Session lifecycle on top of the store's guarded writes.
use chrono::{DateTime, Utc};
use ledger::{ExecutionPlan, LedgerEntry, Operation, Page, record_plan_metrics};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Bill, EndOutcome, Session, SessionKind, SessionQuery, SessionStatus};
use crate::adapters::{SessionRequest, SessionWrite};
use crate::media::{self, MediaGrant, MediaRole, MediaToken};
use crate::notify::template;
use crate::{Error, InvalidState, Marketplace, SettlementPolicy};

/// Sessions handled per reaper sweep and state.
const REAP_BATCH: u32 = 100;

/// Outcome of ending a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settlement {
    pub session: Session,
    /// The settlement debit. `None` for cancellations and waived charges.
    pub entry: Option<LedgerEntry>,
}

/// What one reaper sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapReport {
    pub expired: Vec<Session>,
    pub ended: Vec<Settlement>,
}

fn stale(current: &Session) -> Error {
    if current.status.is_terminal() {
        Error::InvalidState(InvalidState::AlreadyTerminal)
    } else {
        Error::Conflict(format!(
            "session {} moved to {} concurrently",
            current.id, current.status
        ))
    }
}

impl Marketplace {
    /// Open a chat or place a call. Eligibility is checked against the
    /// locked profile and wallet.
    pub async fn start_session(
        &self,
        client: Uuid,
        consultant: Uuid,
        kind: SessionKind,
    ) -> Result<Session, Error> {
        let request = SessionRequest {
            client,
            consultant,
            kind,
            min_balance_minutes: self.config().min_balance_minutes,
            now: self.now(),
        };
        let session = match self.inner.adapter.begin_session(request).await {
            Ok(session) => session,
            Err(err) => {
                debug!(client = %client, consultant = %consultant, kind = %kind, error = %err, "session refused");
                return Err(err);
            }
        };

        counter!("parley.sessions.started", "kind" => kind.as_str()).increment(1);
        info!(
            session = %session.id,
            client = %client,
            consultant = %consultant,
            kind = %kind,
            rate = session.rate,
            status = %session.status,
            "session started"
        );
        self.emit(consultant, template::session_requested(&session))
            .await;
        Ok(session)
    }

    async fn load_session(&self, id: Uuid) -> Result<Session, Error> {
        self.inner
            .adapter
            .fetch_session(id)
            .await?
            .ok_or_else(|| Error::not_found("session", id))
    }

    /// Write a transition that moves no money.
    async fn transition(&self, expected: SessionStatus, next: Session) -> Result<Session, Error> {
        match self
            .inner
            .adapter
            .commit_session(expected, &next, &ExecutionPlan::new())
            .await?
        {
            SessionWrite::Stored { session, .. } => Ok(session),
            SessionWrite::Stale(current) => Err(stale(&current)),
        }
    }

    pub async fn accept_call(&self, session: Uuid, actor: Uuid) -> Result<Session, Error> {
        let current = self.load_session(session).await?;
        let next = current.accept(actor, self.now())?;
        let session = self.transition(SessionStatus::Requested, next).await?;
        info!(session = %session.id, "call accepted");
        self.emit(session.client, template::call_accepted(&session))
            .await;
        Ok(session)
    }

    pub async fn reject_call(&self, session: Uuid, actor: Uuid) -> Result<Session, Error> {
        let current = self.load_session(session).await?;
        let next = current.reject(actor, self.now())?;
        let session = self.transition(SessionStatus::Requested, next).await?;
        self.cancelled(&session, &[session.client]).await;
        Ok(session)
    }

    /// The caller hangs up before the consultant answers.
    pub async fn cancel_request(&self, session: Uuid, actor: Uuid) -> Result<Session, Error> {
        let current = self.load_session(session).await?;
        let next = current.cancel_request(actor, self.now())?;
        let session = self.transition(SessionStatus::Requested, next).await?;
        self.cancelled(&session, &[session.consultant]).await;
        Ok(session)
    }

    async fn cancelled(&self, session: &Session, notify: &[Uuid]) {
        let reason = session.cancel_reason.map(|r| r.as_str()).unwrap_or("none");
        counter!("parley.sessions.settled",
            "kind" => session.kind.as_str(),
            "outcome" => "cancelled"
        )
        .increment(1);
        info!(session = %session.id, reason, "session cancelled");
        for account in notify {
            self.emit(*account, template::session_cancelled(session))
                .await;
        }
    }

    /// End a session as one of its participants. A live session is billed
    /// whole minutes at its captured rate; the debit and the transition to
    /// `completed` commit together.
    pub async fn end_session(&self, session: Uuid, actor: Uuid) -> Result<Settlement, Error> {
        let current = self.load_session(session).await?;
        let ended_at = self.now();
        self.finish(current, Some(actor), ended_at).await
    }

    async fn finish(
        &self,
        session: Session,
        actor: Option<Uuid>,
        ended_at: DateTime<Utc>,
    ) -> Result<Settlement, Error> {
        match session.plan_end(actor, ended_at)? {
            EndOutcome::Cancel => {
                let next = session.ended_before_pickup(ended_at);
                let session = self.transition(SessionStatus::Requested, next).await?;
                let notify = match actor {
                    Some(actor) => vec![session.counterpart(actor)],
                    None => vec![session.client, session.consultant],
                };
                self.cancelled(&session, &notify).await;
                Ok(Settlement {
                    session,
                    entry: None,
                })
            }
            EndOutcome::Bill(bill) => self.settle(session, bill, actor, ended_at).await,
        }
    }

    async fn settle(
        &self,
        session: Session,
        bill: Bill,
        actor: Option<Uuid>,
        ended_at: DateTime<Utc>,
    ) -> Result<Settlement, Error> {
        let completed = session.completed(bill, false, ended_at);
        let plan = ExecutionPlan::single(
            Operation::debit(
                session.client,
                bill.amount,
                session.kind.ledger_source(),
                session.settlement_remark(&bill),
            )
            .with_idempotency_key(&session.settlement_key()),
        );

        let result = self
            .inner
            .adapter
            .commit_session(SessionStatus::Active, &completed, &plan)
            .await;
        record_plan_metrics(&plan, matches!(result, Ok(SessionWrite::Stored { .. })));

        match result {
            Ok(SessionWrite::Stored {
                session,
                mut entries,
            }) => {
                let entry = entries.pop();
                self.settled(&session, "charged", actor).await;
                Ok(Settlement { session, entry })
            }
            Ok(SessionWrite::Stale(current)) => Err(stale(&current)),
            Err(Error::InsufficientBalance) => {
                self.shortfall(session, bill, actor, ended_at).await
            }
            Err(err) => {
                error!(session = %session.id, error = %err, "settlement failed");
                Err(err)
            }
        }
    }

    /// The client cannot cover the final charge.
    async fn shortfall(
        &self,
        session: Session,
        bill: Bill,
        actor: Option<Uuid>,
        ended_at: DateTime<Utc>,
    ) -> Result<Settlement, Error> {
        match self.config().settlement_policy {
            SettlementPolicy::Reject => {
                counter!("parley.sessions.settled",
                    "kind" => session.kind.as_str(),
                    "outcome" => "rejected"
                )
                .increment(1);
                error!(
                    session = %session.id,
                    client = %session.client,
                    amount = bill.amount,
                    "settlement debit exceeds balance, session left active"
                );
                Err(Error::InsufficientBalance)
            }
            SettlementPolicy::WaiveCharge => {
                warn!(
                    session = %session.id,
                    client = %session.client,
                    amount = bill.amount,
                    "settlement debit exceeds balance, charge waived"
                );
                let waived = session.completed(bill, true, ended_at);
                match self
                    .inner
                    .adapter
                    .commit_session(SessionStatus::Active, &waived, &ExecutionPlan::new())
                    .await?
                {
                    SessionWrite::Stored { session, .. } => {
                        self.settled(&session, "waived", actor).await;
                        Ok(Settlement {
                            session,
                            entry: None,
                        })
                    }
                    SessionWrite::Stale(current) => Err(stale(&current)),
                }
            }
        }
    }

    async fn settled(&self, session: &Session, outcome: &'static str, actor: Option<Uuid>) {
        counter!("parley.sessions.settled",
            "kind" => session.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("parley.settlement.amount").record(session.charged_amount as f64);
        info!(
            session = %session.id,
            minutes = session.duration_minutes,
            charged = session.charged_amount,
            waived = session.waived_amount,
            outcome,
            "session settled"
        );

        // the payer hears about a system-ended session
        let recipient = actor
            .map(|actor| session.counterpart(actor))
            .unwrap_or(session.client);
        self.emit(recipient, template::session_completed(session))
            .await;
    }

    /// Visible to its two participants only.
    pub async fn session(&self, id: Uuid, actor: Uuid) -> Result<Session, Error> {
        let session = self.load_session(id).await?;
        session.ensure_participant(actor)?;
        Ok(session)
    }

    /// Sessions the account took part in on either side, newest first.
    pub async fn session_history(
        &self,
        participant: Uuid,
        query: SessionQuery,
    ) -> Result<Page<Session>, Error> {
        let query = query.normalized(self.config());
        self.inner
            .adapter
            .query_sessions(participant, &query)
            .await
    }

    /// Ringing and live sessions of the account.
    pub async fn active_sessions(&self, participant: Uuid) -> Result<Vec<Session>, Error> {
        let query = SessionQuery::new()
            .live_only()
            .page(1, self.config().max_page_limit)
            .normalized(self.config());
        Ok(self
            .inner
            .adapter
            .query_sessions(participant, &query)
            .await?
            .items)
    }

    /// Media credential for a participant of a session that has not ended.
    pub async fn issue_media_token(&self, session: Uuid, actor: Uuid) -> Result<MediaToken, Error> {
        let session = self.load_session(session).await?;
        session.ensure_participant(actor)?;
        if session.status.is_terminal() {
            return Err(Error::InvalidState(InvalidState::NotLive));
        }

        let issuer = self
            .inner
            .issuer
            .as_ref()
            .ok_or_else(|| Error::DependencyFailure("no media token issuer".to_string()))?;
        let grant = MediaGrant {
            channel: session.channel.clone(),
            uid: media::participant_uid(actor),
            role: MediaRole::Publisher,
            expires_at: self.now() + self.config().token_ttl(),
        };

        issuer.issue(grant).await.map_err(|err| match err {
            Error::DependencyFailure(_) => err,
            other => Error::DependencyFailure(other.to_string()),
        })
    }

    /// Cancel calls that rang longer than the ring timeout.
    pub async fn expire_unanswered_calls(&self) -> Result<Vec<Session>, Error> {
        let now = self.now();
        let cutoff = now - self.config().ring_timeout();
        let due = self
            .inner
            .adapter
            .sessions_started_before(SessionStatus::Requested, cutoff, REAP_BATCH)
            .await?;

        let mut expired = Vec::with_capacity(due.len());
        for session in due {
            let next = match session.expire(now) {
                Ok(next) => next,
                Err(_) => continue,
            };
            match self.transition(SessionStatus::Requested, next).await {
                Ok(session) => {
                    self.cancelled(&session, &[session.client, session.consultant])
                        .await;
                    expired.push(session);
                }
                // answered or hung up since the scan
                Err(err) => debug!(session = %session.id, error = %err, "expiry skipped"),
            }
        }
        Ok(expired)
    }

    /// Force-end sessions running past the maximum length. The bill stops
    /// at the cap, not at the time of the sweep.
    pub async fn end_overdue_sessions(&self) -> Result<Vec<Settlement>, Error> {
        let now = self.now();
        let max = self.config().max_session();
        let due = self
            .inner
            .adapter
            .sessions_started_before(SessionStatus::Active, now - max, REAP_BATCH)
            .await?;

        let mut ended = Vec::with_capacity(due.len());
        for session in due {
            let id = session.id;
            let ended_at = (session.started_at + max).min(now);
            match self.finish(session, None, ended_at).await {
                Ok(settlement) => ended.push(settlement),
                Err(err) => warn!(session = %id, error = %err, "overdue session not ended"),
            }
        }
        Ok(ended)
    }

    /// One sweep of both timeouts.
    pub async fn reap(&self) -> Result<ReapReport, Error> {
        let expired = self.expire_unanswered_calls().await?;
        let ended = self.end_overdue_sessions().await?;
        if !expired.is_empty() || !ended.is_empty() {
            info!(
                expired = expired.len(),
                ended = ended.len(),
                "reaper sweep"
            );
        }
        Ok(ReapReport { expired, ended })
    }

    /// Run [`Marketplace::reap`] every `reaper_interval_secs` until the
    /// handle is aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let market = self.clone();
        let period = self.config().reaper_interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = market.reap().await {
                    warn!(error = %err, "reaper sweep failed");
                }
            }
        })
    }
}
