//! In-process store. One mutex guards every table, ledger included, so each
//! trait method is a single atomic unit of work.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::adapters::MemoryLedgerState;
use ledger::{
    Account, EntryQuery, ExecutionPlan, LedgerAdapter, LedgerEntry, LedgerError, Page,
    WalletSummary,
};
use uuid::Uuid;

use super::{Adapter, OrderWrite, SessionRequest, SessionWrite};
use crate::{
    ConsultantProfile, Error, ProfilePatch, eligibility,
    payment::PaymentOrder,
    notify::{Inbox, Notification, NotificationQuery, NotificationSettings},
    review::{self, Review, ReviewQuery, ReviewScope},
    session::{Session, SessionQuery, SessionStatus},
};

#[derive(Debug, Default)]
struct MarketState {
    ledger: MemoryLedgerState,
    profiles: HashMap<Uuid, ConsultantProfile>,
    sessions: HashMap<Uuid, Session>,
    reviews: HashMap<Uuid, Review>,
    orders: HashMap<String, PaymentOrder>,
    /// Insertion order, oldest first.
    notifications: Vec<Notification>,
    settings: HashMap<Uuid, NotificationSettings>,
}

impl MarketState {
    fn profile_mut(&mut self, id: Uuid) -> Result<&mut ConsultantProfile, Error> {
        self.profiles
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("consultant", id))
    }

    fn recompute(
        &mut self,
        consultant: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConsultantProfile, Error> {
        let ratings: Vec<u8> = self
            .reviews
            .values()
            .filter(|r| r.consultant == consultant)
            .map(|r| r.rating)
            .collect();
        let (rating, count) = review::aggregate(&ratings);

        let profile = self.profile_mut(consultant)?;
        profile.rating = rating;
        profile.review_count = count;
        profile.updated_at = now;
        Ok(profile.clone())
    }
}

#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MarketState>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MarketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sum of the account's signed entries.
    pub fn replayed_balance(&self, account: Uuid) -> i128 {
        self.state().ledger.replayed_balance(account)
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn open_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        Ok(self.state().ledger.open_account(id))
    }

    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.state().ledger.apply_plan(plan)
    }

    async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        self.state().ledger.account(id).cloned()
    }

    async fn get_entry(&self, account: Uuid, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        self.state().ledger.entry(account, entry_id)
    }

    async fn query_entries(
        &self,
        account: Uuid,
        query: &EntryQuery,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        self.state().ledger.query_entries(account, query)
    }

    async fn entry_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.state().ledger.entry_by_key(hashed_key))
    }

    async fn summary(&self, account: Uuid) -> Result<WalletSummary, LedgerError> {
        self.state().ledger.summary(account)
    }

    async fn set_blocked(&self, id: Uuid, blocked: bool) -> Result<Account, LedgerError> {
        self.state().ledger.set_blocked(id, blocked)
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn ledger_adapter(&self) -> Arc<dyn LedgerAdapter> {
        Arc::new(self.clone())
    }

    async fn insert_profile(&self, profile: ConsultantProfile) -> Result<ConsultantProfile, Error> {
        let mut state = self.state();
        if state.profiles.contains_key(&profile.id) {
            return Err(Error::Conflict(format!(
                "consultant {} already registered",
                profile.id
            )));
        }
        state.ledger.open_account(profile.id);
        state.profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn fetch_profile(&self, id: Uuid) -> Result<Option<ConsultantProfile>, Error> {
        Ok(self.state().profiles.get(&id).cloned())
    }

    async fn patch_profile(
        &self,
        id: Uuid,
        patch: &ProfilePatch,
        now: DateTime<Utc>,
    ) -> Result<ConsultantProfile, Error> {
        let mut state = self.state();
        let profile = state.profile_mut(id)?;
        patch.apply(profile, now);
        Ok(profile.clone())
    }

    async fn begin_session(&self, request: SessionRequest) -> Result<Session, Error> {
        let mut state = self.state();
        let profile = state
            .profiles
            .get(&request.consultant)
            .ok_or_else(|| Error::not_found("consultant", request.consultant))?;
        let client = state.ledger.account(request.client)?;

        let quote = eligibility::evaluate(
            profile,
            client,
            request.kind,
            request.min_balance_minutes,
        )?;

        let session = Session::new(
            request.client,
            request.consultant,
            request.kind,
            quote.rate,
            request.now,
        );
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn fetch_session(&self, id: Uuid) -> Result<Option<Session>, Error> {
        Ok(self.state().sessions.get(&id).cloned())
    }

    async fn commit_session(
        &self,
        expected: SessionStatus,
        next: &Session,
        plan: &ExecutionPlan,
    ) -> Result<SessionWrite, Error> {
        let mut state = self.state();
        let current = state
            .sessions
            .get(&next.id)
            .ok_or_else(|| Error::not_found("session", next.id))?;
        if current.status != expected {
            return Ok(SessionWrite::Stale(current.clone()));
        }

        let entries = if plan.is_empty() {
            Vec::new()
        } else {
            state.ledger.apply_plan(plan)?
        };
        state.sessions.insert(next.id, next.clone());

        Ok(SessionWrite::Stored {
            session: next.clone(),
            entries,
        })
    }

    async fn query_sessions(
        &self,
        participant: Uuid,
        query: &SessionQuery,
    ) -> Result<Page<Session>, Error> {
        let state = self.state();
        let mut matching: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.is_participant(participant) && query.matches(s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(Page::from_sorted(matching, query.page, query.limit))
    }

    async fn sessions_started_before(
        &self,
        status: SessionStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Session>, Error> {
        let state = self.state();
        let mut due: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.status == status && s.started_at < before)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.started_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn insert_order(&self, order: &PaymentOrder) -> Result<(), Error> {
        let mut state = self.state();
        state.ledger.account(order.account)?;
        if state.orders.contains_key(&order.id) {
            return Err(Error::Conflict(format!("order {} already exists", order.id)));
        }
        state.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn fetch_order(&self, id: &str) -> Result<Option<PaymentOrder>, Error> {
        Ok(self.state().orders.get(id).cloned())
    }

    async fn settle_order(
        &self,
        id: &str,
        payment_id: &str,
        plan: &ExecutionPlan,
        now: DateTime<Utc>,
    ) -> Result<OrderWrite, Error> {
        let mut state = self.state();
        let current = state
            .orders
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("order {id}")))?;
        if current.is_paid() {
            return Ok(OrderWrite::AlreadyPaid(current));
        }

        let entry = state
            .ledger
            .apply_plan(plan)?
            .pop()
            .ok_or(LedgerError::EntryNotFound)?;
        let order = current.paid(payment_id, entry.id, now);
        state.orders.insert(order.id.clone(), order.clone());
        Ok(OrderWrite::Paid { order, entry })
    }

    async fn insert_review(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        let mut state = self.state();
        if state.reviews.values().any(|r| r.session == review.session) {
            return Err(Error::Conflict(format!(
                "session {} has already been reviewed",
                review.session
            )));
        }
        state.profile_mut(review.consultant)?;
        state.reviews.insert(review.id, review.clone());
        state.recompute(review.consultant, review.updated_at)
    }

    async fn update_review(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        let mut state = self.state();
        if !state.reviews.contains_key(&review.id) {
            return Err(Error::not_found("review", review.id));
        }
        state.reviews.insert(review.id, review.clone());
        state.recompute(review.consultant, review.updated_at)
    }

    async fn delete_review(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        let mut state = self.state();
        state
            .reviews
            .remove(&review.id)
            .ok_or_else(|| Error::not_found("review", review.id))?;
        state.recompute(review.consultant, Utc::now())
    }

    async fn fetch_review(&self, id: Uuid) -> Result<Option<Review>, Error> {
        Ok(self.state().reviews.get(&id).cloned())
    }

    async fn query_reviews(
        &self,
        scope: ReviewScope,
        query: &ReviewQuery,
    ) -> Result<Page<Review>, Error> {
        let state = self.state();
        let mut matching: Vec<Review> = state
            .reviews
            .values()
            .filter(|r| match scope {
                ReviewScope::Consultant(id) => r.consultant == id,
                ReviewScope::Client(id) => r.client == id,
            })
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Page::from_sorted(matching, query.page, query.limit))
    }

    async fn consultant_ratings(&self, consultant: Uuid) -> Result<Vec<u8>, Error> {
        Ok(self
            .state()
            .reviews
            .values()
            .filter(|r| r.consultant == consultant)
            .map(|r| r.rating)
            .collect())
    }

    async fn recompute_rating(&self, consultant: Uuid) -> Result<ConsultantProfile, Error> {
        self.state().recompute(consultant, Utc::now())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), Error> {
        self.state().notifications.push(notification.clone());
        Ok(())
    }

    async fn query_notifications(
        &self,
        account: Uuid,
        query: &NotificationQuery,
    ) -> Result<Inbox, Error> {
        let state = self.state();
        let mine = || {
            state
                .notifications
                .iter()
                .rev()
                .filter(move |n| n.account == account)
        };

        let unread = mine().filter(|n| !n.read).count() as u64;
        let matching: Vec<Notification> = mine().filter(|n| query.matches(n)).cloned().collect();

        Ok(Inbox {
            page: Page::from_sorted(matching, query.page, query.limit),
            unread,
        })
    }

    async fn mark_notifications_read(
        &self,
        account: Uuid,
        id: Option<Uuid>,
    ) -> Result<u64, Error> {
        let mut state = self.state();
        let mut changed = 0;
        for n in state
            .notifications
            .iter_mut()
            .filter(|n| n.account == account && id.is_none_or(|id| n.id == id))
        {
            if !n.read {
                n.read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_notification(&self, account: Uuid, id: Uuid) -> Result<(), Error> {
        let mut state = self.state();
        let position = state
            .notifications
            .iter()
            .position(|n| n.id == id && n.account == account)
            .ok_or_else(|| Error::not_found("notification", id))?;
        state.notifications.remove(position);
        Ok(())
    }

    async fn notification_settings(&self, account: Uuid) -> Result<NotificationSettings, Error> {
        Ok(self
            .state()
            .settings
            .get(&account)
            .copied()
            .unwrap_or_else(|| NotificationSettings::defaults_for(account)))
    }

    async fn save_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, Error> {
        self.state().settings.insert(settings.account, *settings);
        Ok(*settings)
    }
}
