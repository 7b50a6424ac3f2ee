#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{ExecutionPlan, LedgerAdapter, LedgerEntry, Page};
use uuid::Uuid;

use crate::{
    ConsultantProfile, Error, ProfilePatch,
    payment::PaymentOrder,
    notify::{Inbox, Notification, NotificationQuery, NotificationSettings},
    review::{Review, ReviewQuery, ReviewScope},
    session::{Session, SessionKind, SessionQuery, SessionStatus},
};

/// Everything a store needs to open a session under lock.
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest {
    pub client: Uuid,
    pub consultant: Uuid,
    pub kind: SessionKind,
    pub min_balance_minutes: u32,
    pub now: DateTime<Utc>,
}

/// Result of a guarded session write.
#[derive(Debug, Clone)]
pub enum SessionWrite {
    Stored {
        session: Session,
        entries: Vec<LedgerEntry>,
    },
    /// Status had moved on; nothing was written. Carries the current row.
    Stale(Session),
}

/// Result of settling a payment order.
#[derive(Debug, Clone)]
pub enum OrderWrite {
    Paid {
        order: PaymentOrder,
        entry: LedgerEntry,
    },
    /// Someone else paid the order first; nothing was written.
    AlreadyPaid(PaymentOrder),
}

/// -----------------------------
/// Adapter contract
/// -----------------------------
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Ledger view sharing this store's storage.
    fn ledger_adapter(&self) -> Arc<dyn LedgerAdapter>;

    /* ---------------- PROFILES ---------------- */
    /// Insert a profile and open its wallet. `Conflict` if it exists.
    async fn insert_profile(&self, profile: ConsultantProfile) -> Result<ConsultantProfile, Error>;
    async fn fetch_profile(&self, id: Uuid) -> Result<Option<ConsultantProfile>, Error>;
    async fn patch_profile(
        &self,
        id: Uuid,
        patch: &ProfilePatch,
        now: DateTime<Utc>,
    ) -> Result<ConsultantProfile, Error>;

    /* ---------------- SESSIONS ---------------- */
    /// Within one unit of work: lock the consultant profile and the
    /// client's account, run [`crate::eligibility::evaluate`] against the
    /// locked rows, insert the session with the rate snapshot.
    async fn begin_session(&self, request: SessionRequest) -> Result<Session, Error>;

    async fn fetch_session(&self, id: Uuid) -> Result<Option<Session>, Error>;

    /// Within one unit of work: lock the session, compare its status with
    /// `expected` (return `Stale` on mismatch), execute `plan` against the
    /// ledger, write `next`. Any ledger error rolls everything back.
    async fn commit_session(
        &self,
        expected: SessionStatus,
        next: &Session,
        plan: &ExecutionPlan,
    ) -> Result<SessionWrite, Error>;

    /// Sessions where `participant` is client or consultant, newest first.
    async fn query_sessions(
        &self,
        participant: Uuid,
        query: &SessionQuery,
    ) -> Result<Page<Session>, Error>;

    /// Sessions in `status` whose billing clock started before `before`.
    async fn sessions_started_before(
        &self,
        status: SessionStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Session>, Error>;

    /* ---------------- PAYMENTS ---------------- */
    /// `Conflict` when the order id is taken.
    async fn insert_order(&self, order: &PaymentOrder) -> Result<(), Error>;
    async fn fetch_order(&self, id: &str) -> Result<Option<PaymentOrder>, Error>;
    /// Within one unit of work: lock the order (`AlreadyPaid` if it is),
    /// execute the single-credit `plan`, store the order as paid.
    async fn settle_order(
        &self,
        id: &str,
        payment_id: &str,
        plan: &ExecutionPlan,
        now: DateTime<Utc>,
    ) -> Result<OrderWrite, Error>;

    /* ---------------- REVIEWS ---------------- */
    /// Insert and recompute the consultant aggregate in one unit of work.
    /// `Conflict` when the session already has a review.
    async fn insert_review(&self, review: &Review) -> Result<ConsultantProfile, Error>;
    async fn update_review(&self, review: &Review) -> Result<ConsultantProfile, Error>;
    async fn delete_review(&self, review: &Review) -> Result<ConsultantProfile, Error>;
    async fn fetch_review(&self, id: Uuid) -> Result<Option<Review>, Error>;
    async fn query_reviews(
        &self,
        scope: ReviewScope,
        query: &ReviewQuery,
    ) -> Result<Page<Review>, Error>;
    async fn consultant_ratings(&self, consultant: Uuid) -> Result<Vec<u8>, Error>;
    async fn recompute_rating(&self, consultant: Uuid) -> Result<ConsultantProfile, Error>;

    /* ---------------- NOTIFICATIONS ---------------- */
    async fn insert_notification(&self, notification: &Notification) -> Result<(), Error>;
    async fn query_notifications(
        &self,
        account: Uuid,
        query: &NotificationQuery,
    ) -> Result<Inbox, Error>;
    /// Mark one notification (or all when `id` is `None`) as read.
    /// Returns how many changed.
    async fn mark_notifications_read(&self, account: Uuid, id: Option<Uuid>)
    -> Result<u64, Error>;
    async fn delete_notification(&self, account: Uuid, id: Uuid) -> Result<(), Error>;
    /// Stored settings, or the defaults when none were saved.
    async fn notification_settings(&self, account: Uuid) -> Result<NotificationSettings, Error>;
    async fn save_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, Error>;
}
