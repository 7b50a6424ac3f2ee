//! # Parley
//!
//! Backend core for a consultation marketplace: clients fund a prepaid
//! wallet and spend it on metered chat, voice and video sessions with
//! consultants.
//!
//! ## What's inside
//!
//! ### Wallet ledger
//! Balances live in [`ledger`]. Every mutation is an append-only entry and
//! every debit checks the balance under a lock, so concurrent debits can
//! never overdraw an account.
//!
//! ### Metered sessions
//! A session passes the eligibility gate (consultant available, client
//! holds at least five minutes of the rate), rings if it is a call, runs,
//! and is settled at the end: whole minutes rounded up times the rate
//! captured at start. The final debit and the transition to `completed`
//! commit together or not at all.
//!
//! ```rust,ignore
//! let market = Marketplace::builder(MemoryAdapter::new())
//!     .token_issuer(HmacTokenIssuer::new("app-id", certificate)?)
//!     .channel(LogChannel)
//!     .build()?;
//!
//! let session = market.start_session(client, consultant, SessionKind::Voice).await?;
//! market.accept_call(session.id, consultant).await?;
//! let settlement = market.end_session(session.id, client).await?;
//! ```
//!
//! ### Reviews and notifications
//! Reviews recompute the consultant's rating in the same unit of work.
//! Notifications are stored, then delivered best-effort; a failed delivery
//! never fails the operation that caused it.
pub mod adapters;
pub mod clock;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod media;
pub mod notify;
pub mod payment;
pub mod profile;
pub mod review;
pub mod session;

pub use ledger;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledger::{
    Account, EntryQuery, ExecutionPlan, LedgerAdapter, LedgerContext, LedgerEntry, Operation,
    Page, Source, WalletSummary, record_plan_metrics,
};
use tracing::{info, warn};
use uuid::Uuid;

pub use crate::adapters::Adapter;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{MarketConfig, SettlementPolicy};
pub use crate::eligibility::Quote;
pub use crate::error::{Error, InvalidState};
pub use crate::media::{HmacTokenIssuer, MediaGrant, MediaRole, MediaToken, TokenIssuer};
pub use crate::notify::{
    BroadcastChannel, Category, DeliveryChannel, Inbox, LogChannel, Notification,
    NotificationDraft, NotificationQuery, NotificationSettings, SettingsPatch,
};
pub use crate::payment::{OrderStatus, PaymentConfirmation, PaymentOrder, PaymentReceipt};
pub use crate::profile::{ConsultantProfile, ProfilePatch};
pub use crate::review::{Review, ReviewQuery, ReviewScope, ReviewStats};
pub use crate::session::{
    CancelReason, ReapReport, Session, SessionKind, SessionQuery, SessionStatus, Settlement,
};

use crate::adapters::OrderWrite;
use crate::notify::{Dispatcher, template};

/// The marketplace engine. Cheap to clone; every clone shares one set of
/// collaborators.
#[derive(Clone)]
pub struct Marketplace {
    inner: Arc<Parley>,
}

struct Parley {
    adapter: Arc<dyn Adapter>,
    ledger: LedgerContext,
    issuer: Option<Arc<dyn TokenIssuer>>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    config: MarketConfig,
}

pub struct MarketplaceBuilder {
    adapter: Arc<dyn Adapter>,
    issuer: Option<Arc<dyn TokenIssuer>>,
    channels: Vec<Arc<dyn DeliveryChannel>>,
    clock: Arc<dyn Clock>,
    config: MarketConfig,
}

impl MarketplaceBuilder {
    pub fn config(mut self, config: MarketConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn token_issuer(mut self, issuer: impl TokenIssuer) -> Self {
        self.issuer = Some(Arc::new(issuer));
        self
    }

    /// Add a delivery channel. Channels run in the order added.
    pub fn channel(mut self, channel: impl DeliveryChannel) -> Self {
        self.channels.push(Arc::new(channel));
        self
    }

    pub fn channels(mut self, channels: impl IntoIterator<Item = Arc<dyn DeliveryChannel>>) -> Self {
        self.channels.extend(channels);
        self
    }

    pub fn build(self) -> Result<Marketplace, Error> {
        self.config.validate()?;
        let ledger = LedgerContext::new(self.adapter.ledger_adapter());
        let dispatcher = Dispatcher::new(self.channels, self.config.delivery_timeout());

        Ok(Marketplace {
            inner: Arc::new(Parley {
                adapter: self.adapter,
                ledger,
                issuer: self.issuer,
                dispatcher,
                clock: self.clock,
                config: self.config,
            }),
        })
    }
}

impl Marketplace {
    pub fn builder(adapter: impl Adapter) -> MarketplaceBuilder {
        MarketplaceBuilder {
            adapter: Arc::new(adapter),
            issuer: None,
            channels: Vec::new(),
            clock: Arc::new(SystemClock),
            config: MarketConfig::default(),
        }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn ledger_ctx(&self) -> LedgerContext {
        self.inner.ledger.clone()
    }

    fn ledger(&self) -> &dyn LedgerAdapter {
        self.inner.ledger.adapter()
    }

    // ==================== Wallet ====================

    /// Open a zero-balance wallet for a client. Idempotent.
    pub async fn register_account(&self, id: Uuid) -> Result<Account, Error> {
        let account = self.ledger().open_account(id).await?;
        info!(account = %id, "account registered");
        Ok(account)
    }

    pub async fn account(&self, id: Uuid) -> Result<Account, Error> {
        Ok(self.ledger().get_account(id).await?)
    }

    pub async fn balance(&self, account: Uuid) -> Result<u64, Error> {
        Ok(self.inner.ledger.balance(account).await?)
    }

    /// Manual credit by an operator.
    pub async fn credit(
        &self,
        account: Uuid,
        amount: u64,
        remark: impl Into<String>,
    ) -> Result<LedgerEntry, Error> {
        Ok(self
            .inner
            .ledger
            .credit(account, amount, Source::AdminAdjustment, remark)
            .await?)
    }

    /// Manual debit by an operator. Never overdraws.
    pub async fn debit(
        &self,
        account: Uuid,
        amount: u64,
        remark: impl Into<String>,
    ) -> Result<LedgerEntry, Error> {
        Ok(self
            .inner
            .ledger
            .debit(account, amount, Source::AdminAdjustment, remark)
            .await?)
    }

    pub async fn transactions(
        &self,
        account: Uuid,
        mut query: EntryQuery,
    ) -> Result<Page<LedgerEntry>, Error> {
        query.limit = self.inner.config.page_limit(query.limit);
        Ok(self.ledger().query_entries(account, &query).await?)
    }

    pub async fn transaction(&self, account: Uuid, entry_id: Uuid) -> Result<LedgerEntry, Error> {
        Ok(self.ledger().get_entry(account, entry_id).await?)
    }

    pub async fn wallet_summary(&self, account: Uuid) -> Result<WalletSummary, Error> {
        Ok(self.ledger().summary(account).await?)
    }

    pub async fn set_blocked(&self, account: Uuid, blocked: bool) -> Result<Account, Error> {
        let account = self.ledger().set_blocked(account, blocked).await?;
        info!(account = %account.id, blocked, "account block flag changed");
        Ok(account)
    }

    /// Record a gateway order before checkout. The account and amount
    /// stored here are what a later confirmation credits.
    pub async fn create_order(
        &self,
        account: Uuid,
        amount: u64,
        order_id: impl Into<String>,
    ) -> Result<PaymentOrder, Error> {
        let order = PaymentOrder::new(order_id, account, amount, self.now())?;
        self.inner.adapter.insert_order(&order).await?;
        info!(account = %account, amount, order_id = %order.id, "payment order created");
        Ok(order)
    }

    pub async fn order(&self, id: &str) -> Result<PaymentOrder, Error> {
        self.inner
            .adapter
            .fetch_order(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("order {id}")))
    }

    /// Credit a verified gateway payment against its stored order. Replays
    /// return the original entry and change nothing.
    pub async fn confirm_payment(
        &self,
        confirmation: PaymentConfirmation,
    ) -> Result<PaymentReceipt, Error> {
        confirmation.validate()?;
        let secret = self
            .inner
            .config
            .gateway_secret
            .as_deref()
            .ok_or_else(|| Error::Config("gateway_secret is not configured".to_string()))?;

        if let Err(err) = payment::verify_signature(secret, &confirmation) {
            warn!(
                order_id = %confirmation.order_id,
                payment_id = %confirmation.payment_id,
                "payment signature rejected"
            );
            return Err(err);
        }

        let order = self.order(&confirmation.order_id).await?;
        if order.is_paid() {
            return self.replayed_payment(&order, &confirmation).await;
        }

        let plan = ExecutionPlan::single(
            Operation::credit(
                order.account,
                order.amount,
                Source::GatewayPayment,
                format!("Wallet recharge via gateway order {}", order.id),
            )
            .with_idempotency_key(&confirmation.idempotency_key()),
        );
        let written = self
            .inner
            .adapter
            .settle_order(&order.id, &confirmation.payment_id, &plan, self.now())
            .await;
        record_plan_metrics(&plan, matches!(written, Ok(OrderWrite::Paid { .. })));

        match written? {
            OrderWrite::Paid { order, entry } => {
                info!(
                    account = %order.account,
                    amount = order.amount,
                    payment_id = %confirmation.payment_id,
                    "payment credited"
                );
                self.emit(
                    order.account,
                    template::payment_received(order.amount, &order.id, entry.balance_after),
                )
                .await;
                Ok(PaymentReceipt {
                    entry,
                    replayed: false,
                })
            }
            OrderWrite::AlreadyPaid(current) => {
                self.replayed_payment(&current, &confirmation).await
            }
        }
    }

    async fn replayed_payment(
        &self,
        order: &PaymentOrder,
        confirmation: &PaymentConfirmation,
    ) -> Result<PaymentReceipt, Error> {
        let entry_id = match (&order.payment_id, order.entry_id) {
            (Some(paid_with), Some(entry_id)) if *paid_with == confirmation.payment_id => entry_id,
            _ => {
                return Err(Error::Conflict(format!(
                    "order {} was already paid by another payment",
                    order.id
                )));
            }
        };
        let entry = self.ledger().get_entry(order.account, entry_id).await?;
        info!(payment_id = %confirmation.payment_id, "payment confirmation replayed");
        Ok(PaymentReceipt {
            entry,
            replayed: true,
        })
    }

    // ==================== Profiles ====================

    pub async fn register_consultant(
        &self,
        profile: ConsultantProfile,
    ) -> Result<ConsultantProfile, Error> {
        profile.validate()?;
        let profile = profile.registered(self.now());
        let profile = self.inner.adapter.insert_profile(profile).await?;
        info!(consultant = %profile.id, "consultant registered");
        Ok(profile)
    }

    pub async fn profile(&self, id: Uuid) -> Result<ConsultantProfile, Error> {
        self.inner
            .adapter
            .fetch_profile(id)
            .await?
            .ok_or_else(|| Error::not_found("consultant", id))
    }

    /// Only the consultant toggles their own availability.
    pub async fn set_availability(
        &self,
        consultant: Uuid,
        actor: Uuid,
        available: bool,
    ) -> Result<ConsultantProfile, Error> {
        ensure_self(consultant, actor)?;
        let patch = ProfilePatch {
            available: Some(available),
            ..Default::default()
        };
        let profile = self
            .inner
            .adapter
            .patch_profile(consultant, &patch, self.now())
            .await?;
        info!(consultant = %consultant, available, "availability changed");
        Ok(profile)
    }

    /// New rates apply to sessions started afterwards.
    pub async fn update_rates(
        &self,
        consultant: Uuid,
        actor: Uuid,
        chat_rate: u64,
        call_rate: u64,
    ) -> Result<ConsultantProfile, Error> {
        ensure_self(consultant, actor)?;
        profile::validate_rates(chat_rate, call_rate)?;
        let patch = ProfilePatch {
            chat_rate: Some(chat_rate),
            call_rate: Some(call_rate),
            ..Default::default()
        };
        let profile = self
            .inner
            .adapter
            .patch_profile(consultant, &patch, self.now())
            .await?;
        info!(consultant = %consultant, chat_rate, call_rate, "rates updated");
        Ok(profile)
    }

    // ==================== Eligibility ====================

    pub async fn check_eligibility(
        &self,
        client: Uuid,
        consultant: Uuid,
        kind: SessionKind,
    ) -> Result<Quote, Error> {
        let profile = self.profile(consultant).await?;
        let account = self.account(client).await?;
        eligibility::evaluate(
            &profile,
            &account,
            kind,
            self.inner.config.min_balance_minutes,
        )
    }

    // ==================== Reviews ====================

    /// Review a completed session. One review per session.
    pub async fn create_review(
        &self,
        client: Uuid,
        session: Uuid,
        rating: u8,
        comment: impl Into<String>,
    ) -> Result<Review, Error> {
        let session = self
            .inner
            .adapter
            .fetch_session(session)
            .await?
            .ok_or_else(|| Error::not_found("session", session))?;
        if session.client != client {
            return Err(Error::Forbidden(format!(
                "session {} belongs to another client",
                session.id
            )));
        }
        if session.status != SessionStatus::Completed {
            return Err(Error::InvalidState(InvalidState::NotCompleted));
        }

        let review = Review::new(
            client,
            session.consultant,
            session.id,
            rating,
            comment,
            self.now(),
        )?;
        let profile = self.inner.adapter.insert_review(&review).await?;
        info!(
            review = %review.id,
            consultant = %profile.id,
            rating = profile.rating,
            review_count = profile.review_count,
            "review created"
        );
        self.emit(
            session.consultant,
            template::review_received(rating, session.id),
        )
        .await;
        Ok(review)
    }

    pub async fn update_review(
        &self,
        review: Uuid,
        client: Uuid,
        rating: u8,
        comment: impl Into<String>,
    ) -> Result<Review, Error> {
        let current = self.review(review).await?;
        current.ensure_author(client)?;
        let revised = current.revised(rating, comment, self.now())?;
        let profile = self.inner.adapter.update_review(&revised).await?;
        info!(
            review = %revised.id,
            consultant = %profile.id,
            rating = profile.rating,
            "review updated"
        );
        Ok(revised)
    }

    pub async fn delete_review(&self, review: Uuid, client: Uuid) -> Result<(), Error> {
        let current = self.review(review).await?;
        current.ensure_author(client)?;
        let profile = self.inner.adapter.delete_review(&current).await?;
        info!(
            review = %current.id,
            consultant = %profile.id,
            rating = profile.rating,
            review_count = profile.review_count,
            "review deleted"
        );
        Ok(())
    }

    pub async fn review(&self, id: Uuid) -> Result<Review, Error> {
        self.inner
            .adapter
            .fetch_review(id)
            .await?
            .ok_or_else(|| Error::not_found("review", id))
    }

    pub async fn reviews_for_consultant(
        &self,
        consultant: Uuid,
        query: ReviewQuery,
    ) -> Result<Page<Review>, Error> {
        let query = query.normalized(&self.inner.config);
        self.inner
            .adapter
            .query_reviews(ReviewScope::Consultant(consultant), &query)
            .await
    }

    pub async fn reviews_by_client(
        &self,
        client: Uuid,
        query: ReviewQuery,
    ) -> Result<Page<Review>, Error> {
        let query = query.normalized(&self.inner.config);
        self.inner
            .adapter
            .query_reviews(ReviewScope::Client(client), &query)
            .await
    }

    pub async fn review_stats(&self, consultant: Uuid) -> Result<ReviewStats, Error> {
        self.profile(consultant).await?;
        let ratings = self.inner.adapter.consultant_ratings(consultant).await?;
        Ok(ReviewStats::from_ratings(consultant, &ratings))
    }

    /// Rebuild the stored aggregate from the current review set.
    pub async fn recompute_rating(&self, consultant: Uuid) -> Result<ConsultantProfile, Error> {
        self.inner.adapter.recompute_rating(consultant).await
    }

    // ==================== Notifications ====================

    /// Persist, then hand to the delivery channels in the background.
    pub async fn notify(
        &self,
        account: Uuid,
        draft: NotificationDraft,
    ) -> Result<Notification, Error> {
        draft.validate()?;
        let notification = Notification::new(account, draft, self.now());
        self.inner
            .adapter
            .insert_notification(&notification)
            .await?;

        let settings = match self.inner.adapter.notification_settings(account).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(account = %account, error = %err, "settings unavailable, using defaults");
                NotificationSettings::defaults_for(account)
            }
        };
        self.inner.dispatcher.dispatch(&notification, &settings);
        Ok(notification)
    }

    /// Bulk and promotional sends. Every account gets its own record and its
    /// own settings check; an account that fails is logged and skipped.
    pub async fn notify_many(
        &self,
        accounts: impl IntoIterator<Item = Uuid>,
        draft: NotificationDraft,
    ) -> Result<Vec<Notification>, Error> {
        draft.validate()?;
        let mut seen = std::collections::HashSet::new();
        let mut stored = Vec::new();
        let mut failed = 0u64;
        for account in accounts.into_iter().filter(|a| seen.insert(*a)) {
            match self.notify(account, draft.clone()).await {
                Ok(notification) => stored.push(notification),
                Err(err) => {
                    failed += 1;
                    warn!(account = %account, error = %err, "bulk notification skipped");
                }
            }
        }
        info!(
            category = %draft.category,
            sent = stored.len(),
            failed,
            "bulk notification sent"
        );
        Ok(stored)
    }

    /// Side-effect notification; failures are logged and dropped.
    pub(crate) async fn emit(&self, account: Uuid, draft: NotificationDraft) {
        let category = draft.category;
        if let Err(err) = self.notify(account, draft).await {
            warn!(account = %account, category = %category, error = %err, "notification dropped");
        }
    }

    pub async fn notifications(
        &self,
        account: Uuid,
        query: NotificationQuery,
    ) -> Result<Inbox, Error> {
        let query = query.normalized(&self.inner.config);
        self.inner.adapter.query_notifications(account, &query).await
    }

    /// Returns false when it was already read.
    pub async fn mark_read(&self, account: Uuid, notification: Uuid) -> Result<bool, Error> {
        Ok(self
            .inner
            .adapter
            .mark_notifications_read(account, Some(notification))
            .await?
            > 0)
    }

    pub async fn mark_all_read(&self, account: Uuid) -> Result<u64, Error> {
        self.inner
            .adapter
            .mark_notifications_read(account, None)
            .await
    }

    pub async fn delete_notification(&self, account: Uuid, notification: Uuid) -> Result<(), Error> {
        self.inner
            .adapter
            .delete_notification(account, notification)
            .await
    }

    pub async fn notification_settings(
        &self,
        account: Uuid,
    ) -> Result<NotificationSettings, Error> {
        self.inner.adapter.notification_settings(account).await
    }

    pub async fn update_notification_settings(
        &self,
        account: Uuid,
        patch: SettingsPatch,
    ) -> Result<NotificationSettings, Error> {
        let mut settings = self.inner.adapter.notification_settings(account).await?;
        patch.apply(&mut settings);
        self.inner
            .adapter
            .save_notification_settings(&settings)
            .await
    }
}

fn ensure_self(owner: Uuid, actor: Uuid) -> Result<(), Error> {
    if owner == actor {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "{actor} cannot change consultant {owner}"
        )))
    }
}
