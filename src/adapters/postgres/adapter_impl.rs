use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledger::adapters::postgres::{PostgresLedger, open_account_tx};
use ledger::{ExecutionPlan, LedgerAdapter, Page};
use uuid::Uuid;

use super::PostgresAdapter;
use super::helper::{NOTIFICATION_COLUMNS, PROFILE_COLUMNS, REVIEW_COLUMNS, is_unique_violation};
use crate::{
    ConsultantProfile, Error, ProfilePatch,
    adapters::{Adapter, OrderWrite, SessionRequest, SessionWrite},
    notify::{Inbox, Notification, NotificationQuery, NotificationSettings},
    payment::PaymentOrder,
    review::{Review, ReviewQuery, ReviewScope},
    session::{Session, SessionQuery, SessionStatus},
};

#[async_trait::async_trait]
impl Adapter for PostgresAdapter {
    fn ledger_adapter(&self) -> Arc<dyn LedgerAdapter> {
        Arc::new(PostgresLedger::from_pool(self.pool.clone()))
    }

    async fn insert_profile(&self, profile: ConsultantProfile) -> Result<ConsultantProfile, Error> {
        let mut tx = self.pool.begin().await?;
        open_account_tx(&mut tx, profile.id).await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO consultant_profiles ({PROFILE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#
        ))
        .bind(profile.id)
        .bind(&profile.display_name)
        .bind(profile.chat_rate as i64)
        .bind(profile.call_rate as i64)
        .bind(profile.available)
        .bind(profile.rating)
        .bind(profile.review_count as i64)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::Conflict(format!(
                    "consultant {} already registered",
                    profile.id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(profile)
    }

    async fn fetch_profile(&self, id: Uuid) -> Result<Option<ConsultantProfile>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM consultant_profiles WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row_to_profile).transpose()
    }

    async fn patch_profile(
        &self,
        id: Uuid,
        patch: &ProfilePatch,
        now: DateTime<Utc>,
    ) -> Result<ConsultantProfile, Error> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE consultant_profiles
            SET available = COALESCE($2, available),
                chat_rate = COALESCE($3, chat_rate),
                call_rate = COALESCE($4, call_rate),
                updated_at = $5
            WHERE id = $1
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(patch.available)
        .bind(patch.chat_rate.map(|r| r as i64))
        .bind(patch.call_rate.map(|r| r as i64))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("consultant", id))?;
        Self::map_row_to_profile(&row)
    }

    async fn begin_session(&self, request: SessionRequest) -> Result<Session, Error> {
        self.begin_session_tx(request).await
    }

    async fn fetch_session(&self, id: Uuid) -> Result<Option<Session>, Error> {
        self.fetch_session_row(id).await
    }

    async fn commit_session(
        &self,
        expected: SessionStatus,
        next: &Session,
        plan: &ExecutionPlan,
    ) -> Result<SessionWrite, Error> {
        self.commit_session_tx(expected, next, plan).await
    }

    async fn query_sessions(
        &self,
        participant: Uuid,
        query: &SessionQuery,
    ) -> Result<Page<Session>, Error> {
        self.query_session_rows(participant, query).await
    }

    async fn sessions_started_before(
        &self,
        status: SessionStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Session>, Error> {
        self.sessions_started_before_rows(status, before, limit)
            .await
    }

    async fn insert_order(&self, order: &PaymentOrder) -> Result<(), Error> {
        self.insert_order_row(order).await
    }

    async fn fetch_order(&self, id: &str) -> Result<Option<PaymentOrder>, Error> {
        self.fetch_order_row(id).await
    }

    async fn settle_order(
        &self,
        id: &str,
        payment_id: &str,
        plan: &ExecutionPlan,
        now: DateTime<Utc>,
    ) -> Result<OrderWrite, Error> {
        self.settle_order_tx(id, payment_id, plan, now).await
    }

    async fn insert_review(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        self.insert_review_tx(review).await
    }

    async fn update_review(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        self.update_review_tx(review).await
    }

    async fn delete_review(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        self.delete_review_tx(review).await
    }

    async fn fetch_review(&self, id: Uuid) -> Result<Option<Review>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row_to_review).transpose()
    }

    async fn query_reviews(
        &self,
        scope: ReviewScope,
        query: &ReviewQuery,
    ) -> Result<Page<Review>, Error> {
        self.query_review_rows(scope, query).await
    }

    async fn consultant_ratings(&self, consultant: Uuid) -> Result<Vec<u8>, Error> {
        let ratings: Vec<i16> =
            sqlx::query_scalar("SELECT rating FROM reviews WHERE consultant = $1")
                .bind(consultant)
                .fetch_all(&self.pool)
                .await?;
        Ok(ratings.into_iter().map(|r| r as u8).collect())
    }

    async fn recompute_rating(&self, consultant: Uuid) -> Result<ConsultantProfile, Error> {
        self.recompute_rating_row(consultant).await
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), Error> {
        sqlx::query(&format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(notification.id)
        .bind(notification.account)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.category.as_str())
        .bind(&notification.payload)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_notifications(
        &self,
        account: Uuid,
        query: &NotificationQuery,
    ) -> Result<Inbox, Error> {
        let category = query.category.map(|c| c.as_str());

        let unread: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE account = $1 AND NOT read",
        )
        .bind(account)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE account = $1
              AND (NOT $2 OR NOT read)
              AND ($3::TEXT IS NULL OR category = $3)
            "#,
        )
        .bind(account)
        .bind(query.unread_only)
        .bind(category)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE account = $1
              AND (NOT $2 OR NOT read)
              AND ($3::TEXT IS NULL OR category = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(account)
        .bind(query.unread_only)
        .bind(category)
        .bind(query.limit as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(Self::map_row_to_notification)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Inbox {
            page: Page::new(items, query.page, query.limit, total as u64),
            unread: unread as u64,
        })
    }

    async fn mark_notifications_read(
        &self,
        account: Uuid,
        id: Option<Uuid>,
    ) -> Result<u64, Error> {
        let updated = sqlx::query(
            r#"
            UPDATE notifications SET read = TRUE
            WHERE account = $1 AND NOT read AND ($2::UUID IS NULL OR id = $2)
            "#,
        )
        .bind(account)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn delete_notification(&self, account: Uuid, id: Uuid) -> Result<(), Error> {
        let deleted = sqlx::query("DELETE FROM notifications WHERE id = $1 AND account = $2")
            .bind(id)
            .bind(account)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::not_found("notification", id));
        }
        Ok(())
    }

    async fn notification_settings(&self, account: Uuid) -> Result<NotificationSettings, Error> {
        let row = sqlx::query(
            r#"
            SELECT account, push_enabled, chat, call, payment, promotional
            FROM notification_settings
            WHERE account = $1
            "#,
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::map_row_to_settings(&row),
            None => Ok(NotificationSettings::defaults_for(account)),
        }
    }

    async fn save_notification_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO notification_settings
                (account, push_enabled, chat, call, payment, promotional)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account) DO UPDATE SET
                push_enabled = EXCLUDED.push_enabled,
                chat = EXCLUDED.chat,
                call = EXCLUDED.call,
                payment = EXCLUDED.payment,
                promotional = EXCLUDED.promotional
            RETURNING account, push_enabled, chat, call, payment, promotional
            "#,
        )
        .bind(settings.account)
        .bind(settings.push_enabled)
        .bind(settings.chat)
        .bind(settings.call)
        .bind(settings.payment)
        .bind(settings.promotional)
        .fetch_one(&self.pool)
        .await?;
        Self::map_row_to_settings(&row)
    }
}
