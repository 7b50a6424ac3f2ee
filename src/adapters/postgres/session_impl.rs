use chrono::{DateTime, Utc};
use ledger::ExecutionPlan;
use ledger::adapters::postgres::{apply_plan_tx, lock_account_tx};
use ledger::Page;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::PostgresAdapter;
use super::helper::{PROFILE_COLUMNS, SESSION_COLUMNS};
use crate::{
    Error, eligibility,
    adapters::{SessionRequest, SessionWrite},
    session::{Session, SessionQuery, SessionStatus},
};

impl PostgresAdapter {
    pub(super) async fn begin_session_tx(&self, request: SessionRequest) -> Result<Session, Error> {
        let mut tx = self.pool.begin().await?;

        // Shared lock: rate and availability cannot change under us, other
        // clients can still start sessions with this consultant.
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM consultant_profiles WHERE id = $1 FOR SHARE"
        ))
        .bind(request.consultant)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("consultant", request.consultant))?;
        let profile = Self::map_row_to_profile(&row)?;
        let client = lock_account_tx(&mut tx, request.client).await?;

        let quote = eligibility::evaluate(
            &profile,
            &client,
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
        Self::insert_session_tx(&mut tx, &session).await?;

        tx.commit().await?;
        Ok(session)
    }

    async fn insert_session_tx(
        tx: &mut Transaction<'_, Postgres>,
        session: &Session,
    ) -> Result<(), Error> {
        sqlx::query(&format!(
            r#"
            INSERT INTO sessions ({SESSION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#
        ))
        .bind(session.id)
        .bind(session.client)
        .bind(session.consultant)
        .bind(session.kind.as_str())
        .bind(session.status.as_str())
        .bind(session.rate as i64)
        .bind(&session.channel)
        .bind(session.requested_at)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.duration_minutes as i64)
        .bind(session.charged_amount as i64)
        .bind(session.waived_amount as i64)
        .bind(session.cancel_reason.map(|r| r.as_str()))
        .bind(session.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub(super) async fn fetch_session_row(&self, id: Uuid) -> Result<Option<Session>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row_to_session).transpose()
    }

    pub(super) async fn commit_session_tx(
        &self,
        expected: SessionStatus,
        next: &Session,
        plan: &ExecutionPlan,
    ) -> Result<SessionWrite, Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 FOR UPDATE"
        ))
        .bind(next.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("session", next.id))?;
        let current = Self::map_row_to_session(&row)?;
        if current.status != expected {
            tx.rollback().await?;
            return Ok(SessionWrite::Stale(current));
        }

        let entries = if plan.is_empty() {
            Vec::new()
        } else {
            match apply_plan_tx(&mut tx, plan).await {
                Ok(entries) => entries,
                Err(err) => {
                    tx.rollback().await.ok();
                    return Err(err.into());
                }
            }
        };

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, started_at = $3, ended_at = $4, duration_minutes = $5,
                charged_amount = $6, waived_amount = $7, cancel_reason = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(next.id)
        .bind(next.status.as_str())
        .bind(next.started_at)
        .bind(next.ended_at)
        .bind(next.duration_minutes as i64)
        .bind(next.charged_amount as i64)
        .bind(next.waived_amount as i64)
        .bind(next.cancel_reason.map(|r| r.as_str()))
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SessionWrite::Stored {
            session: next.clone(),
            entries,
        })
    }

    pub(super) async fn query_session_rows(
        &self,
        participant: Uuid,
        query: &SessionQuery,
    ) -> Result<Page<Session>, Error> {
        let kind = query.kind.map(|k| k.as_str());
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sessions
            WHERE (client = $1 OR consultant = $1)
              AND ($2::TEXT IS NULL OR kind = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND (NOT $4 OR status IN ('requested', 'active'))
            "#,
        )
        .bind(participant)
        .bind(kind)
        .bind(status)
        .bind(query.live_only)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE (client = $1 OR consultant = $1)
              AND ($2::TEXT IS NULL OR kind = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND (NOT $4 OR status IN ('requested', 'active'))
            ORDER BY started_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(participant)
        .bind(kind)
        .bind(status)
        .bind(query.live_only)
        .bind(query.limit as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(Self::map_row_to_session)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, query.page, query.limit, total as u64))
    }

    pub(super) async fn sessions_started_before_rows(
        &self,
        status: SessionStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Session>, Error> {
        sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE status = $1 AND started_at < $2
            ORDER BY started_at
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(Self::map_row_to_session)
        .collect()
    }
}
