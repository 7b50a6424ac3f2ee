use chrono::{DateTime, Utc};
use ledger::Page;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::PostgresAdapter;
use super::helper::{PROFILE_COLUMNS, REVIEW_COLUMNS, is_unique_violation};
use crate::{
    ConsultantProfile, Error,
    review::{self, Review, ReviewQuery, ReviewScope},
};

impl PostgresAdapter {
    /// Serializes review writes per consultant so each recompute sees the
    /// previous one's result.
    async fn lock_profile_tx(
        tx: &mut Transaction<'_, Postgres>,
        consultant: Uuid,
    ) -> Result<(), Error> {
        sqlx::query("SELECT id FROM consultant_profiles WHERE id = $1 FOR UPDATE")
            .bind(consultant)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| Error::not_found("consultant", consultant))?;
        Ok(())
    }

    async fn recompute_tx(
        tx: &mut Transaction<'_, Postgres>,
        consultant: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConsultantProfile, Error> {
        let ratings: Vec<i16> =
            sqlx::query_scalar("SELECT rating FROM reviews WHERE consultant = $1")
                .bind(consultant)
                .fetch_all(&mut **tx)
                .await?;
        let ratings: Vec<u8> = ratings.into_iter().map(|r| r as u8).collect();
        let (rating, count) = review::aggregate(&ratings);

        let row = sqlx::query(&format!(
            r#"
            UPDATE consultant_profiles
            SET rating = $2, review_count = $3, updated_at = $4
            WHERE id = $1
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(consultant)
        .bind(rating)
        .bind(count as i64)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::not_found("consultant", consultant))?;
        Self::map_row_to_profile(&row)
    }

    pub(super) async fn insert_review_tx(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        let mut tx = self.pool.begin().await?;
        Self::lock_profile_tx(&mut tx, review.consultant).await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO reviews ({REVIEW_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(review.id)
        .bind(review.client)
        .bind(review.consultant)
        .bind(review.session)
        .bind(review.rating as i16)
        .bind(&review.comment)
        .bind(review.created_at)
        .bind(review.updated_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::Conflict(format!(
                    "session {} has already been reviewed",
                    review.session
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let profile = Self::recompute_tx(&mut tx, review.consultant, review.updated_at).await?;
        tx.commit().await?;
        Ok(profile)
    }

    pub(super) async fn update_review_tx(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        let mut tx = self.pool.begin().await?;
        Self::lock_profile_tx(&mut tx, review.consultant).await?;

        let updated = sqlx::query(
            "UPDATE reviews SET rating = $2, comment = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(review.id)
        .bind(review.rating as i16)
        .bind(&review.comment)
        .bind(review.updated_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::not_found("review", review.id));
        }

        let profile = Self::recompute_tx(&mut tx, review.consultant, review.updated_at).await?;
        tx.commit().await?;
        Ok(profile)
    }

    pub(super) async fn delete_review_tx(&self, review: &Review) -> Result<ConsultantProfile, Error> {
        let mut tx = self.pool.begin().await?;
        Self::lock_profile_tx(&mut tx, review.consultant).await?;

        let deleted = sqlx::query("DELETE FROM reviews WHERE id = $1")
            .bind(review.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::not_found("review", review.id));
        }

        let profile = Self::recompute_tx(&mut tx, review.consultant, Utc::now()).await?;
        tx.commit().await?;
        Ok(profile)
    }

    pub(super) async fn recompute_rating_row(
        &self,
        consultant: Uuid,
    ) -> Result<ConsultantProfile, Error> {
        let mut tx = self.pool.begin().await?;
        Self::lock_profile_tx(&mut tx, consultant).await?;
        let profile = Self::recompute_tx(&mut tx, consultant, Utc::now()).await?;
        tx.commit().await?;
        Ok(profile)
    }

    pub(super) async fn query_review_rows(
        &self,
        scope: ReviewScope,
        query: &ReviewQuery,
    ) -> Result<Page<Review>, Error> {
        let (column, id) = match scope {
            ReviewScope::Consultant(id) => ("consultant", id),
            ReviewScope::Client(id) => ("client", id),
        };
        let min_rating = query.min_rating.map(i16::from);

        let total: i64 = sqlx::query_scalar(&format!(
            r#"
            SELECT COUNT(*) FROM reviews
            WHERE {column} = $1 AND ($2::SMALLINT IS NULL OR rating >= $2)
            "#
        ))
        .bind(id)
        .bind(min_rating)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {REVIEW_COLUMNS} FROM reviews
            WHERE {column} = $1 AND ($2::SMALLINT IS NULL OR rating >= $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(id)
        .bind(min_rating)
        .bind(query.limit as i64)
        .bind(query.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(Self::map_row_to_review)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, query.page, query.limit, total as u64))
    }
}
