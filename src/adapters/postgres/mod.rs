mod adapter_impl;
mod helper;
mod ledger_impl;
mod payment_impl;
mod review_impl;
mod session_impl;

use ledger::adapters::postgres::PostgresSchemaLedgerAdapter;
use sqlx::PgPool;

use crate::Error;

/// PostgreSQL store. Wallet tables come from the ledger crate; the
/// marketplace tables sit next to them so sessions, reviews and balances
/// can change in one transaction.
///
/// Schema:
/// ```sql
/// CREATE TABLE consultant_profiles (
///     id uuid PRIMARY KEY REFERENCES ledger_accounts(id),
///     display_name TEXT NOT NULL,
///     chat_rate BIGINT NOT NULL CHECK (chat_rate > 0),
///     call_rate BIGINT NOT NULL CHECK (call_rate > 0),
///     available BOOLEAN NOT NULL,
///     rating DOUBLE PRECISION NOT NULL,
///     review_count BIGINT NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
///
/// -- one row per session of any kind; money columns are minor units
/// CREATE TABLE sessions (...);
/// CREATE INDEX idx_sessions_client ON sessions(client, started_at DESC, id DESC);
/// CREATE INDEX idx_sessions_consultant ON sessions(consultant, started_at DESC, id DESC);
/// -- reaper scans
/// CREATE INDEX idx_sessions_status_started ON sessions(status, started_at);
///
/// -- at most one review per session
/// CREATE TABLE reviews (..., session uuid NOT NULL UNIQUE REFERENCES sessions(id), ...);
/// -- gateway top-ups; account and amount are fixed when the order is recorded
/// CREATE TABLE payment_orders (id TEXT PRIMARY KEY, account uuid REFERENCES ledger_accounts(id), ...);
/// CREATE TABLE notifications (...);
/// CREATE TABLE notification_settings (account uuid PRIMARY KEY, ...);
/// ```
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create ledger and marketplace tables. Safe to run repeatedly.
    pub async fn init_schema(&self) -> Result<(), Error> {
        self.init_ledger_schema().await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consultant_profiles (
                id UUID PRIMARY KEY REFERENCES ledger_accounts(id),
                display_name TEXT NOT NULL,
                chat_rate BIGINT NOT NULL CHECK (chat_rate > 0),
                call_rate BIGINT NOT NULL CHECK (call_rate > 0),
                available BOOLEAN NOT NULL DEFAULT FALSE,
                rating DOUBLE PRECISION NOT NULL DEFAULT 0,
                review_count BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id UUID PRIMARY KEY,
                client UUID NOT NULL REFERENCES ledger_accounts(id),
                consultant UUID NOT NULL REFERENCES consultant_profiles(id),
                kind TEXT NOT NULL CHECK (kind IN ('chat', 'voice', 'video')),
                status TEXT NOT NULL
                    CHECK (status IN ('requested', 'active', 'completed', 'cancelled')),
                rate BIGINT NOT NULL CHECK (rate > 0),
                channel TEXT NOT NULL,
                requested_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ,
                duration_minutes BIGINT NOT NULL DEFAULT 0,
                charged_amount BIGINT NOT NULL DEFAULT 0,
                waived_amount BIGINT NOT NULL DEFAULT 0,
                cancel_reason TEXT,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_client
                ON sessions(client, started_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_consultant
                ON sessions(consultant, started_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_status_started
                ON sessions(status, started_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reviews (
                id UUID PRIMARY KEY,
                client UUID NOT NULL,
                consultant UUID NOT NULL REFERENCES consultant_profiles(id),
                session UUID NOT NULL UNIQUE REFERENCES sessions(id),
                rating SMALLINT NOT NULL CHECK (rating BETWEEN 1 AND 5),
                comment TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reviews_consultant
                ON reviews(consultant, created_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reviews_client
                ON reviews(client, created_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment_orders (
                id TEXT PRIMARY KEY,
                account UUID NOT NULL REFERENCES ledger_accounts(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                status TEXT NOT NULL CHECK (status IN ('created', 'paid')),
                payment_id TEXT UNIQUE,
                entry_id UUID REFERENCES ledger_entries(id),
                created_at TIMESTAMPTZ NOT NULL,
                paid_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                account UUID NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                category TEXT NOT NULL,
                payload JSONB NOT NULL,
                read BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_account
                ON notifications(account, created_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_settings (
                account UUID PRIMARY KEY,
                push_enabled BOOLEAN NOT NULL,
                chat BOOLEAN NOT NULL,
                call BOOLEAN NOT NULL,
                payment BOOLEAN NOT NULL,
                promotional BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
