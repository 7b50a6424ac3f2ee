// ledger/src/adapters/postgres.rs
use crate::query::SUMMARY_RECENT;
use crate::{
    Account, EntryQuery, ExecutionPlan, LedgerAdapter, LedgerEntry, LedgerError, Page,
    WalletSummary,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

pub trait PostgresLedgerAdapter {
    fn get_pool(&self) -> PgPool;
}

#[async_trait::async_trait]
pub trait PostgresSchemaLedgerAdapter {
    /// Create the ledger tables. Stores that embed the ledger call this
    /// from their own `init_schema`.
    async fn init_ledger_schema(&self) -> Result<(), LedgerError>;
}

#[async_trait::async_trait]
impl<T> PostgresSchemaLedgerAdapter for T
where
    T: PostgresLedgerAdapter + Send + Sync,
{
    async fn init_ledger_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.get_pool().begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                id UUID PRIMARY KEY,
                balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
                blocked BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id UUID PRIMARY KEY,
                account UUID NOT NULL REFERENCES ledger_accounts(id),
                direction TEXT NOT NULL CHECK (direction IN ('credit', 'debit')),
                source TEXT NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                remark TEXT NOT NULL,
                balance_after BIGINT NOT NULL CHECK (balance_after >= 0),
                idempotency_key TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_created
            ON ledger_entries(account, created_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entries_idempotency_key
            ON ledger_entries(idempotency_key)
            WHERE idempotency_key IS NOT NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

pub(crate) fn row_to_account(row: &PgRow) -> Result<Account, LedgerError> {
    Ok(Account {
        id: row.try_get("id")?,
        balance: row.try_get::<i64, _>("balance")? as u64,
        blocked: row.try_get("blocked")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        direction: row.try_get::<String, _>("direction")?.parse()?,
        source: row.try_get::<String, _>("source")?.parse()?,
        amount: row.try_get::<i64, _>("amount")? as u64,
        remark: row.try_get("remark")?,
        balance_after: row.try_get::<i64, _>("balance_after")? as u64,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

const ENTRY_COLUMNS: &str =
    "id, account, direction, source, amount, remark, balance_after, idempotency_key, created_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

/// Lock one account row for the rest of `tx`.
pub async fn lock_account_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Account, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT id, balance, blocked, created_at, updated_at
        FROM ledger_accounts
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(LedgerError::AccountNotFound(id))?;

    row_to_account(&row)
}

/// Run a plan inside a transaction the caller owns. Nothing is committed
/// here; on error the caller must roll back (dropping `tx` does).
pub async fn apply_plan_tx(
    tx: &mut Transaction<'_, Postgres>,
    plan: &ExecutionPlan,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    // Phase 1: lock in sorted order.
    let mut locked: HashMap<Uuid, Account> = HashMap::new();
    for id in plan.calculate_locks() {
        let account = lock_account_tx(tx, id).await?;
        locked.insert(id, account);
    }

    // Phase 2: apply against the locked balances.
    let mut entries = Vec::with_capacity(plan.operations().len());
    for op in plan.operations() {
        if let Some(key) = op.idempotency_key() {
            let existing: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM ledger_entries WHERE idempotency_key = $1")
                    .bind(key)
                    .fetch_optional(&mut **tx)
                    .await?;
            if let Some(existing) = existing {
                return Err(LedgerError::DuplicateIdempotencyKey(existing));
            }
        }

        let account = locked
            .get_mut(&op.account())
            .ok_or(LedgerError::AccountNotFound(op.account()))?;
        let entry = op.apply(account)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, account, direction, source, amount, remark, balance_after, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.account)
        .bind(entry.direction.as_str())
        .bind(entry.source.as_str())
        .bind(entry.amount as i64)
        .bind(&entry.remark)
        .bind(entry.balance_after as i64)
        .bind(&entry.idempotency_key)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await;

        match inserted {
            Ok(_) => {}
            // Lost a race with a concurrent plan using the same key.
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::DuplicateIdempotencyKey(entry.id));
            }
            Err(e) => return Err(e.into()),
        }

        entries.push(entry);
    }

    // Phase 3: write back final balances.
    for account in locked.values() {
        sqlx::query("UPDATE ledger_accounts SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(account.id)
            .bind(account.balance as i64)
            .bind(account.updated_at)
            .execute(&mut **tx)
            .await?;
    }

    Ok(entries)
}

pub async fn open_account_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Account, LedgerError> {
    sqlx::query("INSERT INTO ledger_accounts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    let row = sqlx::query(
        "SELECT id, balance, blocked, created_at, updated_at FROM ledger_accounts WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    row_to_account(&row)
}

#[async_trait::async_trait]
impl<T> LedgerAdapter for T
where
    T: PostgresLedgerAdapter + Send + Sync,
{
    async fn open_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        let mut tx = self.get_pool().begin().await?;
        let account = open_account_tx(&mut tx, id).await?;
        tx.commit().await?;
        Ok(account)
    }

    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut tx = self.get_pool().begin().await?;

        match apply_plan_tx(&mut tx, plan).await {
            Ok(entries) => {
                tx.commit().await?;
                Ok(entries)
            }
            Err(e) => {
                tx.rollback().await.ok();
                Err(e)
            }
        }
    }

    async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        let row = sqlx::query(
            "SELECT id, balance, blocked, created_at, updated_at FROM ledger_accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.get_pool())
        .await?
        .ok_or(LedgerError::AccountNotFound(id))?;
        row_to_account(&row)
    }

    async fn get_entry(&self, account: Uuid, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = $1 AND account = $2"
        ))
        .bind(entry_id)
        .bind(account)
        .fetch_optional(&self.get_pool())
        .await?
        .ok_or(LedgerError::EntryNotFound)?;
        row_to_entry(&row)
    }

    async fn query_entries(
        &self,
        account: Uuid,
        query: &EntryQuery,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        // Existence check so an unknown account is an error, not an empty page.
        self.get_account(account).await?;

        let query = query.clone().normalized();
        let direction = query.direction.map(|d| d.as_str());
        let source = query.source.map(|s| s.as_str());
        let pool = self.get_pool();

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM ledger_entries
            WHERE account = $1
              AND ($2::TEXT IS NULL OR direction = $2)
              AND ($3::TEXT IS NULL OR source = $3)
            "#,
        )
        .bind(account)
        .bind(direction)
        .bind(source)
        .fetch_one(&pool)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM ledger_entries
            WHERE account = $1
              AND ($2::TEXT IS NULL OR direction = $2)
              AND ($3::TEXT IS NULL OR source = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(account)
        .bind(direction)
        .bind(source)
        .bind(query.limit as i64)
        .bind(query.offset() as i64)
        .fetch_all(&pool)
        .await?;

        let items = rows
            .iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(items, query.page, query.limit, total as u64))
    }

    async fn entry_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE idempotency_key = $1"
        ))
        .bind(hashed_key)
        .fetch_optional(&self.get_pool())
        .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn summary(&self, account: Uuid) -> Result<WalletSummary, LedgerError> {
        let current = self.get_account(account).await?;
        let pool = self.get_pool();

        // SUM returns NUMERIC, cast back to BIGINT
        let totals = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE direction = 'credit'), 0)::BIGINT AS total_credits,
                COALESCE(SUM(amount) FILTER (WHERE direction = 'debit'), 0)::BIGINT AS total_debits,
                COUNT(*) FILTER (WHERE direction = 'credit') AS credit_count,
                COUNT(*) FILTER (WHERE direction = 'debit') AS debit_count
            FROM ledger_entries
            WHERE account = $1
            "#,
        )
        .bind(account)
        .fetch_one(&pool)
        .await?;

        let recent = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM ledger_entries
            WHERE account = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(account)
        .bind(SUMMARY_RECENT as i64)
        .fetch_all(&pool)
        .await?
        .iter()
        .map(row_to_entry)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(WalletSummary {
            current_balance: current.balance,
            total_credits: totals.try_get::<i64, _>("total_credits")? as u64,
            total_debits: totals.try_get::<i64, _>("total_debits")? as u64,
            credit_count: totals.try_get::<i64, _>("credit_count")? as u64,
            debit_count: totals.try_get::<i64, _>("debit_count")? as u64,
            recent,
        })
    }

    async fn set_blocked(&self, id: Uuid, blocked: bool) -> Result<Account, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_accounts SET blocked = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, balance, blocked, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(blocked)
        .fetch_optional(&self.get_pool())
        .await?
        .ok_or(LedgerError::AccountNotFound(id))?;
        row_to_account(&row)
    }
}

/// Standalone Postgres ledger for callers that only need wallets.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PostgresLedgerAdapter for PostgresLedger {
    fn get_pool(&self) -> PgPool {
        self.pool.clone()
    }
}
