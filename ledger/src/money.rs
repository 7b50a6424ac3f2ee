// ledger/src/money.rs
use super::{Account, LedgerAdapter, LedgerEntry, LedgerError, hash_idempotency_key};
use crate::{Direction, Source};
use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Credit {
        account: Uuid,
        amount: u64,
        source: Source,
        remark: String,
        idempotency_key: Option<String>,
    },
    Debit {
        account: Uuid,
        amount: u64,
        source: Source,
        remark: String,
        idempotency_key: Option<String>,
    },
}

impl Operation {
    pub fn credit(account: Uuid, amount: u64, source: Source, remark: impl Into<String>) -> Self {
        Operation::Credit {
            account,
            amount,
            source,
            remark: remark.into(),
            idempotency_key: None,
        }
    }

    pub fn debit(account: Uuid, amount: u64, source: Source, remark: impl Into<String>) -> Self {
        Operation::Debit {
            account,
            amount,
            source,
            remark: remark.into(),
            idempotency_key: None,
        }
    }

    /// Attach a caller key. The raw key is never stored, only its hash.
    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        let hashed = Some(hash_idempotency_key(key));
        match &mut self {
            Operation::Credit {
                idempotency_key, ..
            }
            | Operation::Debit {
                idempotency_key, ..
            } => *idempotency_key = hashed,
        }
        self
    }

    pub fn account(&self) -> Uuid {
        match self {
            Operation::Credit { account, .. } | Operation::Debit { account, .. } => *account,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            Operation::Credit { amount, .. } | Operation::Debit { amount, .. } => *amount,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Operation::Credit { .. } => Direction::Credit,
            Operation::Debit { .. } => Direction::Debit,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            Operation::Credit {
                idempotency_key, ..
            }
            | Operation::Debit {
                idempotency_key, ..
            } => idempotency_key.as_deref(),
        }
    }

    /// Apply to an account that the caller already holds locked.
    /// On error the account is left untouched.
    pub fn apply(&self, account: &mut Account) -> Result<LedgerEntry, LedgerError> {
        if account.id != self.account() {
            return Err(LedgerError::Conflict(format!(
                "operation for {} applied to account {}",
                self.account(),
                account.id
            )));
        }

        let (direction, amount, source, remark, key) = match self {
            Operation::Credit {
                amount,
                source,
                remark,
                idempotency_key,
                ..
            } => (Direction::Credit, *amount, *source, remark, idempotency_key),
            Operation::Debit {
                amount,
                source,
                remark,
                idempotency_key,
                ..
            } => (Direction::Debit, *amount, *source, remark, idempotency_key),
        };

        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let next = match direction {
            Direction::Credit => account
                .balance
                .checked_add(amount)
                .ok_or(LedgerError::InvalidAmount)?,
            Direction::Debit => {
                if !account.can_cover(amount) {
                    return Err(LedgerError::InsufficientBalance);
                }
                account.balance - amount
            }
        };

        account.balance = next;
        account.updated_at = Utc::now();

        Ok(LedgerEntry::new(
            account.id,
            direction,
            source,
            amount,
            remark.clone(),
            next,
            key.clone(),
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    operations: Vec<Operation>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: Operation) -> Self {
        Self {
            operations: vec![op],
        }
    }

    pub fn add(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Accounts the plan touches, sorted so every executor locks them in
    /// the same order.
    pub fn calculate_locks(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.operations.iter().map(Operation::account).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Outcome of an idempotent write. `replayed` is set when the key had
/// already been used and `entry` is the original record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub entry: LedgerEntry,
    pub replayed: bool,
}

#[derive(Clone)]
pub struct LedgerContext {
    adapter: Arc<dyn LedgerAdapter>,
}

impl LedgerContext {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    pub async fn balance(&self, account: Uuid) -> Result<u64, LedgerError> {
        self.adapter.get_balance(account).await
    }

    pub async fn credit(
        &self,
        account: Uuid,
        amount: u64,
        source: Source,
        remark: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.execute_one(Operation::credit(account, amount, source, remark))
            .await
    }

    pub async fn debit(
        &self,
        account: Uuid,
        amount: u64,
        source: Source,
        remark: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.execute_one(Operation::debit(account, amount, source, remark))
            .await
    }

    /// Credit at most once per key. A replay returns the entry recorded by
    /// the first call instead of crediting again.
    pub async fn credit_idempotent(
        &self,
        account: Uuid,
        amount: u64,
        source: Source,
        remark: impl Into<String>,
        idempotency_key: &str,
    ) -> Result<Recorded, LedgerError> {
        let op = Operation::credit(account, amount, source, remark)
            .with_idempotency_key(idempotency_key);
        self.execute_idempotent(op).await
    }

    pub async fn debit_idempotent(
        &self,
        account: Uuid,
        amount: u64,
        source: Source,
        remark: impl Into<String>,
        idempotency_key: &str,
    ) -> Result<Recorded, LedgerError> {
        let op = Operation::debit(account, amount, source, remark)
            .with_idempotency_key(idempotency_key);
        self.execute_idempotent(op).await
    }

    async fn execute_idempotent(&self, op: Operation) -> Result<Recorded, LedgerError> {
        let hashed = op
            .idempotency_key()
            .map(str::to_owned)
            .ok_or_else(|| LedgerError::Conflict("missing idempotency key".to_string()))?;

        if let Some(existing) = self.adapter.entry_by_idempotency_key(&hashed).await? {
            debug!(entry = %existing.id, "idempotent replay");
            return Ok(Recorded {
                entry: existing,
                replayed: true,
            });
        }

        match self.execute_one(op).await {
            Ok(entry) => Ok(Recorded {
                entry,
                replayed: false,
            }),
            Err(LedgerError::DuplicateIdempotencyKey(_)) => {
                let entry = self
                    .adapter
                    .entry_by_idempotency_key(&hashed)
                    .await?
                    .ok_or(LedgerError::EntryNotFound)?;
                Ok(Recorded {
                    entry,
                    replayed: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_one(&self, op: Operation) -> Result<LedgerEntry, LedgerError> {
        let mut entries = self.execute(ExecutionPlan::single(op)).await?;
        entries.pop().ok_or(LedgerError::EntryNotFound)
    }

    pub(crate) async fn execute(
        &self,
        plan: ExecutionPlan,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        if plan.operations().iter().any(|op| op.amount() == 0) {
            return Err(LedgerError::InvalidAmount);
        }

        let result = self.adapter.execute_plan(&plan).await;
        record_plan_metrics(&plan, result.is_ok());

        if let Ok(entries) = &result {
            for entry in entries {
                info!(
                    account = %entry.account,
                    direction = %entry.direction,
                    source = %entry.source,
                    amount = entry.amount,
                    balance_after = entry.balance_after,
                    "ledger entry appended"
                );
            }
        }
        result
    }
}

/// Shared by every executor, including stores that run a plan inside
/// their own transaction.
pub fn record_plan_metrics(plan: &ExecutionPlan, success: bool) {
    for op in plan.operations() {
        histogram!("ledger.entry.amount", "direction" => op.direction().as_str())
            .record(op.amount() as f64);
    }
    counter!("ledger.transactions.total",
        "status" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

/// Collects operations inside a [`Money::atomic`] closure.
#[derive(Clone)]
pub struct TransactionContext {
    ctx: LedgerContext,
    plan: Arc<Mutex<ExecutionPlan>>,
}

impl TransactionContext {
    fn new(ctx: LedgerContext) -> Self {
        Self {
            ctx,
            plan: Arc::new(Mutex::new(ExecutionPlan::new())),
        }
    }

    /// Advisory read; the executor re-checks under lock.
    pub async fn balance(&self, account: Uuid) -> Result<u64, LedgerError> {
        self.ctx.balance(account).await
    }

    pub fn credit(
        &self,
        account: Uuid,
        amount: u64,
        source: Source,
        remark: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.push(Operation::credit(account, amount, source, remark))
    }

    pub fn debit(
        &self,
        account: Uuid,
        amount: u64,
        source: Source,
        remark: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.push(Operation::debit(account, amount, source, remark))
    }

    pub fn push(&self, op: Operation) -> Result<(), LedgerError> {
        if op.amount() == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(op);
        Ok(())
    }

    fn take_plan(&self) -> ExecutionPlan {
        std::mem::take(&mut *self.plan.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub struct Money;

impl Money {
    /// Plan several operations and execute them as one all-or-nothing unit.
    pub async fn atomic<F, Fut>(
        ledger_ctx: &LedgerContext,
        f: F,
    ) -> Result<Vec<LedgerEntry>, LedgerError>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: std::future::Future<Output = Result<(), LedgerError>>,
    {
        let tx_ctx = TransactionContext::new(ledger_ctx.clone());

        // Planning only; nothing is written until execute.
        f(tx_ctx.clone()).await?;

        let plan = tx_ctx.take_plan();
        ledger_ctx.execute(plan).await
    }
}
