// ledger/src/lib.rs
//! Prepaid wallet ledger.
//!
//! Every balance mutation is an [`Operation`] inside an [`ExecutionPlan`].
//! Adapters execute a plan as one unit: lock the touched accounts, re-check
//! balances under the lock, apply, append one [`LedgerEntry`] per operation,
//! commit. A failed plan leaves no trace.
//!
//! ```rust,ignore
//! let ctx = system.ctx();
//! ctx.credit(user, 500_00, Source::GatewayPayment, "top up").await?;
//!
//! Money::atomic(&ctx, |tx| async move {
//!     tx.debit(user, 120_00, Source::SessionCall, "voice call - 3 minutes")?;
//!     Ok(())
//! })
//! .await?;
//! ```
pub mod account;
pub mod adapters;
pub mod entry;
pub mod error;
pub mod money;
pub mod query;

pub use account::Account;
pub use entry::{Direction, LedgerEntry, Source};
pub use error::LedgerError;
pub use money::{
    ExecutionPlan, LedgerContext, Money, Operation, Recorded, TransactionContext,
    record_plan_metrics,
};
pub use query::{EntryQuery, Page, WalletSummary};

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) fn hash_idempotency_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Storage contract for the ledger.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Create a zero-balance account, or return the existing one.
    async fn open_account(&self, id: Uuid) -> Result<Account, LedgerError>;

    /// Execute the complete plan atomically.
    /// Implementors MUST:
    /// 1. BEGIN a transaction
    /// 2. lock every account from `plan.calculate_locks()`, in that order
    /// 3. reject a reused idempotency key with `DuplicateIdempotencyKey`
    /// 4. apply each operation against the locked balance; an overdrawing
    ///    debit returns `InsufficientBalance`
    /// 5. append one entry per operation
    /// 6. COMMIT on success, ROLLBACK on any error
    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<Vec<LedgerEntry>, LedgerError>;

    // READ OPERATIONS
    async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError>;
    async fn get_balance(&self, id: Uuid) -> Result<u64, LedgerError> {
        Ok(self.get_account(id).await?.balance)
    }
    async fn get_entry(&self, account: Uuid, entry_id: Uuid) -> Result<LedgerEntry, LedgerError>;
    async fn query_entries(
        &self,
        account: Uuid,
        query: &EntryQuery,
    ) -> Result<Page<LedgerEntry>, LedgerError>;
    async fn entry_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError>;
    async fn summary(&self, account: Uuid) -> Result<WalletSummary, LedgerError>;

    /// Soft state only; balance is untouched.
    async fn set_blocked(&self, id: Uuid, blocked: bool) -> Result<Account, LedgerError>;
}

/// Owns the adapter and hands out contexts.
pub struct LedgerSystem {
    adapter: Arc<dyn LedgerAdapter>,
}

impl LedgerSystem {
    pub fn new(adapter: Box<dyn LedgerAdapter>) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    pub fn from_arc(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    /// Get adapter reference
    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    /// Get adapter Arc (for creating contexts)
    pub fn adapter_arc(&self) -> Arc<dyn LedgerAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn ctx(&self) -> LedgerContext {
        LedgerContext::new(self.adapter_arc())
    }
}
