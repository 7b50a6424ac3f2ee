// ledger/src/adapters/memory.rs
use crate::query::SUMMARY_RECENT;
use crate::{
    Account, Direction, EntryQuery, ExecutionPlan, LedgerAdapter, LedgerEntry, LedgerError, Page,
    WalletSummary,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Plain ledger state. Callers serialize access (one mutex), which is what
/// makes check-then-apply atomic here. Stores that keep other records next
/// to the ledger embed this and run plans under their own lock.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedgerState {
    accounts: HashMap<Uuid, Account>,
    entries: Vec<LedgerEntry>,
    keys: HashMap<String, Uuid>,
}

impl MemoryLedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_account(&mut self, id: Uuid) -> Account {
        self.accounts
            .entry(id)
            .or_insert_with(|| Account::new(id))
            .clone()
    }

    pub fn account(&self, id: Uuid) -> Result<&Account, LedgerError> {
        self.accounts
            .get(&id)
            .ok_or(LedgerError::AccountNotFound(id))
    }

    pub fn set_blocked(&mut self, id: Uuid, blocked: bool) -> Result<Account, LedgerError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::AccountNotFound(id))?;
        account.blocked = blocked;
        account.updated_at = chrono::Utc::now();
        Ok(account.clone())
    }

    /// Stage every operation against copies of the touched accounts and
    /// only publish them once the whole plan succeeded.
    pub fn apply_plan(&mut self, plan: &ExecutionPlan) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut staged: HashMap<Uuid, Account> = HashMap::new();
        for id in plan.calculate_locks() {
            staged.insert(id, self.account(id)?.clone());
        }

        let mut entries = Vec::with_capacity(plan.operations().len());
        let mut staged_keys: HashSet<String> = HashSet::new();

        for op in plan.operations() {
            if let Some(key) = op.idempotency_key() {
                if let Some(existing) = self.keys.get(key) {
                    return Err(LedgerError::DuplicateIdempotencyKey(*existing));
                }
                if !staged_keys.insert(key.to_string()) {
                    return Err(LedgerError::Conflict(
                        "idempotency key repeated within one plan".to_string(),
                    ));
                }
            }

            let account = staged
                .get_mut(&op.account())
                .ok_or(LedgerError::AccountNotFound(op.account()))?;
            entries.push(op.apply(account)?);
        }

        for (id, account) in staged {
            self.accounts.insert(id, account);
        }
        for entry in &entries {
            if let Some(key) = &entry.idempotency_key {
                self.keys.insert(key.clone(), entry.id);
            }
        }
        self.entries.extend(entries.iter().cloned());

        Ok(entries)
    }

    pub fn entry(&self, account: Uuid, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        self.entries
            .iter()
            .find(|e| e.id == entry_id && e.account == account)
            .cloned()
            .ok_or(LedgerError::EntryNotFound)
    }

    pub fn entry_by_key(&self, hashed_key: &str) -> Option<LedgerEntry> {
        let id = self.keys.get(hashed_key)?;
        self.entries.iter().find(|e| &e.id == id).cloned()
    }

    /// Newest first.
    fn entries_for(&self, account: Uuid) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().rev().filter(move |e| e.account == account)
    }

    pub fn query_entries(
        &self,
        account: Uuid,
        query: &EntryQuery,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        self.account(account)?;
        let query = query.clone().normalized();
        let matching: Vec<LedgerEntry> = self
            .entries_for(account)
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        Ok(Page::from_sorted(matching, query.page, query.limit))
    }

    pub fn summary(&self, account: Uuid) -> Result<WalletSummary, LedgerError> {
        let current_balance = self.account(account)?.balance;
        let mut summary = WalletSummary {
            current_balance,
            total_credits: 0,
            total_debits: 0,
            credit_count: 0,
            debit_count: 0,
            recent: Vec::new(),
        };

        for entry in self.entries_for(account) {
            match entry.direction {
                Direction::Credit => {
                    summary.total_credits += entry.amount;
                    summary.credit_count += 1;
                }
                Direction::Debit => {
                    summary.total_debits += entry.amount;
                    summary.debit_count += 1;
                }
            }
            if summary.recent.len() < SUMMARY_RECENT {
                summary.recent.push(entry.clone());
            }
        }

        Ok(summary)
    }

    /// Sum of signed entry amounts; equals the balance when the ledger is
    /// consistent.
    pub fn replayed_balance(&self, account: Uuid) -> i128 {
        self.entries
            .iter()
            .filter(|e| e.account == account)
            .map(LedgerEntry::signed_amount)
            .sum()
    }
}

#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryLedgerState>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryLedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replayed_balance(&self, account: Uuid) -> i128 {
        self.state().replayed_balance(account)
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn open_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        Ok(self.state().open_account(id))
    }

    async fn execute_plan(&self, plan: &ExecutionPlan) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.state().apply_plan(plan)
    }

    async fn get_account(&self, id: Uuid) -> Result<Account, LedgerError> {
        self.state().account(id).cloned()
    }

    async fn get_entry(&self, account: Uuid, entry_id: Uuid) -> Result<LedgerEntry, LedgerError> {
        self.state().entry(account, entry_id)
    }

    async fn query_entries(
        &self,
        account: Uuid,
        query: &EntryQuery,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        self.state().query_entries(account, query)
    }

    async fn entry_by_idempotency_key(
        &self,
        hashed_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.state().entry_by_key(hashed_key))
    }

    async fn summary(&self, account: Uuid) -> Result<WalletSummary, LedgerError> {
        self.state().summary(account)
    }

    async fn set_blocked(&self, id: Uuid, blocked: bool) -> Result<Account, LedgerError> {
        self.state().set_blocked(id, blocked)
    }
}
