// ledger/src/query.rs
use serde::{Deserialize, Serialize};

use crate::{Direction, LedgerEntry, Source};

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Filters for an account's entry history. Pages are 1-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryQuery {
    pub direction: Option<Direction>,
    pub source: Option<Source>,
    pub page: u32,
    pub limit: u32,
}

impl Default for EntryQuery {
    fn default() -> Self {
        Self {
            direction: None,
            source: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl EntryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    /// Clamp paging into a usable range.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.limit = self.limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.direction.is_none_or(|d| d == entry.direction)
            && self.source.is_none_or(|s| s == entry.source)
    }
}

/// One page of results plus totals for the whole filtered set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: u32, limit: u32, total: u64) -> Self {
        let limit_u64 = limit.max(1) as u64;
        Self {
            items,
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit_u64),
        }
    }

    /// Slice an already ordered, already filtered collection.
    pub fn from_sorted(all: Vec<T>, page: u32, limit: u32) -> Self {
        let total = all.len() as u64;
        let offset = (page.max(1) as usize - 1) * limit as usize;
        let items = all.into_iter().skip(offset).take(limit as usize).collect();
        Self::new(items, page, limit, total)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            limit: self.limit,
            total: self.total,
            total_pages: self.total_pages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletSummary {
    pub current_balance: u64,
    pub total_credits: u64,
    pub total_debits: u64,
    pub credit_count: u64,
    pub debit_count: u64,
    /// Five most recent entries, newest first.
    pub recent: Vec<LedgerEntry>,
}

pub const SUMMARY_RECENT: usize = 5;
