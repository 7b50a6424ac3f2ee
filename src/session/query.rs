use serde::{Deserialize, Serialize};

use super::{Session, SessionKind, SessionStatus};
use crate::MarketConfig;

/// Filters for a participant's session history. Ordered by start time,
/// newest first. A `limit` of zero means the configured default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionQuery {
    pub kind: Option<SessionKind>,
    pub status: Option<SessionStatus>,
    /// Only sessions not yet completed or cancelled.
    pub live_only: bool,
    pub page: u32,
    pub limit: u32,
}

impl SessionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: SessionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn live_only(mut self) -> Self {
        self.live_only = true;
        self
    }

    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    pub(crate) fn normalized(mut self, config: &MarketConfig) -> Self {
        self.page = self.page.max(1);
        self.limit = config.page_limit(self.limit);
        self
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.kind.is_none_or(|k| k == session.kind)
            && self.status.is_none_or(|s| s == session.status)
            && (!self.live_only || !session.status.is_terminal())
    }
}
