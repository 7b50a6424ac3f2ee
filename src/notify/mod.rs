//! In-app notifications and best-effort fan-out.
//!
//! A notification is persisted first; delivery happens afterwards on
//! spawned tasks and can never fail the operation that triggered it.
mod channel;
pub mod template;

pub use channel::{BroadcastChannel, ChannelKind, DeliveryChannel, Dispatcher, LogChannel};

use chrono::{DateTime, Utc};
use ledger::Page;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, MarketConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Chat,
    Call,
    Payment,
    Review,
    System,
    Promotion,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Chat => "chat",
            Category::Call => "call",
            Category::Payment => "payment",
            Category::Review => "review",
            Category::System => "system",
            Category::Promotion => "promotion",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Category::Chat),
            "call" => Ok(Category::Call),
            "payment" => Ok(Category::Payment),
            "review" => Ok(Category::Review),
            "system" => Ok(Category::System),
            "promotion" => Ok(Category::Promotion),
            other => Err(Error::Validation(format!(
                "unknown notification category: {other}"
            ))),
        }
    }
}

/// What a caller asks to send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationDraft {
    pub title: String,
    pub message: String,
    pub category: Category,
    pub payload: serde_json::Value,
}

impl NotificationDraft {
    pub fn new(title: impl Into<String>, message: impl Into<String>, category: Category) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            category,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.title.trim().is_empty() || self.message.trim().is_empty() {
            return Err(Error::Validation(
                "notification title and message are required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub account: Uuid,
    pub title: String,
    pub message: String,
    pub category: Category,
    pub payload: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(account: Uuid, draft: NotificationDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            account,
            title: draft.title,
            message: draft.message,
            category: draft.category,
            payload: draft.payload,
            read: false,
            created_at: now,
        }
    }
}

/// Per-account push preferences. Created lazily with everything enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationSettings {
    pub account: Uuid,
    pub push_enabled: bool,
    pub chat: bool,
    pub call: bool,
    pub payment: bool,
    pub promotional: bool,
}

impl NotificationSettings {
    pub fn defaults_for(account: Uuid) -> Self {
        Self {
            account,
            push_enabled: true,
            chat: true,
            call: true,
            payment: true,
            promotional: true,
        }
    }

    /// Whether push delivery may carry this category.
    pub fn allows_push(&self, category: Category) -> bool {
        self.push_enabled
            && match category {
                Category::Chat => self.chat,
                Category::Call => self.call,
                Category::Payment => self.payment,
                Category::Promotion => self.promotional,
                Category::Review | Category::System => true,
            }
    }
}

/// Partial settings update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsPatch {
    pub push_enabled: Option<bool>,
    pub chat: Option<bool>,
    pub call: Option<bool>,
    pub payment: Option<bool>,
    pub promotional: Option<bool>,
}

impl SettingsPatch {
    pub fn apply(&self, settings: &mut NotificationSettings) {
        let fields = [
            (self.push_enabled, &mut settings.push_enabled),
            (self.chat, &mut settings.chat),
            (self.call, &mut settings.call),
            (self.payment, &mut settings.payment),
            (self.promotional, &mut settings.promotional),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationQuery {
    pub unread_only: bool,
    pub category: Option<Category>,
    pub page: u32,
    pub limit: u32,
}

impl NotificationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unread_only(mut self) -> Self {
        self.unread_only = true;
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
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

    pub fn matches(&self, n: &Notification) -> bool {
        (!self.unread_only || !n.read) && self.category.is_none_or(|c| c == n.category)
    }
}

/// A page of notifications plus the account's total unread count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inbox {
    pub page: Page<Notification>,
    pub unread: u64,
}
