//! Marketplace configuration.
//!
//! Merge order (later overrides earlier):
//! 1. compiled defaults
//! 2. `./parley.toml`
//! 3. `PARLEY_*` environment variables (`PARLEY_RING_TIMEOUT_SECS=45`)
use std::path::Path;

use chrono::Duration;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::Error;

const DAY_SECS: u64 = 24 * 60 * 60;

pub const MAX_MIN_BALANCE_MINUTES: u64 = 24 * 60;
pub const MAX_RING_TIMEOUT_SECS: u64 = DAY_SECS;
/// One week.
pub const MAX_SESSION_MINUTES: u64 = 7 * 24 * 60;
pub const MAX_REAPER_INTERVAL_SECS: u64 = DAY_SECS;
pub const MAX_TOKEN_TTL_SECS: u64 = 7 * DAY_SECS;
pub const MAX_DELIVERY_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// What settlement does when the final debit cannot be covered.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    /// Roll back and leave the session active for retry or manual review.
    #[default]
    Reject,
    /// Complete the session without charging; the charge is recorded as waived.
    WaiveCharge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MarketConfig {
    /// Balance floor for starting a session, in minutes of the consultant's rate.
    pub min_balance_minutes: u32,
    /// Unanswered calls are cancelled after this long.
    pub ring_timeout_secs: u64,
    /// Active sessions are force-ended after this long.
    pub max_session_minutes: u64,
    pub reaper_interval_secs: u64,
    pub token_ttl_secs: u64,
    pub delivery_timeout_ms: u64,
    pub default_page_limit: u32,
    pub max_page_limit: u32,
    pub settlement_policy: SettlementPolicy,
    /// Shared secret for payment gateway signatures.
    pub gateway_secret: Option<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            min_balance_minutes: 5,
            ring_timeout_secs: 60,
            max_session_minutes: 240,
            reaper_interval_secs: 15,
            token_ttl_secs: 3600,
            delivery_timeout_ms: 2000,
            default_page_limit: 10,
            max_page_limit: 100,
            settlement_policy: SettlementPolicy::Reject,
            gateway_secret: None,
        }
    }
}

impl MarketConfig {
    /// Defaults, then `./parley.toml`, then `PARLEY_*` env.
    pub fn load() -> Result<Self, Error> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("parley.toml"))
            .merge(Env::prefixed("PARLEY_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PARLEY_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, Error> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let bounded = [
            ("min_balance_minutes", self.min_balance_minutes as u64, MAX_MIN_BALANCE_MINUTES),
            ("ring_timeout_secs", self.ring_timeout_secs, MAX_RING_TIMEOUT_SECS),
            ("max_session_minutes", self.max_session_minutes, MAX_SESSION_MINUTES),
            ("reaper_interval_secs", self.reaper_interval_secs, MAX_REAPER_INTERVAL_SECS),
            ("token_ttl_secs", self.token_ttl_secs, MAX_TOKEN_TTL_SECS),
            ("delivery_timeout_ms", self.delivery_timeout_ms, MAX_DELIVERY_TIMEOUT_MS),
            ("default_page_limit", self.default_page_limit as u64, u32::MAX as u64),
            ("max_page_limit", self.max_page_limit as u64, u32::MAX as u64),
        ];
        for (name, value, max) in bounded {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
            if value > max {
                return Err(Error::Config(format!("{name} cannot exceed {max}")));
            }
        }
        if self.default_page_limit > self.max_page_limit {
            return Err(Error::Config(
                "default_page_limit cannot exceed max_page_limit".to_string(),
            ));
        }
        if self
            .gateway_secret
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            return Err(Error::Config("gateway_secret cannot be blank".to_string()));
        }
        Ok(())
    }

    // Clamped to the validated bounds.

    pub fn ring_timeout(&self) -> Duration {
        Duration::seconds(self.ring_timeout_secs.min(MAX_RING_TIMEOUT_SECS) as i64)
    }

    pub fn max_session(&self) -> Duration {
        Duration::minutes(self.max_session_minutes.min(MAX_SESSION_MINUTES) as i64)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::seconds(self.token_ttl_secs.min(MAX_TOKEN_TTL_SECS) as i64)
    }

    pub fn delivery_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.delivery_timeout_ms.min(MAX_DELIVERY_TIMEOUT_MS))
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reaper_interval_secs.min(MAX_REAPER_INTERVAL_SECS))
    }

    /// Resolve a requested page size: zero means the default, anything
    /// above the maximum is capped.
    pub fn page_limit(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.default_page_limit
        } else {
            requested.min(self.max_page_limit)
        }
    }
}
