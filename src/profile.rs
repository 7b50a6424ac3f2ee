use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, session::SessionKind};

/// A consultant's public service record. The wallet lives in the ledger
/// under the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultantProfile {
    pub id: Uuid,
    pub display_name: String,
    /// Per-minute chat rate in minor units.
    pub chat_rate: u64,
    /// Per-minute rate for voice and video.
    pub call_rate: u64,
    pub available: bool,
    /// Mean review rating, one decimal.
    pub rating: f64,
    pub review_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsultantProfile {
    pub fn new(id: Uuid, display_name: impl Into<String>, chat_rate: u64, call_rate: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_name: display_name.into(),
            chat_rate,
            call_rate,
            available: false,
            rating: 0.0,
            review_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn rate_for(&self, kind: SessionKind) -> u64 {
        match kind {
            SessionKind::Chat => self.chat_rate,
            SessionKind::Voice | SessionKind::Video => self.call_rate,
        }
    }

    /// The record as stored on registration: no reviews yet, offline,
    /// stamped with the engine clock.
    pub fn registered(self, now: DateTime<Utc>) -> Self {
        Self {
            available: false,
            rating: 0.0,
            review_count: 0,
            created_at: now,
            updated_at: now,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.display_name.trim().is_empty() {
            return Err(Error::Validation("display name is required".to_string()));
        }
        validate_rates(self.chat_rate, self.call_rate)
    }
}

pub(crate) fn validate_rates(chat_rate: u64, call_rate: u64) -> Result<(), Error> {
    if chat_rate == 0 || call_rate == 0 {
        return Err(Error::Validation(
            "per-minute rates must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Self-service changes a consultant can make. Rating and review count are
/// derived and never patched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePatch {
    pub available: Option<bool>,
    pub chat_rate: Option<u64>,
    pub call_rate: Option<u64>,
}

impl ProfilePatch {
    pub fn apply(&self, profile: &mut ConsultantProfile, now: DateTime<Utc>) {
        if let Some(available) = self.available {
            profile.available = available;
        }
        if let Some(rate) = self.chat_rate {
            profile.chat_rate = rate;
        }
        if let Some(rate) = self.call_rate {
            profile.call_rate = rate;
        }
        profile.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_and_voice_share_call_rate() {
        let profile = ConsultantProfile::new(Uuid::now_v7(), "Mira", 15, 25);
        assert_eq!(profile.rate_for(SessionKind::Chat), 15);
        assert_eq!(profile.rate_for(SessionKind::Voice), 25);
        assert_eq!(profile.rate_for(SessionKind::Video), 25);
    }

    #[test]
    fn free_sessions_are_not_allowed() {
        let profile = ConsultantProfile::new(Uuid::now_v7(), "Mira", 0, 25);
        assert!(matches!(profile.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn registration_drops_derived_fields() {
        let now = Utc::now();
        let claimed = ConsultantProfile {
            available: true,
            rating: 5.0,
            review_count: 10_000,
            ..ConsultantProfile::new(Uuid::now_v7(), "Mira", 15, 25)
        };
        let stored = claimed.registered(now);
        assert_eq!(stored.rating, 0.0);
        assert_eq!(stored.review_count, 0);
        assert!(!stored.available);
        assert_eq!(stored.created_at, now);
        assert_eq!(stored.chat_rate, 15);
    }

    #[test]
    fn patch_leaves_unset_fields() {
        let mut profile = ConsultantProfile::new(Uuid::now_v7(), "Mira", 15, 25);
        ProfilePatch {
            available: Some(true),
            ..Default::default()
        }
        .apply(&mut profile, Utc::now());
        assert!(profile.available);
        assert_eq!(profile.chat_rate, 15);
    }
}
