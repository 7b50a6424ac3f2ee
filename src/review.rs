use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;
pub const MAX_COMMENT_CHARS: usize = 2000;

/// A client's rating of one completed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Review {
    pub id: Uuid,
    pub client: Uuid,
    pub consultant: Uuid,
    pub session: Uuid,
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Review {
    pub fn new(
        client: Uuid,
        consultant: Uuid,
        session: Uuid,
        rating: u8,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let comment = comment.into();
        validate(rating, &comment)?;
        Ok(Self {
            id: Uuid::now_v7(),
            client,
            consultant,
            session,
            rating,
            comment,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn revised(
        &self,
        rating: u8,
        comment: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let comment = comment.into();
        validate(rating, &comment)?;
        Ok(Self {
            rating,
            comment,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn ensure_author(&self, actor: Uuid) -> Result<(), Error> {
        if actor == self.client {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "review {} belongs to another client",
                self.id
            )))
        }
    }
}

pub fn validate(rating: u8, comment: &str) -> Result<(), Error> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(Error::Validation(format!(
            "rating must be between {MIN_RATING} and {MAX_RATING}"
        )));
    }
    if comment.chars().count() > MAX_COMMENT_CHARS {
        return Err(Error::Validation(format!(
            "comment exceeds {MAX_COMMENT_CHARS} characters"
        )));
    }
    Ok(())
}

/// Mean rounded half-up to one decimal, and count. `(0.0, 0)` when empty.
pub fn aggregate(ratings: &[u8]) -> (f64, u64) {
    let count = ratings.len() as u64;
    if count == 0 {
        return (0.0, 0);
    }
    let sum: u64 = ratings.iter().map(|r| *r as u64).sum();
    // floor((10 * sum / count) + 0.5) in integers
    let tenths = (20 * sum + count) / (2 * count);
    (tenths as f64 / 10.0, count)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewStats {
    pub consultant: Uuid,
    pub total: u64,
    pub average: f64,
    /// `distribution[0]` counts 1-star reviews, `distribution[4]` 5-star.
    pub distribution: [u64; 5],
}

impl ReviewStats {
    pub fn from_ratings(consultant: Uuid, ratings: &[u8]) -> Self {
        let mut distribution = [0u64; 5];
        for rating in ratings {
            if (MIN_RATING..=MAX_RATING).contains(rating) {
                distribution[(*rating - MIN_RATING) as usize] += 1;
            }
        }
        let (average, total) = aggregate(ratings);
        Self {
            consultant,
            total,
            average,
            distribution,
        }
    }
}

/// Paging for review listings, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewQuery {
    pub min_rating: Option<u8>,
    pub page: u32,
    pub limit: u32,
}

impl ReviewQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_rating(mut self, rating: u8) -> Self {
        self.min_rating = Some(rating);
        self
    }

    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    pub(crate) fn normalized(mut self, config: &crate::MarketConfig) -> Self {
        self.page = self.page.max(1);
        self.limit = config.page_limit(self.limit);
        self
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }

    pub fn matches(&self, review: &Review) -> bool {
        self.min_rating.is_none_or(|min| review.rating >= min)
    }
}

/// Whose reviews to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewScope {
    Consultant(Uuid),
    Client(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_rounds_to_one_decimal() {
        assert_eq!(aggregate(&[4, 5, 3]), (4.0, 3));
        assert_eq!(aggregate(&[4, 5, 5]), (4.7, 3));
        assert_eq!(aggregate(&[5, 4]), (4.5, 2));
        assert_eq!(aggregate(&[1, 2, 2]), (1.7, 3));
        assert_eq!(aggregate(&[]), (0.0, 0));
    }

    #[test]
    fn half_rounds_up() {
        // 4.25 -> 4.3
        assert_eq!(aggregate(&[5, 4, 4, 4]).0, 4.3);
    }

    #[test]
    fn rating_bounds() {
        assert!(validate(0, "").is_err());
        assert!(validate(6, "").is_err());
        assert!(validate(1, "").is_ok());
        assert!(validate(5, &"x".repeat(MAX_COMMENT_CHARS)).is_ok());
        assert!(validate(5, &"x".repeat(MAX_COMMENT_CHARS + 1)).is_err());
    }

    #[test]
    fn stats_histogram() {
        let stats = ReviewStats::from_ratings(Uuid::now_v7(), &[5, 5, 4, 1]);
        assert_eq!(stats.distribution, [1, 0, 0, 1, 2]);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.average, 3.8);
    }
}
