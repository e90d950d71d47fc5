//! Reviews left after a completed swap
use super::conversation::{Conversation, DealStatus};
use super::effects::{PointGrant, PrivilegedWriter, RewardKind};
use super::error::{DealError, Result};
use super::model::{TimeStamp, UserId};
use super::store::{Store, composite_key, decode, encode};
use super::utils::new_uuid_to_bech32;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Review {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub reviewer: UserId,
    #[n(2)]
    pub reviewee: UserId,
    #[n(3)]
    pub conversation_id: String,
    #[n(4)]
    pub rating: u8,
    #[n(5)]
    pub comment: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub reviews: Vec<Review>, // newest first
    pub average_rating: f64,
    pub total_count: usize,
}

#[derive(Clone)]
pub struct ReviewBook {
    store: Store,
    writer: Arc<dyn PrivilegedWriter>,
    five_star_reward: u64,
}

impl ReviewBook {
    pub fn new(store: Store, writer: Arc<dyn PrivilegedWriter>, five_star_reward: u64) -> Self {
        Self {
            store,
            writer,
            five_star_reward,
        }
    }

    /// Record `reviewer`'s review of the other participant. One review per
    /// reviewer and conversation; a repeat returns the stored review.
    pub fn leave(
        &self,
        conversation: &Conversation,
        reviewer: &str,
        reviewee: &str,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Review> {
        if !(1..=5).contains(&rating) {
            return Err(DealError::Validation("rating must be between 1 and 5".into()));
        }
        conversation.require_participant(reviewer)?;
        if conversation.status != DealStatus::Completed {
            return Err(DealError::InvalidState(
                "only completed swaps can be reviewed".into(),
            ));
        }
        if conversation.other_participant(reviewer) != Some(reviewee) {
            return Err(DealError::Validation(format!(
                "{reviewee} is not the other participant of this swap"
            )));
        }

        let review = Review {
            id: new_uuid_to_bech32("review_")?,
            reviewer: reviewer.to_string(),
            reviewee: reviewee.to_string(),
            conversation_id: conversation.id.clone(),
            rating,
            comment,
            created_at: TimeStamp::new(),
        };
        let key = composite_key(reviewer, &conversation.id);
        if let Some(existing) = self
            .store
            .insert_if_absent(&self.store.reviews, &key, encode(&review)?)?
        {
            return decode(&existing);
        }
        info!(review_id = %review.id, reviewee, rating, "review recorded");

        if rating == 5 {
            let grant = PointGrant {
                user: reviewee.to_string(),
                amount: self.five_star_reward,
                kind: RewardKind::ReviewPoints,
            };
            if let Err(e) = self.writer.grant(&review.id, &grant) {
                error!(review_id = %review.id, error = %e, "failed to grant five star review points");
            }
        }
        Ok(review)
    }

    pub fn about(&self, user: &str) -> Result<ReviewSummary> {
        let mut reviews = vec![];
        for entry in self.store.reviews.iter() {
            let (_, bytes) = entry?;
            let review: Review = decode(&bytes)?;
            if review.reviewee == user {
                reviews.push(review);
            }
        }
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total_count = reviews.len();
        let average_rating = if total_count == 0 {
            0.0
        } else {
            let sum: u32 = reviews.iter().map(|r| u32::from(r.rating)).sum();
            (f64::from(sum) / total_count as f64 * 10.0).round() / 10.0
        };

        Ok(ReviewSummary {
            reviews,
            average_rating,
            total_count,
        })
    }
}
