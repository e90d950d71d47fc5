//! Conventions for reading the authenticity oracle
//!
//! The oracle itself is an external collaborator and deal transitions never
//! wait on it. Its only contract is a confidence score between 0 and 100.
use super::model::{Item, ItemStatus};
use serde::Serialize;

/// The brand tag photo sits in slot 1; single-photo listings use slot 0.
pub const AUTHENTICITY_PHOTO_INDEX: usize = 1;

pub fn authenticity_photo(item: &Item) -> Option<&str> {
    item.images
        .get(AUTHENTICITY_PHOTO_INDEX)
        .or_else(|| item.images.first())
        .map(String::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub confidence: u8,
    pub verified: bool,
    pub status: ItemStatus,
}

impl Verdict {
    /// Interpret an oracle score against `threshold`, clamping it to 0..=100.
    pub fn from_confidence(score: i64, threshold: u8) -> Self {
        let confidence = u8::try_from(score.clamp(0, 100)).unwrap_or(0);
        let verified = confidence >= threshold;
        Self {
            confidence,
            verified,
            status: if verified {
                ItemStatus::Available
            } else {
                ItemStatus::PendingReview
            },
        }
    }
}
