//! Swipe ledger: one row per (swiper, item)
use super::error::Result;
use super::model::{Swipe, SwipeDirection, TimeStamp};
use super::store::{Store, composite_key};
use tracing::debug;

/// Write path for swipe rows. A failed write never fails the swipe itself.
pub trait SwipeRecorder: Send + Sync {
    /// Upsert the swipe of `swiper` on `item`, returning the swipe it replaced.
    fn record(&self, swiper: &str, item: &str, direction: SwipeDirection) -> Result<Option<Swipe>>;
}

#[derive(Clone)]
pub struct SwipeLedger {
    store: Store,
}

impl SwipeLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn swipe(&self, swiper: &str, item: &str) -> Result<Option<Swipe>> {
        self.store
            .get(&self.store.swipes, &composite_key(swiper, item))
    }
}

impl SwipeRecorder for SwipeLedger {
    /// Re-swiping overwrites the direction instead of adding a row.
    fn record(&self, swiper: &str, item: &str, direction: SwipeDirection) -> Result<Option<Swipe>> {
        let swipe = Swipe {
            swiper: swiper.to_string(),
            item: item.to_string(),
            direction,
            swiped_at: TimeStamp::new(),
        };
        let previous = self
            .store
            .put(&self.store.swipes, &composite_key(swiper, item), &swipe)?;

        debug!(swiper, item, ?direction, replaced = previous.is_some(), "swipe recorded");
        Ok(previous)
    }
}
