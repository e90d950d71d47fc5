//! Records shared by the swipe ledger, the conversation registry and the collaborators
use super::error::DealError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::str::FromStr;

pub type UserId = String;
pub type ItemId = String;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// `Utc` itself is not `Ord`, so ordering is delegated to the inner instant.
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl Serialize for TimeStamp<Utc> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[n(0)]
    PendingReview,
    #[n(1)]
    Available,
    #[n(2)]
    Swapped,
    #[n(3)]
    Deleted,
}

// Owned by the item directory; the engine only ever flips `status` to swapped.
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    #[n(0)]
    pub id: ItemId,
    #[n(1)]
    pub owner: UserId,
    #[n(2)]
    pub status: ItemStatus,
    #[n(3)]
    pub title: String,
    #[n(4)]
    pub images: Vec<String>,
    #[n(5)]
    pub brand: Option<String>,
    #[n(6)]
    pub size: Option<String>,
    #[n(7)]
    pub deleted_at: Option<TimeStamp<Utc>>,
}

impl Item {
    pub fn new(id: impl Into<ItemId>, owner: impl Into<UserId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            status: ItemStatus::Available,
            title: title.into(),
            images: vec![],
            brand: None,
            size: None,
            deleted_at: None,
        }
    }
    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }
    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }
    /// Only an available, non soft-deleted item can be swiped on or proposed.
    pub fn is_offerable(&self) -> bool {
        self.status == ItemStatus::Available && self.deleted_at.is_none()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub eco_points: u64, // granted on swap completion
    #[n(2)]
    pub points: u64, // granted on five star reviews
}

impl Profile {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    #[n(0)]
    Left,
    #[n(1)]
    Right,
}

impl FromStr for SwipeDirection {
    type Err = DealError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(SwipeDirection::Left),
            "right" => Ok(SwipeDirection::Right),
            other => Err(DealError::InvalidDirection(other.to_string())),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Swipe {
    #[n(0)]
    pub swiper: UserId,
    #[n(1)]
    pub item: ItemId,
    #[n(2)]
    pub direction: SwipeDirection,
    #[n(3)]
    pub swiped_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[n(0)]
    Text,
    #[n(1)]
    ItemProposal,
    #[n(2)]
    System,
}

impl FromStr for MessageKind {
    type Err = DealError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "item_proposal" => Ok(MessageKind::ItemProposal),
            "system" => Ok(MessageKind::System),
            other => Err(DealError::Validation(format!(
                "message type must be text | item_proposal, got '{other}'"
            ))),
        }
    }
}

// carried by item_proposal messages
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProposalMetadata {
    #[n(0)]
    pub item_id: ItemId,
    #[n(1)]
    pub item_title: Option<String>,
    #[n(2)]
    pub item_image: Option<String>,
    #[n(3)]
    pub item_brand: Option<String>,
    #[n(4)]
    pub item_size: Option<String>,
}

impl ProposalMetadata {
    pub fn for_item(item: &Item) -> Self {
        Self {
            item_id: item.id.clone(),
            item_title: Some(item.title.clone()),
            item_image: item.images.first().cloned(),
            item_brand: item.brand.clone(),
            item_size: item.size.clone(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub conversation_id: String,
    #[n(2)]
    #[serde(skip)]
    pub seq: u64, // storage order within the conversation
    #[n(3)]
    pub sender: UserId, // for system messages, the participant whose action produced it
    #[n(4)]
    pub content: String,
    #[n(5)]
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[n(6)]
    pub metadata: Option<ProposalMetadata>,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub read_at: Option<TimeStamp<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn timestamps_sort_chronologically() {
        let early = TimeStamp::new_with(2024, 5, 1, 8, 0, 0).unwrap();
        let late = TimeStamp::new_with(2024, 5, 1, 9, 30, 0).unwrap();

        assert!(early < late);
        let mut stamps = vec![late.clone(), early.clone()];
        stamps.sort();
        assert_eq!(stamps, [early.clone(), late.clone()]);
        assert_eq!(early.clone().max(late.clone()), late);
    }

    #[test]
    fn direction_parsing_rejects_unknown_values() {
        assert_eq!("right".parse::<SwipeDirection>().unwrap(), SwipeDirection::Right);
        assert_eq!("left".parse::<SwipeDirection>().unwrap(), SwipeDirection::Left);

        let err = "up".parse::<SwipeDirection>().unwrap_err();
        assert!(matches!(err, DealError::InvalidDirection(d) if d == "up"));
    }

    #[test]
    fn soft_deleted_items_are_not_offerable() {
        let mut item = Item::new("item_1", "22", "Denim jacket");
        assert!(item.is_offerable());

        item.deleted_at = Some(TimeStamp::new());
        assert!(!item.is_offerable());

        let pending = Item::new("item_2", "22", "Scarf").with_status(ItemStatus::PendingReview);
        assert!(!pending.is_offerable());
    }
}
