//! Conversation records and the deal state machine
//!
//! A conversation moves `interested -> deal_agreed -> completed`, or to
//! `cancelled` from any non-terminal state. Agreement and completion need a
//! confirmation from both participants; cancellation needs one. The decision
//! logic here is pure: [`Conversation::transition`] never touches storage, so
//! the store can retry it inside a compare-and-swap loop.
use super::error::{DealError, Result};
use super::model::{ItemId, TimeStamp, UserId};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    #[n(0)]
    Interested,
    #[n(1)]
    DealAgreed,
    #[n(2)]
    Completed,
    #[n(3)]
    Cancelled,
}

impl DealStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DealStatus::Completed | DealStatus::Cancelled)
    }
    pub fn as_str(self) -> &'static str {
        match self {
            DealStatus::Interested => "interested",
            DealStatus::DealAgreed => "deal_agreed",
            DealStatus::Completed => "completed",
            DealStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealAction {
    Agree,
    Complete,
    Cancel,
}

impl FromStr for DealAction {
    type Err = DealError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "agree" => Ok(DealAction::Agree),
            "complete" => Ok(DealAction::Complete),
            "cancel" => Ok(DealAction::Cancel),
            other => Err(DealError::InvalidAction(other.to_string())),
        }
    }
}

/// What a successful, state-changing transition did.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealEvent {
    AgreedWaiting,
    MutuallyAgreed,
    CompletedWaiting,
    Completed,
    Cancelled,
}

impl DealEvent {
    pub fn system_message(self, actor: &str) -> String {
        match self {
            DealEvent::AgreedWaiting => {
                format!("{actor} agreed to the deal. Waiting for the other party...")
            }
            DealEvent::MutuallyAgreed => "Both parties agreed to the deal!".to_string(),
            DealEvent::CompletedWaiting => format!(
                "{actor} marked this swap as complete. Waiting for the other party to confirm..."
            ),
            DealEvent::Completed => {
                "Swap completed! Both users confirmed the exchange.".to_string()
            }
            DealEvent::Cancelled => format!("This deal was cancelled by {actor}."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

/// Order two identities so the smaller one always comes first.
pub fn canonical_pair(x: &str, y: &str) -> (UserId, UserId) {
    if x <= y {
        (x.to_string(), y.to_string())
    } else {
        (y.to_string(), x.to_string())
    }
}

/// Key of the pair index. Conversations are unique per pair, not per item.
pub fn pair_key(x: &str, y: &str) -> Vec<u8> {
    let (a, b) = canonical_pair(x, y);
    let mut key = Vec::with_capacity(a.len() + b.len() + 1);
    key.extend_from_slice(a.as_bytes());
    key.push(0);
    key.extend_from_slice(b.as_bytes());
    key
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_a: UserId, // canonical ordering: user_a < user_b
    #[n(2)]
    pub user_b: UserId,
    #[n(3)]
    pub item: Option<ItemId>, // item that opened the thread
    #[n(4)]
    pub status: DealStatus,
    #[n(5)]
    pub deal_agreed_by: BTreeSet<UserId>,
    #[n(6)]
    pub completed_by: BTreeSet<UserId>,
    #[n(7)]
    pub cancelled_by: Option<UserId>,
    #[n(8)]
    pub unread_a: u64,
    #[n(9)]
    pub unread_b: u64,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub last_message_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub deal_agreed_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
}

impl Conversation {
    pub fn new(id: String, first: &str, second: &str, item: Option<ItemId>) -> Self {
        let (user_a, user_b) = canonical_pair(first, second);
        Self {
            id,
            user_a,
            user_b,
            item,
            status: DealStatus::Interested,
            deal_agreed_by: BTreeSet::new(),
            completed_by: BTreeSet::new(),
            cancelled_by: None,
            unread_a: 0,
            unread_b: 0,
            created_at: TimeStamp::new(),
            last_message_at: None,
            deal_agreed_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    pub fn pair_key(&self) -> Vec<u8> {
        pair_key(&self.user_a, &self.user_b)
    }

    pub fn slot_of(&self, user: &str) -> Option<Slot> {
        if user == self.user_a {
            Some(Slot::A)
        } else if user == self.user_b {
            Some(Slot::B)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user: &str) -> bool {
        self.slot_of(user).is_some()
    }

    pub fn other_participant(&self, user: &str) -> Option<&str> {
        match self.slot_of(user)? {
            Slot::A => Some(&self.user_b),
            Slot::B => Some(&self.user_a),
        }
    }

    pub fn require_participant(&self, user: &str) -> Result<Slot> {
        self.slot_of(user).ok_or_else(|| {
            DealError::Forbidden(format!("{user} is not part of conversation {}", self.id))
        })
    }

    pub fn unread_for(&self, user: &str) -> u64 {
        match self.slot_of(user) {
            Some(Slot::A) => self.unread_a,
            Some(Slot::B) => self.unread_b,
            None => 0,
        }
    }

    /// Count a new message from `sender` against the other participant.
    pub fn record_message_from(&mut self, sender: &str, at: TimeStamp<Utc>) {
        match self.slot_of(sender) {
            Some(Slot::A) => self.unread_b += 1,
            Some(Slot::B) => self.unread_a += 1,
            None => {}
        }
        self.last_message_at = Some(at);
    }

    /// Remove `count` acknowledged messages from the reader's badge.
    pub fn acknowledge_reads(&mut self, reader: &str, count: u64) {
        match self.slot_of(reader) {
            Some(Slot::A) => self.unread_a = self.unread_a.saturating_sub(count),
            Some(Slot::B) => self.unread_b = self.unread_b.saturating_sub(count),
            None => {}
        }
    }

    /// Decide the outcome of `action` requested by `actor`.
    ///
    /// `Ok(None)` means the request repeats a confirmation that is already
    /// recorded and leaves the conversation untouched.
    pub fn transition(
        &self,
        actor: &str,
        action: DealAction,
        now: TimeStamp<Utc>,
    ) -> Result<Option<(Conversation, DealEvent)>> {
        self.require_participant(actor)?;

        match action {
            DealAction::Agree => self.agree(actor, now),
            DealAction::Complete => self.complete(actor, now),
            DealAction::Cancel => self.cancel(actor, now),
        }
    }

    fn agree(&self, actor: &str, now: TimeStamp<Utc>) -> Result<Option<(Conversation, DealEvent)>> {
        if self.deal_agreed_by.contains(actor) && self.status != DealStatus::Cancelled {
            return Ok(None);
        }
        if self.status.is_terminal() {
            return Err(self.terminal_error("agree to"));
        }

        let mut next = self.clone();
        next.deal_agreed_by.insert(actor.to_string());

        if next.deal_agreed_by.len() == 2 {
            next.status = DealStatus::DealAgreed;
            next.deal_agreed_at = Some(now);
            Ok(Some((next, DealEvent::MutuallyAgreed)))
        } else {
            Ok(Some((next, DealEvent::AgreedWaiting)))
        }
    }

    fn complete(
        &self,
        actor: &str,
        now: TimeStamp<Utc>,
    ) -> Result<Option<(Conversation, DealEvent)>> {
        match self.status {
            DealStatus::Cancelled => return Err(self.terminal_error("complete")),
            DealStatus::Completed if self.completed_by.contains(actor) => return Ok(None),
            DealStatus::Completed => return Err(self.terminal_error("complete")),
            DealStatus::Interested => {
                return Err(DealError::PreconditionFailed(
                    "deal must be agreed before completing".to_string(),
                ));
            }
            DealStatus::DealAgreed => {}
        }
        if self.completed_by.contains(actor) {
            return Ok(None);
        }

        let mut next = self.clone();
        next.completed_by.insert(actor.to_string());

        if next.completed_by.len() == 2 {
            next.status = DealStatus::Completed;
            next.completed_at = Some(now);
            Ok(Some((next, DealEvent::Completed)))
        } else {
            Ok(Some((next, DealEvent::CompletedWaiting)))
        }
    }

    fn cancel(&self, actor: &str, now: TimeStamp<Utc>) -> Result<Option<(Conversation, DealEvent)>> {
        match self.status {
            DealStatus::Completed => Err(DealError::InvalidState(
                "cannot cancel a completed swap".to_string(),
            )),
            DealStatus::Cancelled => Ok(None),
            DealStatus::Interested | DealStatus::DealAgreed => {
                let mut next = self.clone();
                next.status = DealStatus::Cancelled;
                next.cancelled_by = Some(actor.to_string());
                next.cancelled_at = Some(now);
                Ok(Some((next, DealEvent::Cancelled)))
            }
        }
    }

    fn terminal_error(&self, verb: &str) -> DealError {
        DealError::InvalidState(format!(
            "cannot {verb} a deal in conversation {} which is {}",
            self.id,
            self.status.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        Conversation::new("conv_test".into(), "22", "11", Some("item_x".into()))
    }

    fn apply(conv: &Conversation, actor: &str, action: DealAction) -> Conversation {
        conv.transition(actor, action, TimeStamp::new())
            .unwrap()
            .map(|(next, _)| next)
            .unwrap_or_else(|| conv.clone())
    }

    #[test]
    fn participants_are_stored_in_canonical_order() {
        let conv = conversation();
        assert_eq!(conv.user_a, "11");
        assert_eq!(conv.user_b, "22");
        assert_eq!(pair_key("11", "22"), pair_key("22", "11"));
    }

    #[test]
    fn second_agreement_moves_to_deal_agreed() {
        let conv = conversation();

        let (after_a, event) = conv
            .transition("11", DealAction::Agree, TimeStamp::new())
            .unwrap()
            .unwrap();
        assert_eq!(event, DealEvent::AgreedWaiting);
        assert_eq!(after_a.status, DealStatus::Interested);

        let (after_b, event) = after_a
            .transition("22", DealAction::Agree, TimeStamp::new())
            .unwrap()
            .unwrap();
        assert_eq!(event, DealEvent::MutuallyAgreed);
        assert_eq!(after_b.status, DealStatus::DealAgreed);
        assert!(after_b.deal_agreed_at.is_some());
    }

    #[test]
    fn repeated_agreement_is_a_no_op() {
        let conv = apply(&conversation(), "11", DealAction::Agree);
        assert!(conv
            .transition("11", DealAction::Agree, TimeStamp::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn complete_requires_agreement() {
        let err = conversation()
            .transition("11", DealAction::Complete, TimeStamp::new())
            .unwrap_err();
        assert!(matches!(err, DealError::PreconditionFailed(_)));
    }

    #[test]
    fn completed_swaps_cannot_be_cancelled() {
        let mut conv = conversation();
        for (actor, action) in [
            ("11", DealAction::Agree),
            ("22", DealAction::Agree),
            ("11", DealAction::Complete),
            ("22", DealAction::Complete),
        ] {
            conv = apply(&conv, actor, action);
        }
        assert_eq!(conv.status, DealStatus::Completed);

        let err = conv
            .transition("11", DealAction::Cancel, TimeStamp::new())
            .unwrap_err();
        assert!(matches!(err, DealError::InvalidState(_)));
    }

    #[test]
    fn strangers_are_forbidden() {
        let err = conversation()
            .transition("33", DealAction::Cancel, TimeStamp::new())
            .unwrap_err();
        assert!(matches!(err, DealError::Forbidden(_)));
    }

    #[test]
    fn unread_counts_target_the_recipient() {
        let mut conv = conversation();
        conv.record_message_from("11", TimeStamp::new());
        assert_eq!(conv.unread_for("22"), 1);
        assert_eq!(conv.unread_for("11"), 0);

        conv.acknowledge_reads("22", 5);
        assert_eq!(conv.unread_for("22"), 0);
    }

    #[test]
    fn unknown_actions_are_rejected() {
        let err = "steal".parse::<DealAction>().unwrap_err();
        assert!(matches!(err, DealError::InvalidAction(a) if a == "steal"));
    }
}
