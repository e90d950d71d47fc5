//! Conversation messages and unread tracking
//!
//! Every conversation keeps one unread counter per participant slot. A
//! message row and the bump of the recipient's counter are written in one
//! transaction, and a read marks rows and subtracts the number it marked in
//! another, so the counter always equals the recipient's unread rows.
use super::conversation::Conversation;
use super::error::{DealError, Result};
use super::model::{ItemId, Message, MessageKind, ProposalMetadata, TimeStamp};
use super::store::{Store, abort, decode, encode, flatten, prefix_of};
use super::utils::new_uuid_to_bech32;
use serde::Serialize;
use sled::Transactional;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>, // chronological
    pub page: usize,
    pub has_more: bool,
}

/// Which conversations a message may still be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Only while the deal is open. Checked in the same transaction as the write.
    Open,
    /// Terminal conversations too, for lifecycle announcements.
    Any,
}

#[derive(Clone)]
pub struct Inbox {
    store: Store,
}

fn message_key(conversation_id: &str, seq: u64) -> Vec<u8> {
    let mut key = prefix_of(conversation_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

impl Inbox {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Store a message and count it against the recipient.
    ///
    /// With [`Delivery::Open`] a conversation that is already terminal when
    /// the transaction runs rejects the message with `InvalidState`.
    pub fn append(
        &self,
        conversation_id: &str,
        sender: &str,
        content: String,
        kind: MessageKind,
        metadata: Option<ProposalMetadata>,
        delivery: Delivery,
    ) -> Result<Message> {
        let seq = self.store.next_sequence()?;
        let message = Message {
            id: new_uuid_to_bech32("msg_")?,
            conversation_id: conversation_id.to_string(),
            seq,
            sender: sender.to_string(),
            content,
            kind,
            metadata,
            created_at: TimeStamp::new(),
            read_at: None,
        };
        let key = message_key(conversation_id, seq);
        let row = encode(&message)?;

        let trees = (&self.store.conversations, &self.store.messages);
        flatten(trees.transaction(|(conversations, messages)| {
            let Some(bytes) = conversations.get(conversation_id.as_bytes())? else {
                return Err(abort(DealError::not_found("conversation", conversation_id)));
            };
            let mut conversation: Conversation = decode(&bytes).map_err(abort)?;
            if delivery == Delivery::Open && conversation.status.is_terminal() {
                return Err(abort(DealError::InvalidState(format!(
                    "cannot message a {} conversation",
                    conversation.status.as_str()
                ))));
            }

            conversation.record_message_from(sender, message.created_at.clone());
            conversations.insert(conversation_id.as_bytes(), encode(&conversation).map_err(abort)?)?;
            messages.insert(key.as_slice(), row.clone())?;
            Ok(())
        }))?;

        Ok(message)
    }

    /// Post a system message, logging instead of failing.
    pub fn post_system(
        &self,
        conversation_id: &str,
        sender: &str,
        content: String,
        metadata: Option<ProposalMetadata>,
        delivery: Delivery,
    ) -> Option<Message> {
        match self.append(conversation_id, sender, content, MessageKind::System, metadata, delivery) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to post system message");
                None
            }
        }
    }

    /// All messages of a conversation in the order they were stored.
    pub fn all(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.store
            .messages
            .scan_prefix(prefix_of(conversation_id))
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }

    pub fn last(&self, conversation_id: &str) -> Result<Option<Message>> {
        self.store
            .messages
            .scan_prefix(prefix_of(conversation_id))
            .next_back()
            .transpose()?
            .map(|(_, bytes)| decode(&bytes))
            .transpose()
    }

    /// Items referenced by `item_proposal` messages.
    pub fn proposed_items(&self, conversation_id: &str) -> Result<Vec<ItemId>> {
        Ok(self
            .all(conversation_id)?
            .into_iter()
            .filter(|m| m.kind == MessageKind::ItemProposal)
            .filter_map(|m| m.metadata.map(|meta| meta.item_id))
            .collect())
    }

    /// One page of history, newest page first, messages oldest first.
    pub fn page(&self, conversation_id: &str, page: usize, page_size: usize) -> Result<MessagePage> {
        if page == 0 {
            return Err(DealError::Validation("page numbers start at 1".into()));
        }
        let offset = (page - 1).saturating_mul(page_size);

        let mut messages = self
            .store
            .messages
            .scan_prefix(prefix_of(conversation_id))
            .rev()
            .skip(offset)
            .take(page_size)
            .map(|entry| {
                let (_, bytes) = entry?;
                decode::<Message>(&bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();

        Ok(MessagePage {
            has_more: messages.len() == page_size,
            messages,
            page,
        })
    }

    /// Mark the reader's unread messages as read and clear them from the badge.
    pub fn acknowledge(&self, conversation_id: &str, reader: &str) -> Result<u64> {
        let mut candidates = vec![];
        for entry in self.store.messages.scan_prefix(prefix_of(conversation_id)) {
            let (key, bytes) = entry?;
            let message: Message = decode(&bytes)?;
            if message.sender != reader && message.read_at.is_none() {
                candidates.push(key);
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let now = TimeStamp::new();
        let trees = (&self.store.conversations, &self.store.messages);
        flatten(trees.transaction(|(conversations, messages)| {
            let mut marked = 0;
            for key in &candidates {
                // another read of the same reader may have got there first
                let Some(bytes) = messages.get(key)? else {
                    continue;
                };
                let mut message: Message = decode(&bytes).map_err(abort)?;
                if message.read_at.is_some() {
                    continue;
                }
                message.read_at = Some(now.clone());
                messages.insert(key.clone(), encode(&message).map_err(abort)?)?;
                marked += 1;
            }

            if marked > 0 {
                let Some(bytes) = conversations.get(conversation_id.as_bytes())? else {
                    return Err(abort(DealError::not_found("conversation", conversation_id)));
                };
                let mut conversation: Conversation = decode(&bytes).map_err(abort)?;
                conversation.acknowledge_reads(reader, marked);
                conversations.insert(conversation_id.as_bytes(), encode(&conversation).map_err(abort)?)?;
            }
            Ok(marked)
        }))
    }

    /// Messages from the other participant that `reader` has not read.
    pub fn unread_count(&self, conversation_id: &str, reader: &str) -> Result<u64> {
        let mut count = 0;
        for entry in self.store.messages.scan_prefix(prefix_of(conversation_id)) {
            let (_, bytes) = entry?;
            let message: Message = decode(&bytes)?;
            if message.sender != reader && message.read_at.is_none() {
                count += 1;
            }
        }
        Ok(count)
    }
}
