//! Conversation registry
//!
//! At most one live conversation exists per canonical user pair. The pair
//! index maps `user_a \0 user_b` to the id of the pair's current
//! conversation and is only ever written inside a transaction that checks
//! the id it expects to replace, so two racing matches resolve to the same
//! row.
use super::conversation::{Conversation, pair_key};
use super::error::{DealError, Result};
use super::model::ItemId;
use super::store::{Store, composite_key, decode, encode, flatten, prefix_of};
use super::utils::new_uuid_to_bech32;
use sled::transaction::ConflictableTransactionResult;
use sled::{IVec, Transactional};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Ensured {
    pub conversation: Conversation,
    pub is_new: bool,
}

#[derive(Clone)]
pub struct ConversationRegistry {
    store: Store,
}

impl ConversationRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn conversation(&self, id: &str) -> Result<Conversation> {
        self.store
            .conversation(id)?
            .ok_or_else(|| DealError::not_found("conversation", id))
    }

    /// Find the live conversation between two users or create it.
    ///
    /// A terminal conversation is never reused: the pair index is swapped
    /// over to a fresh conversation instead.
    pub fn ensure(&self, first: &str, second: &str, origin_item: Option<ItemId>) -> Result<Ensured> {
        let key = pair_key(first, second);

        loop {
            let current = self.store.pairs.get(&key)?;
            if let Some(id) = &current {
                let id = String::from_utf8_lossy(id).into_owned();
                match self.store.conversation(&id)? {
                    Some(conversation) if !conversation.status.is_terminal() => {
                        return Ok(Ensured {
                            conversation,
                            is_new: false,
                        });
                    }
                    _ => debug!(conversation_id = %id, "pair conversation is closed, replacing"),
                }
            }

            let conversation = Conversation::new(
                new_uuid_to_bech32("conv_")?,
                first,
                second,
                origin_item.clone(),
            );
            if self.claim_pair(&key, current, &conversation)? {
                info!(
                    conversation_id = %conversation.id,
                    user_a = %conversation.user_a,
                    user_b = %conversation.user_b,
                    "conversation created"
                );
                return Ok(Ensured {
                    conversation,
                    is_new: true,
                });
            }
            // lost the race: loop around and resolve to the winner's row
        }
    }

    /// Point the pair index at `conversation` if it still holds `expected`.
    ///
    /// The row, the pair index and both user index entries are written in
    /// one transaction, or not at all.
    fn claim_pair(&self, key: &[u8], expected: Option<IVec>, conversation: &Conversation) -> Result<bool> {
        let row = encode(conversation)?;
        let trees = (
            &self.store.conversations,
            &self.store.pairs,
            &self.store.user_conversations,
        );

        let claimed = flatten(trees.transaction(
            |(conversations, pairs, user_index)| -> ConflictableTransactionResult<bool, DealError> {
                if pairs.get(key)? != expected {
                    return Ok(false);
                }
                conversations.insert(conversation.id.as_bytes(), row.clone())?;
                pairs.insert(key, conversation.id.as_bytes())?;
                for user in [&conversation.user_a, &conversation.user_b] {
                    user_index.insert(composite_key(user, &conversation.id), Vec::<u8>::new())?;
                }
                Ok(true)
            },
        ))?;

        if !claimed {
            debug!(conversation_id = %conversation.id, "pair claimed concurrently, discarding");
        }
        Ok(claimed)
    }

    /// Every conversation `user` takes part in, live or closed.
    pub fn for_user(&self, user: &str) -> Result<Vec<Conversation>> {
        let prefix = prefix_of(user);
        let mut conversations = vec![];

        for entry in self.store.user_conversations.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let id = &key[prefix.len()..];
            if let Some(bytes) = self.store.conversations.get(id)? {
                conversations.push(decode(&bytes)?);
            }
        }
        Ok(conversations)
    }
}
