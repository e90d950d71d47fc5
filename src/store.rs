//! Sled-backed persistence shared by every component
//!
//! Each entity family lives in its own tree. Coordination between concurrent
//! callers only ever happens here: [`Store::insert_if_absent`] for unique
//! keys and [`Store::update`] for read-modify-write of a single record.
use super::config::StoreConfig;
use super::conversation::Conversation;
use super::error::{DealError, Result};
use super::model::{Item, ItemStatus, Profile};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Tree};
use std::sync::Arc;
use tracing::debug;

const ITEMS: &str = "items";
const PROFILES: &str = "profiles";
const SWIPES: &str = "swipes";
const CONVERSATIONS: &str = "conversations";
const PAIR_INDEX: &str = "conversation_pairs";
const USER_INDEX: &str = "user_conversations";
const MESSAGES: &str = "messages";
const REVIEWS: &str = "reviews";
const SIDE_EFFECTS: &str = "side_effects";
const SIDE_EFFECT_FAILURES: &str = "side_effect_failures";

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
    pub(crate) items: Tree,
    pub(crate) profiles: Tree,
    pub(crate) swipes: Tree,
    pub(crate) conversations: Tree,
    pub(crate) pairs: Tree,
    pub(crate) user_conversations: Tree,
    pub(crate) messages: Tree,
    pub(crate) reviews: Tree,
    pub(crate) side_effects: Tree,
    pub(crate) side_effect_failures: Tree,
}

/// Result of a compare-and-swap update.
///
/// `record` is the stored value after the call: the replacement when the
/// closure asked for one, the untouched current value otherwise.
#[derive(Debug)]
pub(crate) struct Committed<T, R> {
    pub record: T,
    pub outcome: Option<R>,
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

/// Abort the running sled transaction with `e`.
pub(crate) fn abort<E: Into<DealError>>(e: E) -> ConflictableTransactionError<DealError> {
    ConflictableTransactionError::Abort(e.into())
}

/// Turn the result of a multi-tree transaction back into a [`Result`].
pub(crate) fn flatten<T>(result: std::result::Result<T, TransactionError<DealError>>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

/// `a \0 b` composite key.
pub(crate) fn composite_key(a: &str, b: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(a.len() + b.len() + 1);
    key.extend_from_slice(a.as_bytes());
    key.push(0);
    key.extend_from_slice(b.as_bytes());
    key
}

/// Prefix shared by every composite key starting with `a`.
pub(crate) fn prefix_of(a: &str) -> Vec<u8> {
    let mut key = a.as_bytes().to_vec();
    key.push(0);
    key
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            items: instance.open_tree(ITEMS)?,
            profiles: instance.open_tree(PROFILES)?,
            swipes: instance.open_tree(SWIPES)?,
            conversations: instance.open_tree(CONVERSATIONS)?,
            pairs: instance.open_tree(PAIR_INDEX)?,
            user_conversations: instance.open_tree(USER_INDEX)?,
            messages: instance.open_tree(MESSAGES)?,
            reviews: instance.open_tree(REVIEWS)?,
            side_effects: instance.open_tree(SIDE_EFFECTS)?,
            side_effect_failures: instance.open_tree(SIDE_EFFECT_FAILURES)?,
            instance,
        })
    }

    pub fn open(config: &StoreConfig) -> Result<Self> {
        let db = sled::open(&config.path)?;
        Self::new(Arc::new(db))
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::new(Arc::new(db))
    }

    pub fn flush(&self) -> Result<()> {
        self.instance.flush()?;
        Ok(())
    }

    /// Monotonic sequence used to order messages.
    pub(crate) fn next_sequence(&self) -> Result<u64> {
        Ok(self.instance.generate_id()?)
    }

    pub(crate) fn get<T>(&self, tree: &Tree, key: &[u8]) -> Result<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        tree.get(key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Write `value` and return the record it replaced, if any.
    pub(crate) fn put<T>(&self, tree: &Tree, key: &[u8], value: &T) -> Result<Option<T>>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
    {
        tree.insert(key, encode(value)?)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Atomically insert `value` under `key` unless the key already exists.
    ///
    /// Returns `None` when this call wrote the value, otherwise the bytes of
    /// the record that won.
    pub(crate) fn insert_if_absent(
        &self,
        tree: &Tree,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<Option<IVec>> {
        match tree.compare_and_swap(key, None::<&[u8]>, Some(value))? {
            Ok(()) => Ok(None),
            Err(conflict) => Ok(conflict.current),
        }
    }

    /// Read-modify-write a single record with compare-and-swap.
    ///
    /// `f` receives the current record and returns the replacement plus an
    /// outcome, or `None` to leave the record unchanged. It is re-run against
    /// the fresh value whenever another writer got there first, so it must
    /// not have side effects.
    pub(crate) fn update<T, R, F>(
        &self,
        tree: &Tree,
        key: &[u8],
        kind: &'static str,
        mut f: F,
    ) -> Result<Committed<T, R>>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnMut(&T) -> Result<Option<(T, R)>>,
    {
        loop {
            let Some(old) = tree.get(key)? else {
                return Err(DealError::not_found(
                    kind,
                    String::from_utf8_lossy(key).into_owned(),
                ));
            };
            let current: T = decode(&old)?;

            let Some((next, outcome)) = f(&current)? else {
                return Ok(Committed {
                    record: current,
                    outcome: None,
                });
            };

            match tree.compare_and_swap(key, Some(&old), Some(encode(&next)?))? {
                Ok(()) => {
                    return Ok(Committed {
                        record: next,
                        outcome: Some(outcome),
                    });
                }
                Err(_) => debug!(kind, "concurrent write detected, retrying update"),
            }
        }
    }

    pub fn conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.get(&self.conversations, id.as_bytes())
    }

    // Item directory collaborator

    pub fn put_item(&self, item: &Item) -> Result<()> {
        self.put(&self.items, item.id.as_bytes(), item)?;
        Ok(())
    }

    pub fn item(&self, id: &str) -> Result<Option<Item>> {
        self.get(&self.items, id.as_bytes())
    }

    /// Items of `owner`, optionally restricted to one status. Soft-deleted
    /// items are never listed.
    pub fn items_by_owner(&self, owner: &str, status: Option<ItemStatus>) -> Result<Vec<Item>> {
        let mut items = vec![];
        for entry in self.items.iter() {
            let (_, bytes) = entry?;
            let item: Item = decode(&bytes)?;
            if item.owner == owner
                && item.deleted_at.is_none()
                && status.is_none_or(|s| s == item.status)
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    // Profile collaborator

    pub fn put_profile(&self, profile: &Profile) -> Result<()> {
        self.put(&self.profiles, profile.id.as_bytes(), profile)?;
        Ok(())
    }

    /// Reward state of `user`, zeroed when no profile row exists yet.
    pub fn profile(&self, user: &str) -> Result<Profile> {
        Ok(self
            .get(&self.profiles, user.as_bytes())?
            .unwrap_or_else(|| Profile::new(user)))
    }
}
