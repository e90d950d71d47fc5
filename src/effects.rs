//! Side effects of completing a swap
//!
//! When a conversation reaches `completed` the items involved in the deal
//! are flipped to `swapped` and both participants receive eco points. These
//! rows are not owned by the caller, so the work goes through an explicit
//! [`PrivilegedWriter`] capability instead of the ordinary access path.
//!
//! The transition to `completed` is committed before any of this runs and
//! is never rolled back. A failed batch is logged, recorded in the
//! `side_effect_failures` tree for an operator, and can be re-applied with
//! `SwapService::reconcile`. Batches are keyed by conversation id in the
//! `side_effects` ledger, so applying one twice has no further effect.
use super::conversation::Conversation;
use super::error::{DealError, Result};
use super::messages::Inbox;
use super::model::{Item, ItemId, ItemStatus, Profile, TimeStamp, UserId};
use super::store::{Store, abort, decode, encode, flatten};
use super::utils::cbor_with_digest;
use chrono::Utc;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    #[n(0)]
    EcoPoints,
    #[n(1)]
    ReviewPoints,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PointGrant {
    #[n(0)]
    pub user: UserId,
    #[n(1)]
    pub amount: u64,
    #[n(2)]
    pub kind: RewardKind,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CompletionBatch {
    #[n(0)]
    pub conversation_id: String,
    #[n(1)]
    pub items: BTreeSet<ItemId>,
    #[n(2)]
    pub grants: Vec<PointGrant>,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    #[n(0)]
    pub conversation_id: String,
    #[n(1)]
    pub fingerprint: String, // sha256 of the cbor encoded batch
    #[n(2)]
    pub swapped_items: Vec<ItemId>,
    #[n(3)]
    pub skipped_items: Vec<ItemId>, // missing or soft-deleted
    #[n(4)]
    pub applied_at: TimeStamp<Utc>,
    #[n(5)]
    pub already_applied: bool,
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    #[n(0)]
    pub conversation_id: String,
    #[n(1)]
    pub reason: String,
    #[n(2)]
    pub attempts: u32,
    #[n(3)]
    pub last_failed_at: TimeStamp<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SideEffectReport {
    Applied(BatchReceipt),
    Failed(FailureRecord),
}

/// Elevated write capability for rows the acting user does not own.
pub trait PrivilegedWriter: Send + Sync {
    /// Apply a completion batch exactly once per conversation.
    fn apply_completion(&self, batch: &CompletionBatch) -> Result<BatchReceipt>;

    /// Grant points once per `grant_key`. Returns `false` if the key was
    /// already granted.
    fn grant(&self, grant_key: &str, grant: &PointGrant) -> Result<bool>;
}

fn credit(
    profiles: &TransactionalTree,
    grant: &PointGrant,
) -> std::result::Result<(), ConflictableTransactionError<DealError>> {
    let mut profile = match profiles.get(grant.user.as_bytes())? {
        Some(bytes) => decode::<Profile>(&bytes).map_err(abort)?,
        None => Profile::new(&grant.user),
    };
    // increment what is stored, never overwrite it
    match grant.kind {
        RewardKind::EcoPoints => profile.eco_points = profile.eco_points.saturating_add(grant.amount),
        RewardKind::ReviewPoints => profile.points = profile.points.saturating_add(grant.amount),
    }
    profiles.insert(grant.user.as_bytes(), encode(&profile).map_err(abort)?)?;
    Ok(())
}

/// [`PrivilegedWriter`] running each batch as one sled transaction over the
/// items, profiles and ledger trees.
#[derive(Clone)]
pub struct SledPrivilegedWriter {
    store: Store,
}

impl SledPrivilegedWriter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl PrivilegedWriter for SledPrivilegedWriter {
    fn apply_completion(&self, batch: &CompletionBatch) -> Result<BatchReceipt> {
        let (fingerprint, _) = cbor_with_digest(batch)?;
        let key = format!("completion:{}", batch.conversation_id);

        let trees = (
            &self.store.items,
            &self.store.profiles,
            &self.store.side_effects,
        );
        flatten(trees.transaction(|(items, profiles, ledger)| {
            if let Some(bytes) = ledger.get(key.as_bytes())? {
                let receipt = decode::<BatchReceipt>(&bytes).map_err(abort)?;
                return Ok(BatchReceipt {
                    already_applied: true,
                    ..receipt
                });
            }

            let mut swapped_items = vec![];
            let mut skipped_items = vec![];
            for id in &batch.items {
                let Some(bytes) = items.get(id.as_bytes())? else {
                    skipped_items.push(id.clone());
                    continue;
                };
                let mut item = decode::<Item>(&bytes).map_err(abort)?;
                if item.deleted_at.is_some() || item.status == ItemStatus::Deleted {
                    skipped_items.push(id.clone());
                    continue;
                }
                item.status = ItemStatus::Swapped;
                items.insert(id.as_bytes(), encode(&item).map_err(abort)?)?;
                swapped_items.push(id.clone());
            }

            for grant in &batch.grants {
                credit(profiles, grant)?;
            }

            let receipt = BatchReceipt {
                conversation_id: batch.conversation_id.clone(),
                fingerprint: fingerprint.clone(),
                swapped_items,
                skipped_items,
                applied_at: TimeStamp::new(),
                already_applied: false,
            };
            ledger.insert(key.as_bytes(), encode(&receipt).map_err(abort)?)?;
            Ok(receipt)
        }))
    }

    fn grant(&self, grant_key: &str, grant: &PointGrant) -> Result<bool> {
        let key = format!("grant:{grant_key}");
        let trees = (&self.store.profiles, &self.store.side_effects);

        flatten(trees.transaction(|(profiles, ledger)| {
            if ledger.get(key.as_bytes())?.is_some() {
                return Ok(false);
            }
            credit(profiles, grant)?;
            ledger.insert(key.as_bytes(), encode(grant).map_err(abort)?)?;
            Ok(true)
        }))
    }
}

#[derive(Clone)]
pub struct SideEffectExecutor {
    store: Store,
    inbox: Inbox,
    writer: Arc<dyn PrivilegedWriter>,
    completion_reward: u64,
}

impl SideEffectExecutor {
    pub fn new(store: Store, writer: Arc<dyn PrivilegedWriter>, completion_reward: u64) -> Self {
        Self {
            inbox: Inbox::new(store.clone()),
            store,
            writer,
            completion_reward,
        }
    }

    /// The origin item plus every item proposed in the conversation, and one
    /// reward per participant.
    pub fn collect_batch(&self, conversation: &Conversation) -> Result<CompletionBatch> {
        let mut items: BTreeSet<ItemId> = conversation.item.iter().cloned().collect();
        items.extend(self.inbox.proposed_items(&conversation.id)?);

        let grants = [&conversation.user_a, &conversation.user_b]
            .into_iter()
            .map(|user| PointGrant {
                user: user.clone(),
                amount: self.completion_reward,
                kind: RewardKind::EcoPoints,
            })
            .collect();

        Ok(CompletionBatch {
            conversation_id: conversation.id.clone(),
            items,
            grants,
        })
    }

    fn apply(&self, conversation: &Conversation) -> Result<BatchReceipt> {
        let batch = self.collect_batch(conversation)?;
        self.writer.apply_completion(&batch)
    }

    /// Run the completion side effects. Failures are reported, never raised.
    pub fn run(&self, conversation: &Conversation) -> SideEffectReport {
        match self.apply(conversation) {
            Ok(receipt) => {
                info!(
                    conversation_id = %conversation.id,
                    swapped = receipt.swapped_items.len(),
                    skipped = receipt.skipped_items.len(),
                    already_applied = receipt.already_applied,
                    "swap side effects applied"
                );
                if !receipt.skipped_items.is_empty() {
                    warn!(conversation_id = %conversation.id, skipped = ?receipt.skipped_items, "items could not be marked swapped");
                }
                SideEffectReport::Applied(receipt)
            }
            Err(e) => SideEffectReport::Failed(self.record_failure(&conversation.id, &e)),
        }
    }

    /// Re-apply the batch of a completed conversation.
    pub fn reconcile(&self, conversation: &Conversation) -> Result<BatchReceipt> {
        match self.apply(conversation) {
            Ok(receipt) => {
                self.store
                    .side_effect_failures
                    .remove(conversation.id.as_bytes())?;
                info!(conversation_id = %conversation.id, "side effects reconciled");
                Ok(receipt)
            }
            Err(e) => {
                let record = self.record_failure(&conversation.id, &e);
                Err(DealError::SideEffectFailure {
                    conversation_id: record.conversation_id,
                    reason: record.reason,
                })
            }
        }
    }

    fn record_failure(&self, conversation_id: &str, cause: &DealError) -> FailureRecord {
        error!(conversation_id, error = %cause, "swap side effects failed; manual reconciliation required");

        let attempts = self
            .store
            .get::<FailureRecord>(&self.store.side_effect_failures, conversation_id.as_bytes())
            .ok()
            .flatten()
            .map_or(1, |previous| previous.attempts + 1);
        let record = FailureRecord {
            conversation_id: conversation_id.to_string(),
            reason: cause.to_string(),
            attempts,
            last_failed_at: TimeStamp::new(),
        };

        if let Err(e) = self.store.put(
            &self.store.side_effect_failures,
            conversation_id.as_bytes(),
            &record,
        ) {
            error!(conversation_id, error = %e, "failed to persist side effect failure record");
        }
        record
    }

    pub fn pending_failures(&self) -> Result<Vec<FailureRecord>> {
        self.store
            .side_effect_failures
            .iter()
            .map(|entry| {
                let (_, bytes) = entry?;
                decode(&bytes)
            })
            .collect()
    }
}
