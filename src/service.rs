//! Service layer API for swipes, conversations and the deal lifecycle
use super::config::{EngineConfig, StoreConfig};
use super::conversation::{Conversation, DealAction, DealEvent, DealStatus};
use super::effects::{
    BatchReceipt, FailureRecord, PrivilegedWriter, SideEffectExecutor, SideEffectReport,
    SledPrivilegedWriter,
};
use super::error::{DealError, Result};
use super::ledger::{SwipeLedger, SwipeRecorder};
use super::messages::{Delivery, Inbox, MessagePage};
use super::model::{
    Item, ItemStatus, Message, MessageKind, ProposalMetadata, SwipeDirection, TimeStamp, UserId,
};
use super::registry::{ConversationRegistry, Ensured};
use super::reviews::{Review, ReviewBook, ReviewSummary};
use super::store::Store;
use super::verification::Verdict;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SwipeOutcome {
    pub acknowledged: bool,
    pub direction: SwipeDirection,
    pub matched: bool,
    pub conversation_id: Option<String>,
    pub is_new: bool,
    pub warning: Option<String>, // set when the ledger write was dropped
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub conversation: Conversation,
    pub changed: bool,
    pub event: Option<DealEvent>,
    pub side_effects: Option<SideEffectReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub other_user: UserId,
    pub last_message: Option<Message>,
    pub my_unread: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedConversation {
    pub id: String,
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub kind: MessageKind,
    pub metadata: Option<ProposalMetadata>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            metadata: None,
        }
    }

    pub fn proposal(content: impl Into<String>, item: &Item) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::ItemProposal,
            metadata: Some(ProposalMetadata::for_item(item)),
        }
    }
}

#[derive(Clone)]
pub struct SwapService {
    store: Store,
    config: EngineConfig,
    ledger: Arc<dyn SwipeRecorder>,
    registry: ConversationRegistry,
    inbox: Inbox,
    effects: SideEffectExecutor,
    reviews: ReviewBook,
}

impl SwapService {
    pub fn new(store: Store, config: EngineConfig) -> Self {
        let writer = Arc::new(SledPrivilegedWriter::new(store.clone()));
        Self::with_writer(store, config, writer)
    }

    /// Open the store and read the engine settings from the environment.
    pub fn from_env() -> Result<Self> {
        let store = Store::open(&StoreConfig::from_env())?;
        Ok(Self::new(store, EngineConfig::from_env()?))
    }

    /// Build a service whose completion side effects go through `writer`.
    pub fn with_writer(store: Store, config: EngineConfig, writer: Arc<dyn PrivilegedWriter>) -> Self {
        Self {
            ledger: Arc::new(SwipeLedger::new(store.clone())),
            registry: ConversationRegistry::new(store.clone()),
            inbox: Inbox::new(store.clone()),
            effects: SideEffectExecutor::new(store.clone(), writer.clone(), config.completion_reward),
            reviews: ReviewBook::new(store.clone(), writer, config.review_reward),
            store,
            config,
        }
    }

    /// Replace the swipe write path.
    pub fn with_swipe_recorder(mut self, recorder: Arc<dyn SwipeRecorder>) -> Self {
        self.ledger = recorder;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn participant_conversation(&self, conversation_id: &str, actor: &str) -> Result<Conversation> {
        let conversation = self.registry.conversation(conversation_id)?;
        conversation.require_participant(actor)?;
        Ok(conversation)
    }

    fn fresh(&self, conversation: Conversation) -> Conversation {
        match self.store.conversation(&conversation.id) {
            Ok(Some(latest)) => latest,
            _ => conversation,
        }
    }

    /// Record a swipe and, for a right swipe, match the swiper with the owner.
    pub fn record_swipe(&self, actor: &str, item_id: &str, direction: &str) -> Result<SwipeOutcome> {
        let direction: SwipeDirection = direction.parse()?;
        let item = self
            .store
            .item(item_id)?
            .ok_or_else(|| DealError::not_found("item", item_id))?;

        let mut outcome = SwipeOutcome {
            acknowledged: true,
            direction,
            matched: false,
            conversation_id: None,
            is_new: false,
            warning: None,
        };
        if item.owner == actor {
            info!(actor, item_id, "ignoring swipe on own item");
            return Ok(outcome);
        }
        if direction == SwipeDirection::Right && !item.is_offerable() {
            return Err(DealError::InvalidState(format!(
                "item {item_id} is not available for swapping"
            )));
        }

        let previous = match self.ledger.record(actor, item_id, direction) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(actor, item_id, error = %e, "swipe acknowledged without ledger write");
                outcome.warning = Some(format!("swipe ledger write failed: {e}"));
                None
            }
        };
        if direction == SwipeDirection::Left {
            return Ok(outcome);
        }

        let first_right_swipe = previous.is_none_or(|s| s.direction != SwipeDirection::Right);
        let ensured = self.announce_interest(actor, &item, first_right_swipe)?;

        info!(
            actor,
            item_id,
            conversation_id = %ensured.conversation.id,
            is_new = ensured.is_new,
            "right swipe matched"
        );
        outcome.matched = true;
        outcome.conversation_id = Some(ensured.conversation.id);
        outcome.is_new = ensured.is_new;
        Ok(outcome)
    }

    /// Match `actor` with the owner of `item` and post the interest note.
    ///
    /// The note is only delivered to an open conversation. If the thread
    /// closes before it lands, the pair is matched again so the swipe never
    /// reports a closed thread.
    fn announce_interest(&self, actor: &str, item: &Item, first_right_swipe: bool) -> Result<Ensured> {
        loop {
            let ensured = self.registry.ensure(actor, &item.owner, Some(item.id.clone()))?;
            if !ensured.is_new && !first_right_swipe {
                return Ok(ensured);
            }

            match self.inbox.append(
                &ensured.conversation.id,
                actor,
                format!("{actor} is interested in your \"{}\"", item.title),
                MessageKind::System,
                Some(ProposalMetadata::for_item(item)),
                Delivery::Open,
            ) {
                Ok(_) => return Ok(ensured),
                Err(DealError::InvalidState(_)) => {
                    debug!(conversation_id = %ensured.conversation.id, "conversation closed before the interest note, matching again");
                }
                Err(e) => {
                    warn!(conversation_id = %ensured.conversation.id, error = %e, "failed to post interest note");
                    return Ok(ensured);
                }
            }
        }
    }

    /// Start or retrieve the conversation between `actor` and `target`.
    ///
    /// No message is posted; `item_id`, when given, must belong to one of
    /// the two users and only sets the origin item of a new conversation.
    pub fn start_conversation(
        &self,
        actor: &str,
        target: &str,
        item_id: Option<&str>,
    ) -> Result<StartedConversation> {
        if actor == target {
            return Err(DealError::Validation(
                "cannot start a conversation with yourself".into(),
            ));
        }
        if let Some(item_id) = item_id {
            let item = self
                .store
                .item(item_id)?
                .ok_or_else(|| DealError::not_found("item", item_id))?;
            if item.owner != actor && item.owner != target {
                return Err(DealError::Forbidden(format!(
                    "item {item_id} does not belong to either participant"
                )));
            }
        }

        let ensured = self
            .registry
            .ensure(actor, target, item_id.map(str::to_string))?;
        info!(actor, target, conversation_id = %ensured.conversation.id, is_new = ensured.is_new, "conversation started");
        Ok(StartedConversation {
            id: ensured.conversation.id,
            is_new: ensured.is_new,
        })
    }

    /// Apply `agree`, `complete` or `cancel` on behalf of `actor`.
    pub fn apply_action(&self, conversation_id: &str, actor: &str, action: &str) -> Result<TransitionOutcome> {
        self.participant_conversation(conversation_id, actor)?;
        let action: DealAction = action.parse()?;

        let committed = self.store.update(
            &self.store.conversations,
            conversation_id.as_bytes(),
            "conversation",
            |conversation: &Conversation| conversation.transition(actor, action, TimeStamp::new()),
        )?;

        let Some(event) = committed.outcome else {
            return Ok(TransitionOutcome {
                conversation: committed.record,
                changed: false,
                event: None,
                side_effects: None,
            });
        };
        info!(conversation_id, actor, ?event, status = committed.record.status.as_str(), "deal transition");

        // only the caller whose swap moved the row to completed gets here
        let side_effects = (event == DealEvent::Completed).then(|| self.effects.run(&committed.record));

        self.inbox.post_system(
            conversation_id,
            actor,
            event.system_message(actor),
            None,
            Delivery::Any,
        );

        Ok(TransitionOutcome {
            conversation: self.fresh(committed.record),
            changed: true,
            event: Some(event),
            side_effects,
        })
    }

    pub fn send_message(&self, conversation_id: &str, actor: &str, message: NewMessage) -> Result<Message> {
        let conversation = self.participant_conversation(conversation_id, actor)?;
        if conversation.status.is_terminal() {
            return Err(DealError::InvalidState(format!(
                "cannot message a {} conversation",
                conversation.status.as_str()
            )));
        }
        if message.content.trim().is_empty() {
            return Err(DealError::Validation("message content is empty".into()));
        }

        match message.kind {
            MessageKind::System => {
                return Err(DealError::InvalidAction(
                    "system messages cannot be sent by users".into(),
                ));
            }
            MessageKind::ItemProposal => {
                let metadata = message.metadata.as_ref().ok_or_else(|| {
                    DealError::Validation("item proposals must name an item".into())
                })?;
                self.check_proposal(&conversation, &metadata.item_id)?;
            }
            MessageKind::Text => {}
        }

        self.inbox.append(
            conversation_id,
            actor,
            message.content,
            message.kind,
            message.metadata,
            Delivery::Open,
        )
    }

    fn check_proposal(&self, conversation: &Conversation, item_id: &str) -> Result<()> {
        let item = self
            .store
            .item(item_id)?
            .ok_or_else(|| DealError::not_found("item", item_id))?;
        if !conversation.is_participant(&item.owner) {
            return Err(DealError::Forbidden(format!(
                "item {item_id} does not belong to either participant"
            )));
        }
        if !item.is_offerable() {
            return Err(DealError::InvalidState(format!(
                "item {item_id} is not available for swapping"
            )));
        }
        Ok(())
    }

    /// Conversation detail; opening it acknowledges the actor's unread messages.
    pub fn get_conversation(&self, conversation_id: &str, actor: &str) -> Result<Conversation> {
        let conversation = self.participant_conversation(conversation_id, actor)?;
        if let Err(e) = self.inbox.acknowledge(conversation_id, actor) {
            warn!(conversation_id, actor, error = %e, "failed to acknowledge reads");
        }
        Ok(self.fresh(conversation))
    }

    pub fn list_conversations(&self, actor: &str) -> Result<Vec<ConversationSummary>> {
        let mut summaries = self
            .registry
            .for_user(actor)?
            .into_iter()
            .map(|conversation| {
                Ok(ConversationSummary {
                    other_user: conversation
                        .other_participant(actor)
                        .unwrap_or_default()
                        .to_string(),
                    last_message: self.inbox.last(&conversation.id)?,
                    my_unread: conversation.unread_for(actor),
                    conversation,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        summaries.sort_by(|a, b| {
            let at = |s: &ConversationSummary| {
                s.conversation
                    .last_message_at
                    .clone()
                    .unwrap_or_else(|| s.conversation.created_at.clone())
            };
            at(b).cmp(&at(a))
        });
        Ok(summaries)
    }

    /// Paginated history; reading it acknowledges the actor's unread messages.
    pub fn messages(&self, conversation_id: &str, actor: &str, page: usize, page_size: usize) -> Result<MessagePage> {
        self.participant_conversation(conversation_id, actor)?;
        let page = self
            .inbox
            .page(conversation_id, page, self.config.page_size(page_size))?;

        if let Err(e) = self.inbox.acknowledge(conversation_id, actor) {
            warn!(conversation_id, actor, error = %e, "failed to acknowledge reads");
        }
        Ok(page)
    }

    /// Available items of one participant, browsable from inside the chat.
    pub fn wardrobe(&self, conversation_id: &str, actor: &str, user: &str) -> Result<Vec<Item>> {
        let conversation = self.participant_conversation(conversation_id, actor)?;
        if !conversation.is_participant(user) {
            return Err(DealError::Forbidden(format!(
                "{user} is not part of conversation {conversation_id}"
            )));
        }
        self.store.items_by_owner(user, Some(ItemStatus::Available))
    }

    pub fn leave_review(
        &self,
        conversation_id: &str,
        actor: &str,
        reviewee: &str,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Review> {
        let conversation = self.registry.conversation(conversation_id)?;
        self.reviews
            .leave(&conversation, actor, reviewee, rating, comment)
    }

    pub fn reviews_for(&self, user: &str) -> Result<ReviewSummary> {
        self.reviews.about(user)
    }

    /// Side effect batches that failed and are waiting for an operator.
    pub fn pending_side_effect_failures(&self) -> Result<Vec<FailureRecord>> {
        self.effects.pending_failures()
    }

    /// Re-apply the completion side effects of `conversation_id`.
    pub fn reconcile(&self, conversation_id: &str) -> Result<BatchReceipt> {
        let conversation = self.registry.conversation(conversation_id)?;
        if conversation.status != DealStatus::Completed {
            return Err(DealError::InvalidState(format!(
                "conversation {conversation_id} is {}, not completed",
                conversation.status.as_str()
            )));
        }
        self.effects.reconcile(&conversation)
    }

    pub fn interpret_verification(&self, score: i64) -> Verdict {
        Verdict::from_confidence(score, self.config.verification_threshold)
    }
}
