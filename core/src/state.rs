use crate::error::{ClientError, ClientResult};
use crate::event::StreamEvent;
use crate::models::{Conversation, ConversationPatch, ConversationRef, Message, MessageRole};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// The one streamed exchange currently filling an assistant placeholder.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub target: ConversationRef,
    pub model: Option<String>,
    pub accumulated: String,
    /// Server id learned from the stream while the target is pending.
    pub server_conversation_id: Option<i64>,
    placeholder: Uuid,
    /// A terminal event or the end of the stream was seen; the session only
    /// waits for [`ConversationStateMachine::finish_generation`].
    settled: bool,
}

/// What the caller should do after an event has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue,
    /// Content grew; `content` is the full accumulated reply.
    Delta { delta: String, content: String },
    /// `reconcile` names a newly created conversation whose authoritative
    /// state should be fetched.
    Completed { reconcile: Option<i64> },
    Failed { message: String },
    /// No generation was accepting events.
    Ignored,
}

/// Read-only copy of the chat state for renderers.
#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    pub current_conversation: Option<Conversation>,
    pub messages: Vec<Message>,
    pub conversations: Vec<Conversation>,
    pub is_generating: bool,
    pub is_loading: bool,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct ChatState {
    current_conversation: Option<Conversation>,
    messages: Vec<Message>,
    conversations: Vec<Conversation>,
    generation: Option<GenerationSession>,
    is_loading: bool,
    last_error: Option<String>,
}

impl ChatState {
    fn placeholder_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .rev()
            .find(|message| message.local_id == id)
    }

    fn end_generation(&mut self) -> Option<GenerationSession> {
        self.generation.take()
    }

    fn settle_generation(&mut self) -> Option<&GenerationSession> {
        let session = self.generation.as_mut().filter(|session| !session.settled)?;
        session.settled = true;
        Some(&*session)
    }
}

/// Owns the conversation list and the active message buffer, and folds
/// stream events into them. Clones share state.
#[derive(Clone, Default)]
pub struct ConversationStateMachine {
    inner: Arc<RwLock<ChatState>>,
}

impl ConversationStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let inner = self.inner.read();
        ChatSnapshot {
            current_conversation: inner.current_conversation.clone(),
            messages: inner.messages.clone(),
            conversations: inner.conversations.clone(),
            is_generating: inner.generation.is_some(),
            is_loading: inner.is_loading,
            last_error: inner.last_error.clone(),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.inner.read().generation.is_some()
    }

    pub fn generation(&self) -> Option<GenerationSession> {
        self.inner.read().generation.clone()
    }

    pub fn accumulated(&self) -> Option<String> {
        self.inner
            .read()
            .generation
            .as_ref()
            .map(|session| session.accumulated.clone())
    }

    pub fn current_conversation(&self) -> Option<Conversation> {
        self.inner.read().current_conversation.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    /// Start a generation: append the optimistic user message and an empty
    /// assistant placeholder. Returns the two appended messages.
    ///
    /// Only one generation may be active; a second call fails with
    /// [`ClientError::GenerationActive`] and leaves the state untouched.
    pub fn begin_generation(
        &self,
        content: &str,
        model: Option<String>,
    ) -> ClientResult<(ConversationRef, Message, Message)> {
        let mut inner = self.inner.write();
        if inner.generation.is_some() {
            return Err(ClientError::GenerationActive);
        }
        let target = match &inner.current_conversation {
            Some(conversation) => ConversationRef::Persisted(conversation.id),
            None => ConversationRef::Pending,
        };

        let mut user = Message::new(MessageRole::User, content);
        let mut placeholder = Message::new(MessageRole::Assistant, String::new());
        user.conversation_id = target.id();
        placeholder.conversation_id = target.id();

        inner.messages.push(user.clone());
        inner.messages.push(placeholder.clone());
        inner.last_error = None;
        inner.generation = Some(GenerationSession {
            target,
            model,
            accumulated: String::new(),
            server_conversation_id: None,
            placeholder: placeholder.local_id,
            settled: false,
        });
        Ok((target, user, placeholder))
    }

    /// Fold one stream event. Events are expected in arrival order.
    ///
    /// `done` and `error` settle the generation but keep it active, so no
    /// new send starts before [`Self::finish_generation`] runs.
    pub fn apply(&self, event: StreamEvent) -> Transition {
        let mut inner = self.inner.write();
        let Some(session) = inner.generation.as_mut().filter(|session| !session.settled) else {
            debug!(kind = event.kind(), "ignoring stream event with no active generation");
            return Transition::Ignored;
        };

        match event {
            StreamEvent::Init {
                conversation_id, ..
            } => {
                if session.target.is_pending() {
                    if let Some(id) = conversation_id {
                        debug!(conversation_id = id, "server assigned conversation id");
                        session.server_conversation_id = Some(id);
                    }
                }
                Transition::Continue
            }
            StreamEvent::Chunk { content } => {
                if content.is_empty() {
                    return Transition::Continue;
                }
                session.accumulated.push_str(&content);
                let accumulated = session.accumulated.clone();
                let placeholder = session.placeholder;
                match inner.placeholder_mut(placeholder) {
                    Some(message) => message.content.clone_from(&accumulated),
                    None => warn!("assistant placeholder missing while applying chunk"),
                }
                Transition::Delta {
                    delta: content,
                    content: accumulated,
                }
            }
            StreamEvent::Done {
                conversation_id, ..
            } => {
                let reconcile = if session.target.is_pending() {
                    conversation_id.or(session.server_conversation_id)
                } else {
                    None
                };
                session.settled = true;
                Transition::Completed { reconcile }
            }
            StreamEvent::Error { error } => {
                let message = error.unwrap_or_else(|| "generation failed".to_string());
                session.settled = true;
                inner.last_error = Some(message.clone());
                Transition::Failed { message }
            }
            StreamEvent::Unknown => Transition::Continue,
        }
    }

    /// The stream ended without `done` or `error`; the partial reply is kept.
    /// Returns false when no generation was accepting events.
    pub fn close_stream(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.settle_generation() {
            Some(session) => {
                warn!(
                    chars = session.accumulated.len(),
                    "stream closed without a terminal event"
                );
                true
            }
            None => false,
        }
    }

    /// Mid-stream read failure; the partial reply is kept.
    pub fn interrupt(&self, message: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.settle_generation();
        inner.last_error = Some(message.into());
    }

    /// The stream never opened. The untouched placeholder is dropped; the
    /// optimistic user message stays.
    pub fn abort_open(&self, message: impl Into<String>) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.end_generation() {
            let placeholder = session.placeholder;
            inner
                .messages
                .retain(|m| m.local_id != placeholder || !m.content.is_empty());
        }
        inner.last_error = Some(message.into());
    }

    /// End the active generation. In the same step, `conversation` becomes
    /// current and `messages` replace the optimistic buffer when given.
    pub fn finish_generation(
        &self,
        conversation: Option<Conversation>,
        messages: Option<Vec<Message>>,
    ) -> Option<GenerationSession> {
        let mut inner = self.inner.write();
        if let Some(conversation) = conversation {
            inner.current_conversation = Some(conversation);
        }
        if let Some(messages) = messages {
            inner.messages = messages;
        }
        inner.end_generation()
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.inner.write().conversations = conversations;
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.inner.write().conversations.insert(0, conversation);
    }

    pub fn update_conversation(&self, id: i64, patch: &ConversationPatch) {
        let mut inner = self.inner.write();
        if let Some(conversation) = inner.conversations.iter_mut().find(|c| c.id == id) {
            patch.apply_to(conversation);
        }
        if let Some(current) = inner.current_conversation.as_mut().filter(|c| c.id == id) {
            patch.apply_to(current);
        }
    }

    /// Swap in the server's copy of a conversation wherever it is shown.
    pub fn replace_conversation(&self, updated: Conversation) {
        let mut inner = self.inner.write();
        if let Some(conversation) = inner.conversations.iter_mut().find(|c| c.id == updated.id) {
            *conversation = updated.clone();
        }
        if let Some(current) = inner
            .current_conversation
            .as_mut()
            .filter(|c| c.id == updated.id)
        {
            *current = updated;
        }
    }

    pub fn remove_conversation(&self, id: i64) {
        let mut inner = self.inner.write();
        inner.conversations.retain(|c| c.id != id);
        if inner.current_conversation.as_ref().map(|c| c.id) == Some(id) {
            inner.current_conversation = None;
            inner.messages.clear();
        }
    }

    pub fn find_conversation(&self, id: i64) -> Option<Conversation> {
        self.inner
            .read()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn set_current_conversation(&self, conversation: Option<Conversation>) {
        self.inner.write().current_conversation = conversation;
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        self.inner.write().messages = messages;
    }

    pub fn clear_current_conversation(&self) {
        let mut inner = self.inner.write();
        inner.current_conversation = None;
        inner.messages.clear();
    }

    pub fn set_loading(&self, loading: bool) {
        self.inner.write().is_loading = loading;
    }

    pub fn set_error(&self, message: Option<String>) {
        self.inner.write().last_error = message;
    }
}
