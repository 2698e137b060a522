use crate::api::{ChatApi, DEFAULT_PAGE_SIZE};
use crate::config::ClientSettings;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{ClientError, ClientResult};
use crate::event::EventStream;
use crate::models::{
    ChatRequest, Conversation, ConversationList, ConversationPatch, ConversationRef, LoginRequest,
    Message, RegisterRequest, User,
};
use crate::state::{ChatSnapshot, ConversationStateMachine, Transition};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::fmt::Display;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New chat";

/// How a generation ended without error.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The service sent `done`.
    Done,
    /// The stream closed with no terminal event; partial content kept.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub completion: Completion,
    pub conversation_id: Option<i64>,
    pub content: String,
}

/// Observable state changes, published after every fold.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    GenerationStarted {
        conversation_id: Option<i64>,
    },
    MessageAppended {
        message: Message,
    },
    AssistantDelta {
        local_id: Uuid,
        delta: String,
        content: String,
    },
    GenerationFinished {
        completion: Completion,
        conversation_id: Option<i64>,
    },
    GenerationFailed {
        message: String,
    },
    ConversationsChanged,
    ConversationOpened {
        conversation_id: i64,
    },
    SignedIn,
    SignedOut,
}

/// Sequences sends, stream consumption, and reconciliation against the
/// service. Clones share state and the update channel.
#[derive(Clone)]
pub struct ChatSession {
    api: ChatApi,
    state: ConversationStateMachine,
    default_model: String,
    updates: UnboundedSender<SessionUpdate>,
}

impl ChatSession {
    pub fn new(api: ChatApi, default_model: impl Into<String>) -> (Self, UnboundedReceiver<SessionUpdate>) {
        let (updates, updates_rx) = unbounded_channel();
        (
            Self {
                api,
                state: ConversationStateMachine::new(),
                default_model: default_model.into(),
                updates,
            },
            updates_rx,
        )
    }

    pub fn from_settings(
        settings: &ClientSettings,
        credentials: CredentialStore,
    ) -> ClientResult<(Self, UnboundedReceiver<SessionUpdate>)> {
        let api = ChatApi::from_settings(settings, credentials)?;
        Ok(Self::new(api, settings.default_model.clone()))
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn state(&self) -> &ConversationStateMachine {
        &self.state
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.state.snapshot()
    }

    pub fn is_signed_in(&self) -> bool {
        self.api.credentials().is_signed_in()
    }

    fn publish(&self, update: SessionUpdate) {
        self.updates.send(update).ok();
    }

    /// Forced sign-out when the session can no longer be refreshed.
    fn note_failure(&self, err: &ClientError) {
        if err.is_session_expired() {
            warn!(%err, "session expired, signing out");
            self.api.credentials().clear();
            self.publish(SessionUpdate::SignedOut);
        }
    }

    fn observe<T>(&self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            self.note_failure(err);
        }
        result
    }

    /// Send `content` and stream the reply into the active conversation, or
    /// into a new one when none is selected.
    ///
    /// Blank input is ignored and returns `Ok(None)`. Fails with
    /// [`ClientError::GenerationActive`] while another reply is streaming.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        model: Option<String>,
    ) -> ClientResult<Option<GenerationOutcome>> {
        let content = content.into();
        if content.trim().is_empty() {
            return Ok(None);
        }
        let model = model.unwrap_or_else(|| self.default_model.clone());

        let (target, user, placeholder) = self.state.begin_generation(&content, Some(model.clone()))?;
        let placeholder_id = placeholder.local_id;
        self.publish(SessionUpdate::GenerationStarted {
            conversation_id: target.id(),
        });
        self.publish(SessionUpdate::MessageAppended { message: user });
        self.publish(SessionUpdate::MessageAppended {
            message: placeholder,
        });

        let request = ChatRequest {
            conversation_id: target.id(),
            message: content,
            model: Some(model),
            stream: true,
        };
        let events = match self.api.open_stream(&request).await {
            Ok(events) => events,
            Err(err) => {
                self.state.abort_open(err.user_message());
                self.publish(SessionUpdate::GenerationFailed {
                    message: err.user_message(),
                });
                self.note_failure(&err);
                return Err(err);
            }
        };

        self.drive(target, placeholder_id, events).await.map(Some)
    }

    /// Fold `events` into the state until a terminal event, a read error,
    /// or the end of the stream.
    async fn drive<S, E>(
        &self,
        target: ConversationRef,
        placeholder: Uuid,
        mut events: EventStream<S>,
    ) -> ClientResult<GenerationOutcome>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut content = String::new();
        loop {
            let event = match events.next_event().await {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    let server_id = self.pending_server_id();
                    self.state.interrupt(err.user_message());
                    self.finish(server_id, false).await;
                    self.publish(SessionUpdate::GenerationFailed {
                        message: err.user_message(),
                    });
                    return Err(err);
                }
                None => {
                    let server_id = self.pending_server_id();
                    self.state.close_stream();
                    let conversation_id = target.id().or(server_id);
                    self.finish(server_id, false).await;
                    self.publish(SessionUpdate::GenerationFinished {
                        completion: Completion::Closed,
                        conversation_id,
                    });
                    return Ok(GenerationOutcome {
                        completion: Completion::Closed,
                        conversation_id,
                        content,
                    });
                }
            };

            let server_id = self.pending_server_id();
            match self.state.apply(event) {
                Transition::Continue | Transition::Ignored => {}
                Transition::Delta {
                    delta,
                    content: accumulated,
                } => {
                    content.clone_from(&accumulated);
                    self.publish(SessionUpdate::AssistantDelta {
                        local_id: placeholder,
                        delta,
                        content: accumulated,
                    });
                }
                Transition::Completed { reconcile } => {
                    self.finish(reconcile, true).await;
                    let conversation_id = reconcile.or(target.id());
                    self.publish(SessionUpdate::GenerationFinished {
                        completion: Completion::Done,
                        conversation_id,
                    });
                    return Ok(GenerationOutcome {
                        completion: Completion::Done,
                        conversation_id,
                        content,
                    });
                }
                Transition::Failed { message } => {
                    self.finish(server_id, false).await;
                    self.publish(SessionUpdate::GenerationFailed {
                        message: message.clone(),
                    });
                    return Err(ClientError::Generation(message));
                }
            }
        }
    }

    fn pending_server_id(&self) -> Option<i64> {
        self.state
            .generation()
            .filter(|session| session.target.is_pending())
            .and_then(|session| session.server_conversation_id)
    }

    /// End the generation once a conversation created by this exchange is
    /// current. With `reload`, the server's messages replace the optimistic
    /// ones; a failed reload keeps the local copy.
    async fn finish(&self, created: Option<i64>, reload: bool) {
        let Some(id) = created else {
            self.state.finish_generation(None, None);
            return;
        };
        if let Err(err) = self.load_conversations().await {
            warn!(%err, conversation_id = id, "failed to refresh conversations after reply");
        }
        let messages = if reload {
            match self.api.conversation_messages(id).await {
                Ok(messages) => Some(messages),
                Err(err) => {
                    warn!(%err, conversation_id = id, "failed to reload messages, keeping local copy");
                    self.note_failure(&err);
                    None
                }
            }
        } else {
            None
        };
        let conversation = match self.state.find_conversation(id) {
            Some(conversation) => Some(conversation),
            None => self.api.get_conversation(id).await.ok(),
        };
        let reconciled = messages.is_some();
        self.state.finish_generation(conversation, messages);
        if reconciled {
            debug!(conversation_id = id, "conversation reconciled with server");
            self.publish(SessionUpdate::ConversationOpened {
                conversation_id: id,
            });
        }
    }

    /// Best-effort request for the service to stop generating.
    ///
    /// The local stream keeps being consumed until the service closes it.
    pub async fn stop_generation(&self) -> ClientResult<()> {
        if !self.state.is_generating() {
            debug!("stop requested with no active generation");
        }
        match self.api.stop_generation().await {
            Ok(()) => {
                info!("stop signal sent");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "failed to send stop signal");
                self.note_failure(&err);
                Err(err)
            }
        }
    }

    /// Log in and store the issued pair. A rejected login leaves any stored
    /// session in place.
    pub async fn sign_in(&self, username: &str, password: &str) -> ClientResult<User> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let pair = self.api.login(&request).await?;
        self.api
            .credentials()
            .set(Credential::new(pair.access_token, pair.refresh_token));
        self.publish(SessionUpdate::SignedIn);
        self.current_user().await
    }

    /// Create an account, then sign in with it.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> ClientResult<User> {
        let request = RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        self.api.register(&request).await?;
        self.sign_in(username, password).await
    }

    pub fn sign_out(&self) {
        self.api.credentials().clear();
        self.state.clear_current_conversation();
        self.state.set_conversations(Vec::new());
        self.publish(SessionUpdate::SignedOut);
    }

    pub async fn current_user(&self) -> ClientResult<User> {
        let result = self.api.current_user().await;
        self.observe(result)
    }

    pub async fn load_conversations(&self) -> ClientResult<Vec<Conversation>> {
        self.state.set_loading(true);
        let result = self.api.list_conversations(0, DEFAULT_PAGE_SIZE).await;
        self.state.set_loading(false);
        let list = self.observe(result)?;
        self.state.set_conversations(list.conversations.clone());
        self.publish(SessionUpdate::ConversationsChanged);
        Ok(list.conversations)
    }

    pub async fn search_conversations(&self, query: &str) -> ClientResult<ConversationList> {
        let result = self
            .api
            .search_conversations(query, 0, DEFAULT_PAGE_SIZE)
            .await;
        self.observe(result)
    }

    /// Make `id` the current conversation and load its messages.
    pub async fn open_conversation(&self, id: i64) -> ClientResult<Conversation> {
        if self.state.is_generating() {
            return Err(ClientError::GenerationActive);
        }
        self.state.set_loading(true);
        let result = tokio::try_join!(
            self.api.get_conversation(id),
            self.api.conversation_messages(id)
        );
        self.state.set_loading(false);
        let (conversation, messages) = self.observe(result)?;
        self.state.set_current_conversation(Some(conversation.clone()));
        self.state.set_messages(messages);
        self.publish(SessionUpdate::ConversationOpened {
            conversation_id: id,
        });
        Ok(conversation)
    }

    pub async fn create_conversation(
        &self,
        title: Option<String>,
        model: Option<String>,
    ) -> ClientResult<Conversation> {
        if self.state.is_generating() {
            return Err(ClientError::GenerationActive);
        }
        let patch = ConversationPatch {
            title: Some(title.unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string())),
            model: Some(model.unwrap_or_else(|| self.default_model.clone())),
        };
        let result = self.api.create_conversation(&patch).await;
        let conversation = self.observe(result)?;
        self.state.add_conversation(conversation.clone());
        self.state.set_current_conversation(Some(conversation.clone()));
        self.state.set_messages(Vec::new());
        self.publish(SessionUpdate::ConversationsChanged);
        self.publish(SessionUpdate::ConversationOpened {
            conversation_id: conversation.id,
        });
        Ok(conversation)
    }

    pub async fn rename_conversation(&self, id: i64, title: &str) -> ClientResult<Conversation> {
        let result = self
            .api
            .update_conversation(id, &ConversationPatch::title(title))
            .await;
        let updated = self.observe(result)?;
        self.state.replace_conversation(updated.clone());
        self.publish(SessionUpdate::ConversationsChanged);
        Ok(updated)
    }

    pub async fn delete_conversation(&self, id: i64) -> ClientResult<()> {
        let result = self.api.delete_conversation(id).await;
        self.observe(result)?;
        self.state.remove_conversation(id);
        self.publish(SessionUpdate::ConversationsChanged);
        Ok(())
    }

    /// Start a fresh, not yet persisted conversation.
    pub fn clear_current_conversation(&self) {
        self.state.clear_current_conversation();
    }
}
