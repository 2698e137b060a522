use crate::config::ClientSettings;
use crate::credentials::CredentialStore;
use crate::error::{ClientError, ClientResult};
use crate::event::EventStream;
use crate::models::{
    ChatRequest, Conversation, ConversationList, ConversationPatch, LoginRequest, Message,
    RegisterRequest, TokenPair, User,
};
use crate::transport::{ensure_success, ApiRequest, TokenGuardedTransport};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Byte stream of an open streaming response.
pub type ResponseBytes = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Typed calls against the chat service, all routed through the guarded transport.
#[derive(Clone)]
pub struct ChatApi {
    transport: TokenGuardedTransport,
}

impl ChatApi {
    pub fn new(transport: TokenGuardedTransport) -> Self {
        Self { transport }
    }

    pub fn from_settings(settings: &ClientSettings, credentials: CredentialStore) -> ClientResult<Self> {
        Ok(Self::new(TokenGuardedTransport::new(settings, credentials)?))
    }

    pub fn transport(&self) -> &TokenGuardedTransport {
        &self.transport
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.transport.credentials()
    }

    async fn call<T: DeserializeOwned>(&self, request: ApiRequest) -> ClientResult<T> {
        let response = ensure_success(self.transport.send(&request).await?).await?;
        Ok(response.json().await?)
    }

    async fn call_unit(&self, request: ApiRequest) -> ClientResult<()> {
        ensure_success(self.transport.send(&request).await?).await?;
        Ok(())
    }

    pub async fn register(&self, request: &RegisterRequest) -> ClientResult<User> {
        self.call(ApiRequest::post("/auth/register").json(request)?.anonymous())
            .await
    }

    pub async fn login(&self, request: &LoginRequest) -> ClientResult<TokenPair> {
        let pair: TokenPair = self
            .call(ApiRequest::post("/auth/login").json(request)?.anonymous())
            .await?;
        info!(username = %request.username, "signed in");
        Ok(pair)
    }

    pub async fn current_user(&self) -> ClientResult<User> {
        self.call(ApiRequest::get("/auth/me")).await
    }

    pub async fn list_conversations(&self, skip: u32, limit: u32) -> ClientResult<ConversationList> {
        self.call(
            ApiRequest::get("/conversations")
                .query("skip", skip)
                .query("limit", limit.min(MAX_PAGE_SIZE)),
        )
        .await
    }

    pub async fn search_conversations(
        &self,
        query: &str,
        skip: u32,
        limit: u32,
    ) -> ClientResult<ConversationList> {
        self.call(
            ApiRequest::get("/conversations/search/")
                .query("q", query)
                .query("skip", skip)
                .query("limit", limit.min(MAX_PAGE_SIZE)),
        )
        .await
    }

    pub async fn create_conversation(&self, patch: &ConversationPatch) -> ClientResult<Conversation> {
        self.call(ApiRequest::post("/conversations").json(patch)?)
            .await
    }

    pub async fn get_conversation(&self, id: i64) -> ClientResult<Conversation> {
        self.call(ApiRequest::get(format!("/conversations/{id}")))
            .await
    }

    pub async fn update_conversation(
        &self,
        id: i64,
        patch: &ConversationPatch,
    ) -> ClientResult<Conversation> {
        self.call(ApiRequest::put(format!("/conversations/{id}")).json(patch)?)
            .await
    }

    pub async fn delete_conversation(&self, id: i64) -> ClientResult<()> {
        self.call_unit(ApiRequest::delete(format!("/conversations/{id}")))
            .await
    }

    pub async fn conversation_messages(&self, id: i64) -> ClientResult<Vec<Message>> {
        self.call(ApiRequest::get(format!("/conversations/{id}/messages")))
            .await
    }

    /// Open the reply stream for `request`.
    ///
    /// Connection failures and non-success statuses become
    /// [`ClientError::StreamOpen`]; an expired session stays
    /// [`ClientError::SessionExpired`].
    pub async fn open_stream(&self, request: &ChatRequest) -> ClientResult<EventStream<ResponseBytes>> {
        let api_request = ApiRequest::post("/chat/stream").json(request)?.streaming();
        let response = match self.transport.send(&api_request).await {
            Ok(response) => response,
            Err(err @ ClientError::SessionExpired { .. }) => return Err(err),
            Err(err) => return Err(ClientError::StreamOpen(err.to_string())),
        };
        let response = match ensure_success(response).await {
            Ok(response) => response,
            Err(ClientError::Server { status, message }) => {
                return Err(ClientError::StreamOpen(format!("{status}: {message}")))
            }
            Err(other) => return Err(ClientError::StreamOpen(other.to_string())),
        };
        debug!(conversation_id = ?request.conversation_id, "reply stream opened");
        Ok(EventStream::from_bytes(response.bytes_stream().boxed()))
    }

    /// Ask the service to stop the current generation. The response body is ignored.
    pub async fn stop_generation(&self) -> ClientResult<()> {
        self.call_unit(ApiRequest::post("/chat/stop")).await
    }
}
