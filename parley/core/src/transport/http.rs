//! HTTP Chat API
//!
//! `reqwest` implementation of [`ChatApi`].
//!
//! # Endpoints
//!
//! - `POST   /conversations` - create
//! - `GET    /conversations/{id}` - fetch metadata
//! - `PATCH  /conversations/{id}` - rename
//! - `DELETE /conversations/{id}` - delete
//! - `GET    /conversations/{id}/messages?page=&limit=` - page of history
//! - `DELETE /conversations/{id}/messages/{messageId}` - delete message
//! - `PATCH  /conversations/{id}/research-mode` - toggle research mode
//! - `POST   /chat/stream` - streaming send (event-stream body)
//! - `POST   /uploads` - attachment upload
//!
//! REST calls carry the configured request timeout. The streaming call does
//! not; its liveness is policed by the session timers instead.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::traits::{ByteStream, ChatApi, PageRequest};
use super::wire::{ConversationEnvelope, MessagePage, RemoteConversation, SendRequest};
use crate::config::ApiConfig;
use crate::conversation::ConversationId;
use crate::error::TransportError;
use crate::messages::{Attachment, MessageId};

/// Longest error body kept in [`TransportError::Http`]
const MAX_ERROR_BODY: usize = 512;

/// HTTP client for the chat API
pub struct HttpChatApi {
    /// Base URL without trailing slash
    base_url: String,
    /// Timeout for non-streaming calls
    request_timeout: Duration,
    /// Bearer token, when signed in
    token: RwLock<Option<String>>,
    /// Shared connection pool
    http_client: reqwest::Client,
}

impl HttpChatApi {
    /// Create a client for `base_url`
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialised.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            token: RwLock::new(None),
            http_client,
        })
    }

    /// Create from [`ApiConfig`]
    ///
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialised.
    pub fn from_config(config: &ApiConfig) -> Result<Self, TransportError> {
        Self::new(config.base_url.clone(), config.request_timeout)
    }

    /// Set or clear the bearer token
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Base URL in use
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a REST request with the request timeout applied
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, TransportError> {
        let response = self
            .authorize(builder)
            .timeout(self.request_timeout)
            .send()
            .await?;
        check_status(response).await
    }

    async fn execute_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, TransportError> {
        let response = self.execute(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// Turn a non-success status into [`TransportError::Http`]
async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(TransportError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn create_conversation(&self, title: &str) -> Result<RemoteConversation, TransportError> {
        let builder = self
            .http_client
            .post(self.url("/conversations"))
            .json(&serde_json::json!({ "title": title }));
        let envelope: ConversationEnvelope = self.execute_json(builder).await?;
        Ok(envelope.into_inner())
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<RemoteConversation, TransportError> {
        let builder = self.http_client.get(self.url(&format!("/conversations/{id}")));
        let envelope: ConversationEnvelope = self.execute_json(builder).await?;
        Ok(envelope.into_inner())
    }

    async fn update_conversation_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<(), TransportError> {
        let builder = self
            .http_client
            .patch(self.url(&format!("/conversations/{id}")))
            .json(&serde_json::json!({ "title": title }));
        self.execute(builder).await.map(|_| ())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), TransportError> {
        let builder = self
            .http_client
            .delete(self.url(&format!("/conversations/{id}")));
        self.execute(builder).await.map(|_| ())
    }

    async fn get_messages(
        &self,
        id: &ConversationId,
        page: PageRequest,
    ) -> Result<MessagePage, TransportError> {
        let builder = self
            .http_client
            .get(self.url(&format!("/conversations/{id}/messages")))
            .query(&[("page", page.page), ("limit", page.limit)]);
        self.execute_json(builder).await
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        let builder = self.http_client.delete(self.url(&format!(
            "/conversations/{conversation_id}/messages/{message_id}"
        )));
        self.execute(builder).await.map(|_| ())
    }

    async fn set_research_mode(
        &self,
        id: &ConversationId,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let builder = self
            .http_client
            .patch(self.url(&format!("/conversations/{id}/research-mode")))
            .json(&serde_json::json!({ "isResearchMode": enabled }));
        self.execute(builder).await.map(|_| ())
    }

    async fn open_stream(&self, request: &SendRequest) -> Result<ByteStream, TransportError> {
        let response = self
            .authorize(self.http_client.post(self.url("/chat/stream")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;

        tracing::debug!(
            conversation_id = %request.conversation_id,
            status = response.status().as_u16(),
            "Stream response opened"
        );

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(TransportError::from))
            .boxed())
    }

    async fn upload_attachment(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment, TransportError> {
        let builder = self
            .http_client
            .post(self.url("/uploads"))
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .header("X-Filename", filename)
            .body(bytes);
        self.execute_json(builder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HttpChatApi::new("https://chat.example.com/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(api.base_url(), "https://chat.example.com/api");
        assert_eq!(
            api.url("/conversations"),
            "https://chat.example.com/api/conversations"
        );
    }

    #[test]
    fn test_from_config() {
        let config = ApiConfig::default();
        let api = HttpChatApi::from_config(&config).unwrap();
        assert_eq!(api.base_url(), config.base_url.trim_end_matches('/'));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let api = HttpChatApi::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = api
            .get_conversation(&ConversationId::new("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
    }
}
