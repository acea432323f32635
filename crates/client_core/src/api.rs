use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, MessageId, MessageKind, UserId},
    error::ApiError,
    protocol::{
        ApiResponse, ConversationSummary, EditMessageRequest, HistoryPage, MarkReadRequest,
        Message, UnreadSnapshot,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    config::ClientSettings,
    error::{SyncError, SyncResult},
};

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub text: Option<String>,
    pub attachment: Option<AttachmentUpload>,
}

impl OutgoingMessage {
    pub fn text(conversation_id: ConversationId, text: impl Into<String>) -> Self {
        Self {
            conversation_id,
            text: Some(text.into()),
            attachment: None,
        }
    }

    /// Trimmed text, or `None` when only whitespace was entered.
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.trimmed_text().is_none() && self.attachment.is_none()
    }

    pub fn kind(&self) -> MessageKind {
        match &self.attachment {
            None => MessageKind::Text,
            Some(attachment) => attachment
                .mime_type
                .as_deref()
                .map(MessageKind::from_mime)
                .unwrap_or(MessageKind::File),
        }
    }
}

/// Request/response calls the sync core depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        page_size: u32,
    ) -> SyncResult<HistoryPage>;
    async fn unread_snapshot(&self) -> SyncResult<UnreadSnapshot>;
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
    ) -> SyncResult<()>;
    async fn send_message(&self, message: &OutgoingMessage) -> SyncResult<Message>;
    async fn edit_message(&self, message_id: &MessageId, text: &str) -> SyncResult<Message>;
    async fn delete_message(&self, message_id: &MessageId) -> SyncResult<()>;
    async fn recent_conversations(&self) -> SyncResult<Vec<ConversationSummary>>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpChatApi {
    pub fn new(settings: &ClientSettings, token: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(settings.request_timeout).build()?;
        let base_url = Url::parse(&settings.api_url)?;
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::network(anyhow::anyhow!("api url cannot be a base")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(SyncError::network)?;
        let response = check_status(response).await?;
        let envelope: ApiResponse<T> = response.json().await.map_err(SyncError::network)?;
        Ok(envelope.data)
    }

    async fn execute_ack(&self, request: RequestBuilder) -> SyncResult<()> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(SyncError::network)?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
        return Err(api_error.into());
    }
    Err(SyncError::network(anyhow::anyhow!(
        "server responded with {status}: {body}"
    )))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        page_size: u32,
    ) -> SyncResult<HistoryPage> {
        let url = self.endpoint(&["message", conversation_id.as_str(), "messages"])?;
        debug!(conversation_id = %conversation_id, page, page_size, "api: fetching history page");
        self.execute(
            self.http
                .get(url)
                .query(&[("page", page.max(1)), ("limit", page_size.clamp(1, 100))]),
        )
        .await
    }

    async fn unread_snapshot(&self) -> SyncResult<UnreadSnapshot> {
        let url = self.endpoint(&["message", "unreadCounts"])?;
        self.execute(self.http.get(url)).await
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
    ) -> SyncResult<()> {
        let url = self.endpoint(&["message", "read"])?;
        self.execute_ack(self.http.put(url).json(&MarkReadRequest {
            conversation_id: conversation_id.clone(),
            receiver_id: receiver_id.clone(),
        }))
        .await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> SyncResult<Message> {
        let url = self.endpoint(&["message", "send"])?;
        let mut form = multipart::Form::new()
            .text("chatId", message.conversation_id.to_string())
            .text("messageType", message.kind().as_str());
        if let Some(text) = message.trimmed_text() {
            form = form.text("text", text.to_string());
        }
        if let Some(attachment) = &message.attachment {
            let mut part = multipart::Part::bytes(attachment.bytes.clone())
                .file_name(attachment.filename.clone());
            if let Some(mime) = &attachment.mime_type {
                part = part.mime_str(mime).map_err(SyncError::network)?;
            }
            form = form.part("file", part);
        }
        self.execute(self.http.post(url).multipart(form)).await
    }

    async fn edit_message(&self, message_id: &MessageId, text: &str) -> SyncResult<Message> {
        let url = self.endpoint(&["message", "edit", message_id.as_str()])?;
        self.execute(self.http.put(url).json(&EditMessageRequest {
            text: text.to_string(),
        }))
        .await
    }

    async fn delete_message(&self, message_id: &MessageId) -> SyncResult<()> {
        let url = self.endpoint(&["message", "delete", message_id.as_str()])?;
        self.execute_ack(self.http.delete(url)).await
    }

    async fn recent_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        let url = self.endpoint(&["message", "recent-chats"])?;
        self.execute(self.http.get(url)).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
