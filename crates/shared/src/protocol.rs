use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: MessageId,
    #[serde(alias = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, rename = "type", alias = "messageType")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "isEdited")]
    pub edited: bool,
    #[serde(default, alias = "isRead")]
    pub read: bool,
}

impl Message {
    /// Server timestamp of the most recent write to this message.
    pub fn last_write_at(&self) -> DateTime<Utc> {
        self.updated_at
            .map(|updated| updated.max(self.created_at))
            .unwrap_or(self.created_at)
    }

    pub fn is_from(&self, user_id: &UserId) -> bool {
        &self.sender_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "_id")]
    pub id: UserId,
    #[serde(default, alias = "fullName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, alias = "profilePic", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(alias = "_id")]
    pub id: ConversationId,
    #[serde(default)]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "friend", skip_serializing_if = "Option::is_none")]
    pub peer: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, alias = "lastMessageTime", skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "inactiveFor")]
    pub inactive_members: Vec<UserId>,
}

impl ConversationSummary {
    /// Minimal entry for a conversation first seen through a push event.
    pub fn placeholder(id: ConversationId, last_activity_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            name: None,
            peer: None,
            avatar_url: None,
            last_activity_at: Some(last_activity_at),
            inactive_members: Vec::new(),
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.peer.as_ref().and_then(|p| p.display_name.clone()))
            .unwrap_or_else(|| self.id.to_string())
    }

    /// The other party of a direct conversation.
    pub fn counterpart(&self) -> Option<&UserId> {
        match self.kind {
            ConversationKind::Direct => self.peer.as_ref().map(|peer| &peer.id),
            ConversationKind::Group => None,
        }
    }

    pub fn can_send(&self, user_id: &UserId) -> bool {
        !self.inactive_members.contains(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSnapshotEntry {
    #[serde(default, alias = "chatId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
}

/// Keyed by conversation id; older servers key by position and carry the id in the entry.
pub type UnreadSnapshot = HashMap<String, UnreadSnapshotEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(alias = "chatId")]
    pub conversation_id: ConversationId,
    pub reader: UserId,
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    #[serde(alias = "_id")]
    pub id: MessageId,
    #[serde(alias = "chatId")]
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadUpdate {
    #[serde(alias = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedAck {
    pub user_id: UserId,
}

/// Live events delivered over the push stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PushEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:edit")]
    MessageEdit(Message),
    #[serde(rename = "message:delete")]
    MessageDelete(MessageDeleted),
    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),
    #[serde(rename = "unread:update")]
    UnreadUpdate(UnreadUpdate),
}

impl PushEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageNew(message) | Self::MessageEdit(message) => &message.conversation_id,
            Self::MessageDelete(deleted) => &deleted.conversation_id,
            Self::MessageRead(receipt) => &receipt.conversation_id,
            Self::UnreadUpdate(update) => &update.conversation_id,
        }
    }
}

/// Every frame the server may send on the push stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected(ConnectedAck),
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:edit")]
    MessageEdit(Message),
    #[serde(rename = "message:delete")]
    MessageDelete(MessageDeleted),
    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),
    #[serde(rename = "unread:update")]
    UnreadUpdate(UnreadUpdate),
    #[serde(rename = "error")]
    Error(ApiError),
}

impl ServerFrame {
    pub fn into_push_event(self) -> Option<PushEvent> {
        match self {
            Self::MessageNew(message) => Some(PushEvent::MessageNew(message)),
            Self::MessageEdit(message) => Some(PushEvent::MessageEdit(message)),
            Self::MessageDelete(deleted) => Some(PushEvent::MessageDelete(deleted)),
            Self::MessageRead(receipt) => Some(PushEvent::MessageRead(receipt)),
            Self::UnreadUpdate(update) => Some(PushEvent::UnreadUpdate(update)),
            Self::Connected(_) | Self::Error(_) => None,
        }
    }
}

impl From<PushEvent> for ServerFrame {
    fn from(value: PushEvent) -> Self {
        match value {
            PushEvent::MessageNew(message) => Self::MessageNew(message),
            PushEvent::MessageEdit(message) => Self::MessageEdit(message),
            PushEvent::MessageDelete(deleted) => Self::MessageDelete(deleted),
            PushEvent::MessageRead(receipt) => Self::MessageRead(receipt),
            PushEvent::UnreadUpdate(update) => Self::UnreadUpdate(update),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
    Leave {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },
}

/// REST response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[serde(rename = "chatId", alias = "conversationId")]
    pub conversation_id: ConversationId,
    pub receiver_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub text: String,
}
