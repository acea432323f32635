use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network request failed: {0}")]
    Network(#[source] anyhow::Error),
    #[error("server rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("no conversation is open")]
    NotOpen,
    #[error("conversation {0} is not open")]
    NotCurrent(ConversationId),
    #[error("user {user_id} may not send in conversation {conversation_id}")]
    SendingDisabled {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("no pending send with local id {0}")]
    PendingNotFound(String),
    #[error("push session has been torn down")]
    SessionClosed,
    #[error("authentication rejected by server")]
    AuthRejected,
}

impl SyncError {
    pub fn network(err: impl Into<anyhow::Error>) -> Self {
        Self::Network(err.into())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("push handshake rejected: {0}")]
    Unauthorized(String),
    #[error("push handshake timed out")]
    HandshakeTimeout,
    #[error("push transport failed: {0}")]
    Transport(#[source] anyhow::Error),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}
