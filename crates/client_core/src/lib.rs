use std::sync::Arc;

use anyhow::Context;
use shared::domain::UserId;

pub mod api;
pub mod config;
pub mod error;
pub mod read_state;
pub mod recency;
pub mod reconciler;
pub mod session;
pub mod sync;
pub mod transport;
pub mod window;

pub use api::{AttachmentUpload, ChatApi, HttpChatApi, OutgoingMessage};
pub use config::{load_settings, ClientSettings, SessionSettings};
pub use error::{ConnectError, SyncError, SyncResult};
pub use session::{ConnectionState, ConversationSubscription, SessionEvent, SessionManager};
pub use sync::{ChatSync, SyncEvent, WindowSnapshot};
pub use transport::{PushConnector, WebSocketConnector};

/// Builds the HTTP and push clients from `settings` and starts syncing for `self_id`.
pub async fn start_sync(
    settings: ClientSettings,
    token: &str,
    self_id: UserId,
) -> anyhow::Result<Arc<ChatSync>> {
    let api = HttpChatApi::new(&settings, token).context("failed to build http client")?;
    let connector = WebSocketConnector::new(settings.push_endpoint()?);
    let session = SessionManager::start(Arc::new(connector), token, settings.session_settings());
    let sync = ChatSync::start(Arc::new(api), Arc::clone(&session), settings, self_id).await;
    match sync {
        Ok(sync) => Ok(sync),
        Err(err) => {
            session.shutdown().await;
            Err(err).context("initial sync failed")
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
