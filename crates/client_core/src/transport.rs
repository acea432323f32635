use std::pin::Pin;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{future, stream::BoxStream, Sink, SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Message,
    },
};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::error::ConnectError;

/// A text frame that is not a known `ServerFrame`. The connection that carried it is still healthy.
#[derive(Debug, Error)]
#[error("undecodable push frame ({reason}): {raw}")]
pub struct FrameDecodeError {
    pub raw: String,
    pub reason: String,
}

impl FrameDecodeError {
    /// Whether a stream error came from decoding rather than from the transport.
    pub fn is_decode_error(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Self>().is_some()
    }
}

pub type FrameSink = Pin<Box<dyn Sink<ClientFrame, Error = anyhow::Error> + Send>>;
pub type FrameStream = BoxStream<'static, anyhow::Result<ServerFrame>>;

/// One established push connection, split into its outbound and inbound halves.
pub struct PushTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Opens the transport. The handshake acknowledgement arrives as the first frame on `stream`.
    async fn connect(&self, token: &str) -> Result<PushTransport, ConnectError>;
}

pub struct WebSocketConnector {
    endpoint: Url,
}

impl WebSocketConnector {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

fn classify_connect_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            ConnectError::Unauthorized(format!("websocket upgrade returned {}", response.status()))
        }
        other => ConnectError::Transport(anyhow::Error::from(other)),
    }
}

fn decode_frame(message: Result<Message, tungstenite::Error>) -> Option<anyhow::Result<ServerFrame>> {
    match message {
        Ok(Message::Text(text)) => Some(serde_json::from_str::<ServerFrame>(&text).map_err(|err| {
            anyhow::Error::new(FrameDecodeError {
                reason: err.to_string(),
                raw: text,
            })
        })),
        Ok(other) => {
            debug!("transport: ignoring non-text websocket message {other:?}");
            None
        }
        Err(err) => Some(Err(anyhow!("websocket receive failed: {err}"))),
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, token: &str) -> Result<PushTransport, ConnectError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Transport(err.into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ConnectError::Transport(err.into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(classify_connect_error)?;
        debug!(endpoint = %self.endpoint, "transport: websocket established");
        let (writer, reader) = ws_stream.split();

        let sink = writer
            .sink_map_err(anyhow::Error::from)
            .with(|frame: ClientFrame| {
                future::ready(
                    serde_json::to_string(&frame)
                        .map(Message::Text)
                        .map_err(anyhow::Error::from),
                )
            });
        let stream = reader
            .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
            .filter_map(|message| future::ready(decode_frame(message)));

        Ok(PushTransport {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
