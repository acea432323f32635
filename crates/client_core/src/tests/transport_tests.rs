use std::{sync::Arc, time::Duration};

use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode as HttpStatus},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use shared::{
    domain::{ConversationId, UserId},
    protocol::ConnectedAck,
};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct WsState {
    received: Arc<Mutex<Vec<String>>>,
}

async fn ws_route(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer good-token");
    if !authorized {
        return HttpStatus::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: WsState, mut socket: WebSocket) {
    let ack = serde_json::to_string(&ServerFrame::Connected(ConnectedAck {
        user_id: UserId::from("me"),
    }))
    .expect("encode ack");
    if socket.send(WsMessage::Text(ack)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            state.received.lock().await.push(text);
            let _ = socket.send(WsMessage::Close(None)).await;
            break;
        }
    }
}

async fn spawn_ws_server() -> (Url, WsState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = WsState::default();
    let app = Router::new()
        .route("/ws", get(ws_route))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (
        Url::parse(&format!("ws://{addr}/ws")).expect("url"),
        state,
    )
}

#[tokio::test]
async fn connects_with_bearer_token_and_exchanges_frames() {
    let (endpoint, state) = spawn_ws_server().await;
    let connector = WebSocketConnector::new(endpoint);

    let PushTransport {
        mut sink,
        mut stream,
    } = connector.connect("good-token").await.expect("connect");

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("ack in time")
        .expect("frame")
        .expect("decoded");
    assert!(matches!(first, ServerFrame::Connected(ack) if ack.user_id == UserId::from("me")));

    sink.send(ClientFrame::Join {
        conversation_id: ConversationId::from("A"),
    })
    .await
    .expect("send join");

    let closed = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("close in time");
    assert!(closed.is_none(), "close frame must end the stream");

    let received = state.received.lock().await;
    assert_eq!(received.len(), 1);
    let decoded: ClientFrame = serde_json::from_str(&received[0]).expect("client frame");
    assert_eq!(
        decoded,
        ClientFrame::Join {
            conversation_id: ConversationId::from("A")
        }
    );
}

#[tokio::test]
async fn rejected_upgrade_is_unauthorized() {
    let (endpoint, _state) = spawn_ws_server().await;
    let connector = WebSocketConnector::new(endpoint);

    let err = match connector.connect("bad-token").await {
        Ok(_) => panic!("bad token must be rejected"),
        Err(err) => err,
    };
    assert!(err.is_fatal(), "unexpected error: {err}");
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_error() {
    let connector = WebSocketConnector::new(Url::parse("ws://127.0.0.1:9/ws").expect("url"));
    let err = match connector.connect("good-token").await {
        Ok(_) => panic!("nothing listens on port 9"),
        Err(err) => err,
    };
    assert!(matches!(err, ConnectError::Transport(_)));
}

#[test]
fn undecodable_text_frames_surface_as_decode_errors() {
    let decoded = decode_frame(Ok(Message::Text("{\"type\":\"bogus\"}".into())));
    let Some(Err(err)) = decoded else {
        panic!("expected a decode error");
    };
    assert!(FrameDecodeError::is_decode_error(&err));
    assert!(err.to_string().contains("bogus"));
    assert!(decode_frame(Ok(Message::Ping(Vec::new()))).is_none());
}

#[test]
fn socket_failures_are_not_decode_errors() {
    let decoded = decode_frame(Err(tungstenite::Error::ConnectionClosed));
    let Some(Err(err)) = decoded else {
        panic!("expected a receive error");
    };
    assert!(!FrameDecodeError::is_decode_error(&err));
}
