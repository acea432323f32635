//! In-memory collaborators for driving the session actor and the coordinator.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{channel::mpsc as fmpsc, SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId},
    protocol::{
        ClientFrame, ConnectedAck, ConversationSummary, HistoryPage, Message, Pagination,
        Participant, PushEvent, ServerFrame, UnreadSnapshot,
    },
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    api::{ChatApi, OutgoingMessage},
    error::{ConnectError, SyncError, SyncResult},
    transport::{FrameDecodeError, PushConnector, PushTransport},
};

pub(crate) const SELF_ID: &str = "me";

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_067_200 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn message(id: &str, conversation: &str, sender: &str, seconds: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        kind: MessageKind::Text,
        text: Some(format!("text of {id}")),
        attachment: None,
        created_at: at(seconds),
        updated_at: None,
        edited: false,
        read: false,
    }
}

/// `count` messages ending at `last_seconds`, one second apart, oldest first.
pub(crate) fn history(
    conversation: &str,
    prefix: &str,
    count: usize,
    last_seconds: i64,
    has_more: bool,
) -> HistoryPage {
    let first = last_seconds - count as i64 + 1;
    HistoryPage {
        messages: (0..count)
            .map(|n| {
                message(
                    &format!("{prefix}{n}"),
                    conversation,
                    "peer",
                    first + n as i64,
                )
            })
            .collect(),
        pagination: Pagination { has_more },
    }
}

pub(crate) fn direct(conversation: &str, peer: &str, seconds: i64) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::from(conversation),
        kind: ConversationKind::Direct,
        name: None,
        peer: Some(Participant {
            id: UserId::from(peer),
            display_name: Some(peer.to_uppercase()),
            avatar_url: None,
        }),
        avatar_url: None,
        last_activity_at: Some(at(seconds)),
        inactive_members: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ConnectStep {
    Accept,
    /// Accepts the transport but never acknowledges the handshake.
    AcceptSilently,
    Fail(&'static str),
    Reject(&'static str),
}

/// Server side of one fake push connection.
pub(crate) struct ServerEnd {
    frames: fmpsc::UnboundedSender<anyhow::Result<ServerFrame>>,
    client_frames: fmpsc::UnboundedReceiver<ClientFrame>,
}

impl ServerEnd {
    pub(crate) fn push(&self, event: PushEvent) {
        self.send(ServerFrame::from(event));
    }

    pub(crate) fn send(&self, frame: ServerFrame) {
        let _ = self.frames.unbounded_send(Ok(frame));
    }

    /// A text frame the client cannot decode, as the websocket transport reports it.
    pub(crate) fn send_undecodable(&self, raw: &str) {
        let _ = self
            .frames
            .unbounded_send(Err(anyhow::Error::new(FrameDecodeError {
                raw: raw.to_string(),
                reason: "unknown variant".into(),
            })));
    }

    pub(crate) async fn next_client_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(5), self.client_frames.next())
            .await
            .expect("client frame in time")
            .expect("client sink open")
    }

    /// Next client frame if one shows up shortly.
    pub(crate) async fn maybe_client_frame(&mut self) -> Option<ClientFrame> {
        tokio::time::timeout(Duration::from_millis(100), self.client_frames.next())
            .await
            .ok()
            .flatten()
    }
}

pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<ConnectStep>>,
    attempts: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub(crate) fn new(
        script: impl IntoIterator<Item = ConnectStep>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, connections) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, connections)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("tokens lock").clone()
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, token: &str) -> Result<PushTransport, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().expect("tokens lock").push(token.to_string());
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(ConnectStep::Accept);

        let acknowledge = match step {
            ConnectStep::Fail(reason) => return Err(ConnectError::Transport(anyhow!(reason))),
            ConnectStep::Reject(reason) => return Err(ConnectError::Unauthorized(reason.into())),
            ConnectStep::Accept => true,
            ConnectStep::AcceptSilently => false,
        };

        let (frames, frame_rx) = fmpsc::unbounded();
        let (client_tx, client_frames) = fmpsc::unbounded();
        if acknowledge {
            let _ = frames.unbounded_send(Ok(ServerFrame::Connected(ConnectedAck {
                user_id: UserId::from(SELF_ID),
            })));
        }
        let _ = self.accepted.send(ServerEnd {
            frames,
            client_frames,
        });

        Ok(PushTransport {
            sink: Box::pin(client_tx.sink_map_err(anyhow::Error::from)),
            stream: frame_rx.boxed(),
        })
    }
}

pub(crate) async fn next_connection(connections: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(30), connections.recv())
        .await
        .expect("connection in time")
        .expect("connector alive")
}

type PageKey = (ConversationId, u32);

#[derive(Default)]
pub(crate) struct FakeChatApi {
    pages: Mutex<HashMap<PageKey, HistoryPage>>,
    gates: Mutex<HashMap<PageKey, oneshot::Receiver<()>>>,
    failing_pages: Mutex<HashSet<PageKey>>,
    history_calls: Mutex<Vec<PageKey>>,
    mark_reads: Mutex<Vec<(ConversationId, UserId)>>,
    conversations: Mutex<Vec<ConversationSummary>>,
    unread: Mutex<UnreadSnapshot>,
    sent: Mutex<Vec<OutgoingMessage>>,
    fail_sends: AtomicBool,
    ack_seconds: Mutex<i64>,
    edit_results: Mutex<HashMap<MessageId, Message>>,
}

impl FakeChatApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_page(&self, conversation: &str, page: u32, body: HistoryPage) {
        self.pages
            .lock()
            .expect("pages lock")
            .insert((ConversationId::from(conversation), page), body);
    }

    /// Holds the page response until the returned sender fires or is dropped.
    pub(crate) fn gate_page(&self, conversation: &str, page: u32) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.gates
            .lock()
            .expect("gates lock")
            .insert((ConversationId::from(conversation), page), gate);
        release
    }

    pub(crate) fn fail_page(&self, conversation: &str, page: u32, failing: bool) {
        let key = (ConversationId::from(conversation), page);
        let mut failing_pages = self.failing_pages.lock().expect("failing lock");
        if failing {
            failing_pages.insert(key);
        } else {
            failing_pages.remove(&key);
        }
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
        *self.conversations.lock().expect("conversations lock") = conversations;
    }

    pub(crate) fn set_unread(&self, unread: UnreadSnapshot) {
        *self.unread.lock().expect("unread lock") = unread;
    }

    pub(crate) fn set_fail_sends(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_ack_seconds(&self, seconds: i64) {
        *self.ack_seconds.lock().expect("ack lock") = seconds;
    }

    pub(crate) fn set_edit_result(&self, edited: Message) {
        self.edit_results
            .lock()
            .expect("edits lock")
            .insert(edited.id.clone(), edited);
    }

    pub(crate) fn history_calls(&self) -> Vec<(ConversationId, u32)> {
        self.history_calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn mark_reads(&self) -> Vec<(ConversationId, UserId)> {
        self.mark_reads.lock().expect("mark lock").clone()
    }

    pub(crate) fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn history_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
        _page_size: u32,
    ) -> SyncResult<HistoryPage> {
        let key = (conversation_id.clone(), page);
        self.history_calls
            .lock()
            .expect("calls lock")
            .push(key.clone());

        let gate = self.gates.lock().expect("gates lock").remove(&key);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self
            .failing_pages
            .lock()
            .expect("failing lock")
            .contains(&key)
        {
            return Err(SyncError::network(anyhow!("page {page} unavailable")));
        }
        Ok(self
            .pages
            .lock()
            .expect("pages lock")
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn unread_snapshot(&self) -> SyncResult<UnreadSnapshot> {
        Ok(self.unread.lock().expect("unread lock").clone())
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        receiver_id: &UserId,
    ) -> SyncResult<()> {
        self.mark_reads
            .lock()
            .expect("mark lock")
            .push((conversation_id.clone(), receiver_id.clone()));
        Ok(())
    }

    async fn send_message(&self, outgoing: &OutgoingMessage) -> SyncResult<Message> {
        let count = {
            let mut sent = self.sent.lock().expect("sent lock");
            sent.push(outgoing.clone());
            sent.len()
        };
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::network(anyhow!("send failed")));
        }
        let seconds = *self.ack_seconds.lock().expect("ack lock");
        let mut acked = message(
            &format!("srv-{count}"),
            outgoing.conversation_id.as_str(),
            SELF_ID,
            seconds,
        );
        acked.text = outgoing.trimmed_text().map(str::to_string);
        acked.kind = outgoing.kind();
        Ok(acked)
    }

    async fn edit_message(&self, message_id: &MessageId, text: &str) -> SyncResult<Message> {
        let scripted = self
            .edit_results
            .lock()
            .expect("edits lock")
            .get(message_id)
            .cloned();
        let mut edited = scripted.ok_or_else(|| SyncError::network(anyhow!("edit not scripted")))?;
        edited.text = Some(text.to_string());
        Ok(edited)
    }

    async fn delete_message(&self, _message_id: &MessageId) -> SyncResult<()> {
        Ok(())
    }

    async fn recent_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        Ok(self.conversations.lock().expect("conversations lock").clone())
    }
}
