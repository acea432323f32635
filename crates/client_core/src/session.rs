//! Owner of the single push-stream connection for an authenticated session.
//!
//! The connection lives inside one actor task. Callers reach it through an
//! unbounded command channel, so subscribe/unsubscribe are serialized and can
//! be issued from synchronous code such as `Drop`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use futures::{SinkExt, Stream, StreamExt};
use shared::{
    domain::ConversationId,
    protocol::{ClientFrame, ConnectedAck, PushEvent, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionSettings,
    error::{ConnectError, SyncError, SyncResult},
    transport::{FrameDecodeError, FrameSink, FrameStream, PushConnector, PushTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Pending,
    Joined,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Push(PushEvent),
    StateChanged(ConnectionState),
    Joined(ConversationId),
    SubscriptionFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    ServerError(String),
    /// Reconnect attempts exhausted; the session stays disconnected until new demand.
    GaveUp,
    AuthRejected(String),
    Closed,
}

#[derive(Debug)]
enum Command {
    Connect,
    Reconnect,
    Subscribe(ConversationId),
    Unsubscribe(ConversationId),
    Snapshot(oneshot::Sender<HashMap<ConversationId, JoinState>>),
    Attach(mpsc::UnboundedSender<SessionEvent>),
    Shutdown,
}

pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Spawns the session actor. No connection is made until something demands one.
    pub fn start(
        connector: Arc<dyn PushConnector>,
        token: impl Into<String>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_buffer);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let actor = SessionActor {
            connector,
            token: token.into(),
            settings,
            commands: command_rx,
            events: events.clone(),
            state: state_tx,
            subscriptions: HashMap::new(),
            feeds: Vec::new(),
            demanded: false,
            parked: false,
        };
        let task = tokio::spawn(actor.run());

        Arc::new(Self {
            commands,
            events,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    fn command(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Demands a connection without joining any conversation (user-level events).
    pub fn connect(&self) -> SyncResult<()> {
        self.command(Command::Connect)
    }

    /// Manual retry after reconnect attempts were exhausted.
    pub fn reconnect(&self) -> SyncResult<()> {
        self.command(Command::Reconnect)
    }

    /// Joins `conversation_id`; the returned handle leaves again when dropped.
    pub fn subscribe(&self, conversation_id: ConversationId) -> SyncResult<ConversationSubscription> {
        self.command(Command::Subscribe(conversation_id.clone()))?;
        Ok(ConversationSubscription {
            conversation_id,
            commands: self.commands.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Best-effort listener; a slow receiver skips events (`RecvError::Lagged`).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Every event emitted from now on, in order and without gaps. Ends when the session is torn down.
    pub fn event_stream(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        let (feed, events) = mpsc::unbounded_channel();
        if self.command(Command::Attach(feed)).is_err() {
            debug!("session: event stream requested after teardown");
        }
        UnboundedReceiverStream::new(events)
    }

    pub async fn subscriptions(&self) -> HashMap<ConversationId, JoinState> {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Snapshot(tx)).is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Explicit teardown (logout). Waits for the actor to leave joined conversations and exit.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("session: actor task failed: {err}");
            }
        }
    }
}

/// Scoped membership in one conversation. The conversation stays joined while any handle for it is alive.
pub struct ConversationSubscription {
    conversation_id: ConversationId,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConversationSubscription {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl Drop for ConversationSubscription {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(Command::Unsubscribe(self.conversation_id.clone()));
    }
}

#[derive(Debug)]
struct Subscription {
    state: JoinState,
    holders: usize,
}

enum ConnectOutcome {
    Connected(PushTransport),
    GaveUp,
    Rejected(String),
    Shutdown,
}

enum PumpExit {
    TransportLost,
    Rejected(String),
    Shutdown,
}

struct SessionActor {
    connector: Arc<dyn PushConnector>,
    token: String,
    settings: SessionSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    subscriptions: HashMap<ConversationId, Subscription>,
    feeds: Vec<mpsc::UnboundedSender<SessionEvent>>,
    demanded: bool,
    parked: bool,
}

async fn await_ack(stream: &mut FrameStream) -> Result<ConnectedAck, ConnectError> {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) if FrameDecodeError::is_decode_error(&err) => {
                debug!("session: skipping frame before handshake ack: {err}");
                continue;
            }
            Err(err) => return Err(ConnectError::Transport(err)),
        };
        match frame {
            ServerFrame::Connected(ack) => return Ok(ack),
            ServerFrame::Error(err) if err.is_auth_failure() => {
                return Err(ConnectError::Unauthorized(err.message))
            }
            other => debug!("session: ignoring frame before handshake ack: {other:?}"),
        }
    }
    Err(ConnectError::Transport(anyhow!(
        "push stream closed during handshake"
    )))
}

async fn establish(
    connector: Arc<dyn PushConnector>,
    token: String,
    handshake_timeout: Duration,
) -> Result<PushTransport, ConnectError> {
    let mut transport = connector.connect(&token).await?;
    let ack = tokio::time::timeout(handshake_timeout, await_ack(&mut transport.stream))
        .await
        .map_err(|_| ConnectError::HandshakeTimeout)??;

    info!(user_id = %ack.user_id, "session: handshake acknowledged");
    Ok(transport)
}

impl SessionActor {
    async fn run(mut self) {
        let mut reconnecting = false;
        loop {
            if !self.wants_connection() {
                reconnecting = false;
                self.set_state(ConnectionState::Disconnected);
                match self.commands.recv().await {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        self.apply_offline(command);
                        continue;
                    }
                }
            }

            match self.connect_with_retry(reconnecting).await {
                ConnectOutcome::Connected(transport) => match self.pump(transport).await {
                    PumpExit::TransportLost => {
                        self.mark_all_pending();
                        reconnecting = true;
                    }
                    PumpExit::Rejected(reason) => {
                        self.reject(reason);
                        break;
                    }
                    PumpExit::Shutdown => break,
                },
                ConnectOutcome::GaveUp => {
                    self.parked = true;
                    reconnecting = false;
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(SessionEvent::GaveUp);
                }
                ConnectOutcome::Rejected(reason) => {
                    self.reject(reason);
                    break;
                }
                ConnectOutcome::Shutdown => break,
            }
        }

        self.subscriptions.clear();
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Closed);
        info!("session: torn down");
    }

    fn wants_connection(&self) -> bool {
        !self.parked && (self.demanded || !self.subscriptions.is_empty())
    }

    fn emit(&mut self, event: SessionEvent) {
        let _ = self.events.send(event.clone());
        self.feeds.retain(|feed| feed.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "session: state transition");
            self.emit(SessionEvent::StateChanged(next));
        }
    }

    fn reject(&mut self, reason: String) {
        error!("session: authentication rejected: {reason}");
        self.emit(SessionEvent::AuthRejected(reason));
    }

    fn mark_all_pending(&mut self) {
        for subscription in self.subscriptions.values_mut() {
            subscription.state = JoinState::Pending;
        }
    }

    /// Bookkeeping for commands that need no wire traffic right now.
    fn apply_offline(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.demanded = true;
                self.parked = false;
            }
            Command::Reconnect => self.parked = false,
            Command::Subscribe(conversation_id) => {
                self.parked = false;
                self.subscriptions
                    .entry(conversation_id)
                    .or_insert(Subscription {
                        state: JoinState::Pending,
                        holders: 0,
                    })
                    .holders += 1;
            }
            Command::Unsubscribe(conversation_id) => {
                self.release(&conversation_id);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Attach(feed) => self.feeds.push(feed),
            Command::Shutdown => {}
        }
    }

    /// Drops one holder; returns the join state if this was the last one.
    fn release(&mut self, conversation_id: &ConversationId) -> Option<JoinState> {
        let subscription = self.subscriptions.get_mut(conversation_id)?;
        subscription.holders = subscription.holders.saturating_sub(1);
        if subscription.holders > 0 {
            return None;
        }
        self.subscriptions
            .remove(conversation_id)
            .map(|subscription| subscription.state)
    }

    fn snapshot(&self) -> HashMap<ConversationId, JoinState> {
        self.subscriptions
            .iter()
            .map(|(id, subscription)| (id.clone(), subscription.state))
            .collect()
    }

    async fn connect_with_retry(&mut self, reconnecting: bool) -> ConnectOutcome {
        self.set_state(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let max_attempts = self.settings.reconnect_attempts;
        for attempt in 1..=max_attempts {
            info!(attempt, max_attempts, reconnecting, "session: connect attempt");
            let attempt_future = establish(
                Arc::clone(&self.connector),
                self.token.clone(),
                self.settings.handshake_timeout,
            );
            tokio::pin!(attempt_future);

            let result = loop {
                tokio::select! {
                    result = &mut attempt_future => break result,
                    command = self.commands.recv() => match command {
                        None | Some(Command::Shutdown) => return ConnectOutcome::Shutdown,
                        Some(command) => self.apply_offline(command),
                    },
                }
            };

            match result {
                Ok(transport) => return ConnectOutcome::Connected(transport),
                Err(err) if err.is_fatal() => return ConnectOutcome::Rejected(err.to_string()),
                Err(err) => warn!(attempt, max_attempts, "session: connect failed: {err}"),
            }

            if attempt < max_attempts {
                let delay = tokio::time::sleep(self.settings.reconnect_delay);
                tokio::pin!(delay);
                loop {
                    tokio::select! {
                        _ = &mut delay => break,
                        command = self.commands.recv() => match command {
                            None | Some(Command::Shutdown) => return ConnectOutcome::Shutdown,
                            Some(command) => self.apply_offline(command),
                        },
                    }
                }
            }
        }

        warn!(max_attempts, "session: connect attempts exhausted");
        ConnectOutcome::GaveUp
    }

    async fn pump(&mut self, transport: PushTransport) -> PumpExit {
        let PushTransport {
            mut sink,
            mut stream,
        } = transport;
        self.set_state(ConnectionState::Connected);

        // The transport never restores joins on its own.
        let pending: Vec<ConversationId> = self
            .subscriptions
            .iter()
            .filter(|(_, subscription)| subscription.state == JoinState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for conversation_id in pending {
            if self.send_join(&mut sink, conversation_id).await.is_err() {
                return PumpExit::TransportLost;
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = sink.close().await;
                        return PumpExit::Shutdown;
                    };
                    match command {
                        Command::Shutdown => {
                            self.leave_all(&mut sink).await;
                            let _ = sink.close().await;
                            return PumpExit::Shutdown;
                        }
                        Command::Subscribe(conversation_id) => {
                            let already_joined = self
                                .subscriptions
                                .get(&conversation_id)
                                .is_some_and(|s| s.state == JoinState::Joined);
                            self.apply_offline(Command::Subscribe(conversation_id.clone()));
                            if already_joined {
                                debug!(conversation_id = %conversation_id, "session: join already active");
                            } else if self.send_join(&mut sink, conversation_id).await.is_err() {
                                return PumpExit::TransportLost;
                            }
                        }
                        Command::Unsubscribe(conversation_id) => {
                            if self.release(&conversation_id) == Some(JoinState::Joined)
                                && self.send_leave(&mut sink, conversation_id).await.is_err()
                            {
                                return PumpExit::TransportLost;
                            }
                        }
                        other => self.apply_offline(other),
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Some(exit) = self.handle_frame(frame) {
                            return exit;
                        }
                    }
                    Some(Err(err)) if FrameDecodeError::is_decode_error(&err) => {
                        warn!("session: skipping push frame: {err}");
                        self.emit(SessionEvent::ServerError(err.to_string()));
                    }
                    Some(Err(err)) => {
                        warn!("session: push stream failed: {err}");
                        return PumpExit::TransportLost;
                    }
                    None => {
                        info!("session: push stream closed by server");
                        return PumpExit::TransportLost;
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame) -> Option<PumpExit> {
        match frame {
            ServerFrame::Connected(_) => {
                debug!("session: duplicate handshake ack ignored");
                None
            }
            ServerFrame::Error(err) if err.is_auth_failure() => Some(PumpExit::Rejected(err.message)),
            ServerFrame::Error(err) => {
                warn!(code = ?err.code, "session: server reported error: {}", err.message);
                self.emit(SessionEvent::ServerError(err.message));
                None
            }
            other => {
                if let Some(event) = other.into_push_event() {
                    self.emit(SessionEvent::Push(event));
                }
                None
            }
        }
    }

    async fn send_join(
        &mut self,
        sink: &mut FrameSink,
        conversation_id: ConversationId,
    ) -> anyhow::Result<()> {
        let frame = ClientFrame::Join {
            conversation_id: conversation_id.clone(),
        };
        match sink.send(frame).await {
            Ok(()) => {
                if let Some(subscription) = self.subscriptions.get_mut(&conversation_id) {
                    subscription.state = JoinState::Joined;
                }
                info!(conversation_id = %conversation_id, "session: joined conversation");
                self.emit(SessionEvent::Joined(conversation_id));
                Ok(())
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "session: join failed: {err}");
                self.emit(SessionEvent::SubscriptionFailed {
                    conversation_id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn send_leave(
        &mut self,
        sink: &mut FrameSink,
        conversation_id: ConversationId,
    ) -> anyhow::Result<()> {
        let result = sink
            .send(ClientFrame::Leave {
                conversation_id: conversation_id.clone(),
            })
            .await;
        match &result {
            Ok(()) => info!(conversation_id = %conversation_id, "session: left conversation"),
            Err(err) => {
                warn!(conversation_id = %conversation_id, "session: leave failed: {err}");
                self.emit(SessionEvent::SubscriptionFailed {
                    conversation_id,
                    reason: err.to_string(),
                });
            }
        }
        result
    }

    async fn leave_all(&mut self, sink: &mut FrameSink) {
        let joined: Vec<ConversationId> = self
            .subscriptions
            .iter()
            .filter(|(_, subscription)| subscription.state == JoinState::Joined)
            .map(|(id, _)| id.clone())
            .collect();
        for conversation_id in joined {
            if self.send_leave(sink, conversation_id).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
