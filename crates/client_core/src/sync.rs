//! `ChatSync` wires the components together for one signed-in user.
//!
//! Component state sits behind a single async mutex that is never held across
//! a network call. Live events are applied by one pump task in the order the
//! session actor emits them, so per-conversation ordering is preserved.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use chrono::Utc;
use futures::{Stream, StreamExt};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, Message, PushEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    api::{ChatApi, OutgoingMessage},
    config::ClientSettings,
    error::{SyncError, SyncResult},
    read_state::{MarkReadAction, ReadStateTracker, UnreadEntry},
    reconciler::{self, ApplyOutcome, ReceiptContext},
    recency::RecencyIndex,
    session::{ConnectionState, ConversationSubscription, SessionEvent, SessionManager},
    window::{
        FetchTicket, PageOutcome, PaginationState, PaginationWindowManager, PendingSend,
        PendingState, ScrollAnchor,
    },
};

#[derive(Debug, Clone)]
pub enum SyncEvent {
    WindowChanged(ConversationId),
    OlderPrepended {
        conversation_id: ConversationId,
        anchor: ScrollAnchor,
    },
    PageFailed {
        conversation_id: ConversationId,
        page: u32,
        reason: String,
    },
    UnreadChanged,
    ConversationsChanged,
    Connection(ConnectionState),
    /// Reconnect attempts exhausted; call `reconnect` to try again.
    ConnectionLost,
    SubscriptionFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    SendFailed {
        conversation_id: ConversationId,
        local_id: String,
        reason: String,
    },
    SessionTerminated(String),
}

/// Render-ready copy of the open conversation.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub pending: Vec<PendingSend>,
    pub pagination: PaginationState,
    pub can_send: bool,
}

struct SyncState {
    windows: PaginationWindowManager,
    read_state: ReadStateTracker,
    recency: RecencyIndex,
    subscription: Option<ConversationSubscription>,
    ended: Option<Ended>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    TornDown,
    Rejected,
}

impl SyncState {
    fn counterpart_of(&self, conversation_id: &ConversationId) -> Option<UserId> {
        self.recency
            .summary(conversation_id)
            .and_then(ConversationSummary::counterpart)
            .cloned()
    }

    fn ensure_live(&self) -> SyncResult<()> {
        match self.ended {
            None => Ok(()),
            Some(Ended::TornDown) => Err(SyncError::SessionClosed),
            Some(Ended::Rejected) => Err(SyncError::AuthRejected),
        }
    }

    fn reset(&mut self) {
        if let Some(closed) = self.windows.close() {
            self.read_state.close(&closed);
        }
        self.subscription = None;
    }
}

pub struct ChatSync {
    api: Arc<dyn ChatApi>,
    session: Arc<SessionManager>,
    settings: ClientSettings,
    self_id: UserId,
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSync {
    /// Loads the conversation list and unread snapshot, then starts following live events.
    pub async fn start(
        api: Arc<dyn ChatApi>,
        session: Arc<SessionManager>,
        settings: ClientSettings,
        self_id: UserId,
    ) -> SyncResult<Arc<Self>> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(16));
        let sync = Arc::new(Self {
            state: Mutex::new(SyncState {
                windows: PaginationWindowManager::new(
                    settings.page_size,
                    settings.out_of_window_buffer,
                ),
                read_state: ReadStateTracker::new(self_id.clone()),
                recency: RecencyIndex::new(),
                subscription: None,
                ended: None,
            }),
            api,
            session,
            settings,
            self_id,
            events,
            pump: Mutex::new(None),
        });

        let session_events = sync.session.event_stream();
        sync.refresh_conversations().await?;
        sync.refresh_unread().await?;

        let weak = Arc::downgrade(&sync);
        let pump = tokio::spawn(Self::run_pump(weak, session_events));
        *sync.pump.lock().await = Some(pump);

        sync.session.connect()?;
        info!(user_id = %sync.self_id, "sync: started");
        Ok(sync)
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn run_pump(
        sync: Weak<Self>,
        session_events: impl Stream<Item = SessionEvent> + Send + 'static,
    ) {
        let mut session_events = Box::pin(session_events);
        while let Some(event) = session_events.next().await {
            let Some(sync) = sync.upgrade() else {
                break;
            };
            if !sync.handle_session_event(event).await {
                break;
            }
        }
        debug!("sync: session event pump finished");
    }

    /// Returns false once the session is gone for good.
    async fn handle_session_event(&self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Push(push) => self.apply_push(push).await,
            SessionEvent::StateChanged(state) => self.emit(SyncEvent::Connection(state)),
            SessionEvent::Joined(conversation_id) => {
                debug!(conversation_id = %conversation_id, "sync: live updates active");
            }
            SessionEvent::SubscriptionFailed {
                conversation_id,
                reason,
            } => {
                warn!(conversation_id = %conversation_id, "sync: history-only until rejoined: {reason}");
                self.emit(SyncEvent::SubscriptionFailed {
                    conversation_id,
                    reason,
                });
            }
            SessionEvent::ServerError(message) => warn!("sync: server error: {message}"),
            SessionEvent::GaveUp => self.emit(SyncEvent::ConnectionLost),
            SessionEvent::AuthRejected(reason) => {
                error!("sync: authentication rejected, tearing down: {reason}");
                {
                    let mut state = self.state.lock().await;
                    state.ended = Some(Ended::Rejected);
                    state.reset();
                    state.read_state.clear();
                    state.recency.clear();
                }
                self.emit(SyncEvent::SessionTerminated(reason));
                return false;
            }
            SessionEvent::Closed => return false,
        }
        true
    }

    async fn apply_push(&self, event: PushEvent) {
        let conversation_id = event.conversation_id().clone();
        let mut unread_changed = false;
        let mut recency_changed = false;
        let mut mark_read = None;

        let window_outcome = {
            let mut state = self.state.lock().await;
            let SyncState {
                windows,
                read_state,
                recency,
                ..
            } = &mut *state;

            let inbound = match &event {
                PushEvent::MessageNew(message) => Some((&message.sender_id, Some(&message.id))),
                PushEvent::UnreadUpdate(update) => Some((
                    &update.sender_id,
                    update.message.as_ref().map(|message| &message.id),
                )),
                _ => None,
            };
            if let Some((sender_id, message_id)) = inbound {
                let before = read_state.unread().get(&conversation_id).cloned();
                mark_read = read_state.on_inbound(&conversation_id, sender_id, message_id);
                unread_changed = before.as_ref() != read_state.unread().get(&conversation_id);
            }

            let stamp = match &event {
                PushEvent::MessageNew(message) => Some(message.created_at),
                PushEvent::MessageEdit(message) => Some(message.last_write_at()),
                PushEvent::UnreadUpdate(update) => {
                    update.message.as_ref().map(|message| message.created_at)
                }
                PushEvent::MessageDelete(_) | PushEvent::MessageRead(_) => None,
            };
            if let Some(stamp) = stamp {
                recency_changed = recency.touch_authoritative(&conversation_id, stamp);
            }

            let counterpart = recency
                .summary(&conversation_id)
                .and_then(ConversationSummary::counterpart)
                .cloned();
            windows.window_for(&conversation_id).map(|window| {
                reconciler::apply(
                    window,
                    &event,
                    ReceiptContext {
                        self_id: &self.self_id,
                        counterpart: counterpart.as_ref(),
                    },
                )
            })
        };

        match window_outcome {
            Some(ApplyOutcome::Applied) => self.emit(SyncEvent::WindowChanged(conversation_id)),
            Some(outcome) => {
                debug!(conversation_id = %conversation_id, ?outcome, "sync: window unchanged")
            }
            None => {}
        }
        if unread_changed {
            self.emit(SyncEvent::UnreadChanged);
        }
        if recency_changed {
            self.emit(SyncEvent::ConversationsChanged);
        }
        if let Some(action) = mark_read {
            self.spawn_mark_read(action);
        }
    }

    fn spawn_mark_read(&self, action: MarkReadAction) {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let MarkReadAction {
                conversation_id,
                receiver_id,
            } = action;
            match api.mark_read(&conversation_id, &receiver_id).await {
                Ok(()) => debug!(conversation_id = %conversation_id, "sync: marked read"),
                Err(err) => warn!(conversation_id = %conversation_id, "sync: mark read failed: {err}"),
            }
        });
    }

    async fn ensure_live(&self) -> SyncResult<()> {
        self.state.lock().await.ensure_live()
    }

    pub async fn refresh_conversations(&self) -> SyncResult<()> {
        self.ensure_live().await?;
        let conversations = self.api.recent_conversations().await?;
        self.state.lock().await.recency.load(conversations);
        self.emit(SyncEvent::ConversationsChanged);
        Ok(())
    }

    pub async fn refresh_unread(&self) -> SyncResult<()> {
        self.ensure_live().await?;
        let snapshot = self.api.unread_snapshot().await?;
        self.state.lock().await.read_state.load_snapshot(snapshot);
        self.emit(SyncEvent::UnreadChanged);
        Ok(())
    }

    /// Opens `conversation_id`: fresh window, live subscription, first page.
    pub async fn open(&self, conversation_id: ConversationId) -> SyncResult<PageOutcome> {
        let ticket = {
            let mut state = self.state.lock().await;
            state.ensure_live()?;
            let subscription = self.session.subscribe(conversation_id.clone())?;
            state.reset();
            let ticket = state.windows.open(conversation_id.clone());
            state.read_state.open(&conversation_id);
            state.subscription = Some(subscription);
            ticket
        };
        info!(conversation_id = %conversation_id, "sync: opened conversation");
        self.emit(SyncEvent::UnreadChanged);
        self.emit(SyncEvent::WindowChanged(conversation_id));
        self.fetch(ticket).await
    }

    pub async fn close(&self) {
        let closed = {
            let mut state = self.state.lock().await;
            let closed = state.windows.current().cloned();
            state.reset();
            closed
        };
        if let Some(conversation_id) = closed {
            info!(conversation_id = %conversation_id, "sync: closed conversation");
            self.emit(SyncEvent::WindowChanged(conversation_id));
        }
    }

    /// Fetches the next older page. `Ok(None)` when a fetch is in flight or history is exhausted.
    pub async fn load_older(&self) -> SyncResult<Option<PageOutcome>> {
        let ticket = {
            let mut state = self.state.lock().await;
            if state.windows.current().is_none() {
                return Err(SyncError::NotOpen);
            }
            state.windows.begin_load_older()
        };
        match ticket {
            Some(ticket) => self.fetch(ticket).await.map(Some),
            None => Ok(None),
        }
    }

    /// Scroll hook: starts a backward fetch when the viewport nears the top edge.
    pub async fn on_scroll(&self, offset_from_top_px: f32) -> SyncResult<Option<PageOutcome>> {
        let ticket = {
            let mut state = self.state.lock().await;
            if !state
                .windows
                .should_trigger(offset_from_top_px, self.settings.top_edge_threshold_px)
            {
                return Ok(None);
            }
            state.windows.begin_load_older()
        };
        match ticket {
            Some(ticket) => self.fetch(ticket).await.map(Some),
            None => Ok(None),
        }
    }

    async fn fetch(&self, ticket: FetchTicket) -> SyncResult<PageOutcome> {
        let page_size = self.settings.page_size;
        let result = self
            .api
            .history_page(&ticket.conversation_id, ticket.page, page_size)
            .await;

        let mut state = self.state.lock().await;
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                if !state.windows.fail(&ticket) {
                    debug!(conversation_id = %ticket.conversation_id, page = ticket.page, "sync: stale page failure ignored");
                    return Ok(PageOutcome::Stale);
                }
                drop(state);
                warn!(conversation_id = %ticket.conversation_id, page = ticket.page, "sync: page load failed: {err}");
                self.emit(SyncEvent::PageFailed {
                    conversation_id: ticket.conversation_id,
                    page: ticket.page,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let outcome = state.windows.complete(&ticket, page);
        let mark_read = match &outcome {
            PageOutcome::Loaded { page: 1, .. } => {
                state
                    .counterpart_of(&ticket.conversation_id)
                    .map(|receiver_id| MarkReadAction {
                        conversation_id: ticket.conversation_id.clone(),
                        receiver_id,
                    })
            }
            _ => None,
        };
        drop(state);

        match &outcome {
            PageOutcome::Stale => {}
            PageOutcome::Loaded { page: 1, .. } => {
                self.emit(SyncEvent::WindowChanged(ticket.conversation_id.clone()))
            }
            PageOutcome::Loaded { anchor, .. } => self.emit(SyncEvent::OlderPrepended {
                conversation_id: ticket.conversation_id.clone(),
                anchor: anchor.clone(),
            }),
        }
        if let Some(action) = mark_read {
            self.spawn_mark_read(action);
        }
        Ok(outcome)
    }

    /// Sends into the open conversation. The message shows as pending until the server acknowledges it.
    pub async fn send(&self, outgoing: OutgoingMessage) -> SyncResult<Message> {
        if outgoing.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let local_id = format!("local-{}", Uuid::new_v4());
        let conversation_id = outgoing.conversation_id.clone();
        {
            let mut state = self.state.lock().await;
            state.ensure_live()?;
            match state.windows.current() {
                None => return Err(SyncError::NotOpen),
                Some(current) if current != &conversation_id => {
                    return Err(SyncError::NotCurrent(conversation_id))
                }
                Some(_) => {}
            }
            let permitted = state
                .recency
                .summary(&conversation_id)
                .map_or(true, |summary| summary.can_send(&self.self_id));
            if !permitted {
                return Err(SyncError::SendingDisabled {
                    conversation_id,
                    user_id: self.self_id.clone(),
                });
            }

            let optimistic_at = Utc::now();
            if let Some(window) = state.windows.window_for(&conversation_id) {
                window.push_pending(PendingSend {
                    local_id: local_id.clone(),
                    outgoing: outgoing.clone(),
                    optimistic_at,
                    state: PendingState::Sending,
                });
            }
            state.recency.touch_optimistic(&conversation_id, optimistic_at);
        }
        self.emit(SyncEvent::WindowChanged(conversation_id));
        self.emit(SyncEvent::ConversationsChanged);

        self.deliver(local_id, outgoing).await
    }

    /// Resends a failed pending message.
    pub async fn retry_send(&self, local_id: &str) -> SyncResult<Message> {
        let outgoing = {
            let mut state = self.state.lock().await;
            let pending = state
                .windows
                .window_mut()
                .and_then(|window| window.pending_mut(local_id))
                .filter(|pending| matches!(pending.state, PendingState::Failed(_)))
                .ok_or_else(|| SyncError::PendingNotFound(local_id.to_string()))?;
            pending.state = PendingState::Sending;
            pending.outgoing.clone()
        };
        self.emit(SyncEvent::WindowChanged(outgoing.conversation_id.clone()));
        self.deliver(local_id.to_string(), outgoing).await
    }

    pub async fn discard_pending(&self, local_id: &str) -> SyncResult<()> {
        let conversation_id = {
            let mut state = self.state.lock().await;
            state
                .windows
                .window_mut()
                .and_then(|window| window.take_pending(local_id))
                .map(|pending| pending.outgoing.conversation_id)
                .ok_or_else(|| SyncError::PendingNotFound(local_id.to_string()))?
        };
        self.emit(SyncEvent::WindowChanged(conversation_id));
        Ok(())
    }

    async fn deliver(&self, local_id: String, outgoing: OutgoingMessage) -> SyncResult<Message> {
        let conversation_id = outgoing.conversation_id.clone();
        let result = self.api.send_message(&outgoing).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(acked) => {
                if let Some(window) = state.windows.window_for(&conversation_id) {
                    reconciler::confirm_send(window, &local_id, acked.clone());
                }
                state
                    .recency
                    .touch_authoritative(&conversation_id, acked.created_at);
                drop(state);
                debug!(conversation_id = %conversation_id, message_id = %acked.id, "sync: send acknowledged");
                self.emit(SyncEvent::WindowChanged(conversation_id));
                self.emit(SyncEvent::ConversationsChanged);
                Ok(acked)
            }
            Err(err) => {
                if let Some(pending) = state
                    .windows
                    .window_for(&conversation_id)
                    .and_then(|window| window.pending_mut(&local_id))
                {
                    pending.state = PendingState::Failed(err.to_string());
                }
                drop(state);
                warn!(conversation_id = %conversation_id, local_id = %local_id, "sync: send failed: {err}");
                self.emit(SyncEvent::SendFailed {
                    conversation_id,
                    local_id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    pub async fn edit(&self, message_id: &MessageId, text: &str) -> SyncResult<Message> {
        self.ensure_live().await?;
        let edited = self.api.edit_message(message_id, text).await?;
        let outcome = {
            let mut state = self.state.lock().await;
            state
                .windows
                .window_for(&edited.conversation_id)
                .map(|window| reconciler::edit(window, edited.clone()))
        };
        if outcome == Some(ApplyOutcome::Applied) {
            self.emit(SyncEvent::WindowChanged(edited.conversation_id.clone()));
        }
        Ok(edited)
    }

    pub async fn delete(&self, message_id: &MessageId) -> SyncResult<()> {
        self.ensure_live().await?;
        self.api.delete_message(message_id).await?;
        let removed_from = {
            let mut state = self.state.lock().await;
            let current = state.windows.current().cloned();
            state
                .windows
                .window_mut()
                .filter(|window| window.contains(message_id))
                .map(|window| reconciler::delete(window, message_id))
                .and(current)
        };
        if let Some(conversation_id) = removed_from {
            self.emit(SyncEvent::WindowChanged(conversation_id));
        }
        Ok(())
    }

    /// Manual retry after the session gave up reconnecting.
    pub fn reconnect(&self) -> SyncResult<()> {
        self.session.reconnect()
    }

    pub async fn current(&self) -> Option<ConversationId> {
        self.state.lock().await.windows.current().cloned()
    }

    pub async fn window(&self) -> Option<WindowSnapshot> {
        let state = self.state.lock().await;
        let conversation_id = state.windows.current()?.clone();
        let window = state.windows.window()?;
        let pagination = state.windows.state()?.clone();
        let can_send = state
            .recency
            .summary(&conversation_id)
            .map_or(true, |summary| summary.can_send(&self.self_id));
        Some(WindowSnapshot {
            messages: window.messages().to_vec(),
            pending: window.pending().to_vec(),
            conversation_id,
            pagination,
            can_send,
        })
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.state.lock().await.recency.conversations()
    }

    pub async fn unread(&self) -> HashMap<ConversationId, UnreadEntry> {
        self.state.lock().await.read_state.unread().clone()
    }

    /// Logout: leaves the open conversation and closes the push session.
    pub async fn teardown(&self) {
        {
            let mut state = self.state.lock().await;
            state.ended.get_or_insert(Ended::TornDown);
            state.reset();
        }
        self.session.shutdown().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        info!(user_id = %self.self_id, "sync: torn down");
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
