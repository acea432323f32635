use std::{cmp::Ordering, collections::VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{HistoryPage, Message},
};
use tracing::debug;

use crate::{api::OutgoingMessage, reconciler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    Sending,
    Failed(String),
}

/// A locally composed message that the server has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub local_id: String,
    pub outgoing: OutgoingMessage,
    pub optimistic_at: DateTime<Utc>,
    pub state: PendingState,
}

/// Edits and deletes that arrived before the message they target was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredChange {
    Edit(Message),
    Delete(MessageId),
}

impl DeferredChange {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Edit(message) => &message.id,
            Self::Delete(id) => id,
        }
    }
}

fn order(a: &Message, b: &Message) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.as_str().cmp(b.id.as_str()))
}

/// Loaded history for one open conversation, ascending by `(created_at, id)` with unique ids.
#[derive(Debug, Clone, Default)]
pub struct MessageWindow {
    messages: Vec<Message>,
    pending: Vec<PendingSend>,
    deferred: VecDeque<DeferredChange>,
    deferred_limit: usize,
}

impl MessageWindow {
    pub fn new(deferred_limit: usize) -> Self {
        Self {
            deferred_limit,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_id(&self) -> Option<&MessageId> {
        self.messages.first().map(|message| &message.id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    pub(crate) fn messages_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }

    /// Inserts at the sorted position. Returns false if the id is already present.
    pub(crate) fn insert_sorted(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|existing| order(existing, &message) == Ordering::Less);
        self.messages.insert(at, message);
        true
    }

    pub(crate) fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let at = self.messages.iter().position(|message| &message.id == id)?;
        Some(self.messages.remove(at))
    }

    pub fn pending(&self) -> &[PendingSend] {
        &self.pending
    }

    pub(crate) fn push_pending(&mut self, pending: PendingSend) {
        self.pending.push(pending);
    }

    pub(crate) fn pending_mut(&mut self, local_id: &str) -> Option<&mut PendingSend> {
        self.pending
            .iter_mut()
            .find(|pending| pending.local_id == local_id)
    }

    pub(crate) fn take_pending(&mut self, local_id: &str) -> Option<PendingSend> {
        let at = self
            .pending
            .iter()
            .position(|pending| pending.local_id == local_id)?;
        Some(self.pending.remove(at))
    }

    pub fn deferred(&self) -> impl Iterator<Item = &DeferredChange> {
        self.deferred.iter()
    }

    /// Buffers a change for a message outside the window. A delete supersedes any
    /// buffered edit; a newer edit replaces an older one.
    pub(crate) fn defer(&mut self, change: DeferredChange) {
        if self.deferred_limit == 0 {
            return;
        }
        let id = change.message_id().clone();
        if let Some(existing) = self.deferred.iter_mut().find(|c| c.message_id() == &id) {
            let replace = match (&*existing, &change) {
                (DeferredChange::Delete(_), _) => false,
                (DeferredChange::Edit(old), DeferredChange::Edit(new)) => {
                    new.last_write_at() >= old.last_write_at()
                }
                (DeferredChange::Edit(_), DeferredChange::Delete(_)) => true,
            };
            if replace {
                *existing = change;
            }
            return;
        }
        if self.deferred.len() >= self.deferred_limit {
            if let Some(evicted) = self.deferred.pop_front() {
                debug!(message_id = %evicted.message_id(), "window: evicting buffered change");
            }
        }
        self.deferred.push_back(change);
    }

    pub(crate) fn drop_deferred(&mut self, id: &MessageId) {
        self.deferred.retain(|change| change.message_id() != id);
    }

    /// Removes and returns buffered changes whose target is now loaded.
    pub(crate) fn take_resolvable(&mut self) -> Vec<DeferredChange> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|change| self.contains(change.message_id()));
        self.deferred = waiting.into();
        ready
    }
}

/// Identifies one page request. Responses whose ticket no longer matches are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub conversation_id: ConversationId,
    pub generation: u64,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    Loading(FetchTicket),
    Exhausted,
}

/// Where the reader was before older messages were prepended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollAnchor {
    pub first_before: Option<MessageId>,
    pub inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Stale,
    Loaded {
        page: u32,
        anchor: ScrollAnchor,
        exhausted: bool,
    },
}

#[derive(Debug)]
struct OpenWindow {
    conversation_id: ConversationId,
    generation: u64,
    pages_loaded: u32,
    state: PaginationState,
    window: MessageWindow,
}

/// Owns the window of the currently open conversation and its backward pagination.
#[derive(Debug)]
pub struct PaginationWindowManager {
    page_size: u32,
    deferred_limit: usize,
    generation: u64,
    open: Option<OpenWindow>,
}

impl PaginationWindowManager {
    pub fn new(page_size: u32, deferred_limit: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            deferred_limit,
            generation: 0,
            open: None,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Resets to an empty window and returns the ticket for page 1.
    pub fn open(&mut self, conversation_id: ConversationId) -> FetchTicket {
        self.generation += 1;
        let ticket = FetchTicket {
            conversation_id: conversation_id.clone(),
            generation: self.generation,
            page: 1,
        };
        self.open = Some(OpenWindow {
            conversation_id,
            generation: self.generation,
            pages_loaded: 0,
            state: PaginationState::Loading(ticket.clone()),
            window: MessageWindow::new(self.deferred_limit),
        });
        ticket
    }

    pub fn close(&mut self) -> Option<ConversationId> {
        self.open.take().map(|open| open.conversation_id)
    }

    pub fn current(&self) -> Option<&ConversationId> {
        self.open.as_ref().map(|open| &open.conversation_id)
    }

    pub fn generation(&self) -> Option<u64> {
        self.open.as_ref().map(|open| open.generation)
    }

    pub fn is_current(&self, conversation_id: &ConversationId, generation: u64) -> bool {
        self.open.as_ref().is_some_and(|open| {
            &open.conversation_id == conversation_id && open.generation == generation
        })
    }

    pub fn state(&self) -> Option<&PaginationState> {
        self.open.as_ref().map(|open| &open.state)
    }

    pub fn pages_loaded(&self) -> u32 {
        self.open.as_ref().map_or(0, |open| open.pages_loaded)
    }

    pub fn window(&self) -> Option<&MessageWindow> {
        self.open.as_ref().map(|open| &open.window)
    }

    pub fn window_mut(&mut self) -> Option<&mut MessageWindow> {
        self.open.as_mut().map(|open| &mut open.window)
    }

    /// Window of `conversation_id` if it is the one currently open.
    pub fn window_for(&mut self, conversation_id: &ConversationId) -> Option<&mut MessageWindow> {
        self.open
            .as_mut()
            .filter(|open| &open.conversation_id == conversation_id)
            .map(|open| &mut open.window)
    }

    /// Ticket for the next older page, or `None` while a fetch is in flight or history is exhausted.
    pub fn begin_load_older(&mut self) -> Option<FetchTicket> {
        let open = self.open.as_mut()?;
        if open.state != PaginationState::Idle {
            return None;
        }
        let ticket = FetchTicket {
            conversation_id: open.conversation_id.clone(),
            generation: open.generation,
            page: open.pages_loaded + 1,
        };
        open.state = PaginationState::Loading(ticket.clone());
        Some(ticket)
    }

    /// Whether a scroll offset this close to the top edge should start a backward fetch.
    pub fn should_trigger(&self, offset_from_top_px: f32, threshold_px: f32) -> bool {
        offset_from_top_px <= threshold_px
            && matches!(self.state(), Some(PaginationState::Idle))
    }

    fn loading(&mut self, ticket: &FetchTicket) -> Option<&mut OpenWindow> {
        self.open
            .as_mut()
            .filter(|open| matches!(&open.state, PaginationState::Loading(current) if current == ticket))
    }

    /// Applies a fetched page. Existing messages keep their relative order; older ones go before them.
    pub fn complete(&mut self, ticket: &FetchTicket, page: HistoryPage) -> PageOutcome {
        let Some(open) = self.loading(ticket) else {
            debug!(
                conversation_id = %ticket.conversation_id,
                page = ticket.page,
                "window: discarding stale page"
            );
            return PageOutcome::Stale;
        };

        let first_before = open.window.first_id().cloned();
        let exhausted = !page.pagination.has_more || page.messages.is_empty();
        let mut inserted = 0;
        for message in page.messages {
            if message.conversation_id != open.conversation_id {
                debug!(message_id = %message.id, "window: page entry for another conversation");
                continue;
            }
            if open.window.insert_sorted(message) {
                inserted += 1;
            }
        }
        for change in open.window.take_resolvable() {
            reconciler::apply_deferred(&mut open.window, change);
        }

        open.pages_loaded = ticket.page;
        open.state = if exhausted {
            PaginationState::Exhausted
        } else {
            PaginationState::Idle
        };
        debug!(
            conversation_id = %ticket.conversation_id,
            page = ticket.page,
            inserted,
            exhausted,
            "window: page applied"
        );

        PageOutcome::Loaded {
            page: ticket.page,
            anchor: ScrollAnchor {
                first_before,
                inserted,
            },
            exhausted,
        }
    }

    /// Releases the in-flight guard after a failed fetch. The page counter is left as is.
    pub fn fail(&mut self, ticket: &FetchTicket) -> bool {
        match self.loading(ticket) {
            Some(open) => {
                open.state = PaginationState::Idle;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/window_tests.rs"]
mod tests;
