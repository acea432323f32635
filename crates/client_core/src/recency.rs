use chrono::{DateTime, Utc};
use shared::{domain::ConversationId, protocol::ConversationSummary};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecencyEntry {
    pub summary: ConversationSummary,
    /// Local send time shown until the server's timestamp for it is seen.
    pub optimistic_at: Option<DateTime<Utc>>,
}

impl RecencyEntry {
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.optimistic_at.or(self.summary.last_activity_at)
    }
}

/// Conversation list, most recently active first.
#[derive(Debug, Default)]
pub struct RecencyIndex {
    entries: Vec<RecencyEntry>,
}

impl RecencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the list and sorts it once, newest first. Undated conversations go last.
    pub fn load(&mut self, mut summaries: Vec<ConversationSummary>) {
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        self.entries = summaries
            .into_iter()
            .map(|summary| RecencyEntry {
                summary,
                optimistic_at: None,
            })
            .collect();
    }

    pub fn entries(&self) -> &[RecencyEntry] {
        &self.entries
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.entries
            .iter()
            .map(|entry| {
                let mut summary = entry.summary.clone();
                summary.last_activity_at = entry.last_activity_at();
                summary
            })
            .collect()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&RecencyEntry> {
        self.entries
            .iter()
            .find(|entry| &entry.summary.id == conversation_id)
    }

    pub fn summary(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.get(conversation_id).map(|entry| &entry.summary)
    }

    pub fn position(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| &entry.summary.id == conversation_id)
    }

    /// Records a server timestamp. Older stamps are ignored; equal or newer ones move to the head.
    pub fn touch_authoritative(&mut self, conversation_id: &ConversationId, at: DateTime<Utc>) -> bool {
        let Some(index) = self.position(conversation_id) else {
            self.insert_placeholder(conversation_id, at);
            return true;
        };
        let entry = &mut self.entries[index];
        if entry.summary.last_activity_at.is_some_and(|stored| at < stored) {
            debug!(conversation_id = %conversation_id, "recency: ignoring older timestamp");
            return false;
        }
        entry.summary.last_activity_at = Some(at);
        entry.optimistic_at = None;
        self.move_to_head(index);
        true
    }

    /// Records a local, unacknowledged send time.
    pub fn touch_optimistic(&mut self, conversation_id: &ConversationId, at: DateTime<Utc>) -> bool {
        let Some(index) = self.position(conversation_id) else {
            self.insert_placeholder(conversation_id, at);
            if let Some(head) = self.entries.first_mut() {
                head.summary.last_activity_at = None;
                head.optimistic_at = Some(at);
            }
            return true;
        };
        let entry = &mut self.entries[index];
        if entry.last_activity_at().is_some_and(|stored| at < stored) {
            return false;
        }
        entry.optimistic_at = Some(at);
        self.move_to_head(index);
        true
    }

    fn insert_placeholder(&mut self, conversation_id: &ConversationId, at: DateTime<Utc>) {
        debug!(conversation_id = %conversation_id, "recency: placeholder for unknown conversation");
        self.entries.insert(
            0,
            RecencyEntry {
                summary: ConversationSummary::placeholder(conversation_id.clone(), at),
                optimistic_at: None,
            },
        );
    }

    fn move_to_head(&mut self, index: usize) {
        if index > 0 {
            let entry = self.entries.remove(index);
            self.entries.insert(0, entry);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
