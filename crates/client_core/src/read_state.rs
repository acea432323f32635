use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::UnreadSnapshot,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadEntry {
    pub has_unread: bool,
    pub last_sender_id: UserId,
}

/// A fire-and-forget acknowledgement the caller should send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkReadAction {
    pub conversation_id: ConversationId,
    /// Peer whose messages are being acknowledged.
    pub receiver_id: UserId,
}

/// Unread markers per conversation. An entry exists only while the latest inbound
/// event came from a peer and the conversation is not open.
#[derive(Debug)]
pub struct ReadStateTracker {
    self_id: UserId,
    open: Option<ConversationId>,
    unread: HashMap<ConversationId, UnreadEntry>,
    acknowledged: HashSet<(ConversationId, MessageId)>,
}

impl ReadStateTracker {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            open: None,
            unread: HashMap::new(),
            acknowledged: HashSet::new(),
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Replaces the unread map with the server snapshot, minus entries the local user caused.
    pub fn load_snapshot(&mut self, snapshot: UnreadSnapshot) {
        self.unread.clear();
        for (key, entry) in snapshot {
            if entry.sender_id == self.self_id {
                continue;
            }
            let conversation_id = entry
                .conversation_id
                .unwrap_or_else(|| ConversationId::new(key));
            if self.open.as_ref() == Some(&conversation_id) {
                continue;
            }
            self.unread.insert(
                conversation_id,
                UnreadEntry {
                    has_unread: true,
                    last_sender_id: entry.sender_id,
                },
            );
        }
        debug!(entries = self.unread.len(), "read_state: snapshot loaded");
    }

    /// Records an inbound message. Returns a mark-read action when the conversation is open.
    pub fn on_inbound(
        &mut self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        message_id: Option<&MessageId>,
    ) -> Option<MarkReadAction> {
        if sender_id == &self.self_id {
            self.unread.remove(conversation_id);
            return None;
        }

        if self.open.as_ref() != Some(conversation_id) {
            self.unread.insert(
                conversation_id.clone(),
                UnreadEntry {
                    has_unread: true,
                    last_sender_id: sender_id.clone(),
                },
            );
            return None;
        }

        self.unread.remove(conversation_id);
        if let Some(message_id) = message_id {
            let key = (conversation_id.clone(), message_id.clone());
            if !self.acknowledged.insert(key) {
                debug!(conversation_id = %conversation_id, message_id = %message_id, "read_state: already acknowledged");
                return None;
            }
        }
        Some(MarkReadAction {
            conversation_id: conversation_id.clone(),
            receiver_id: sender_id.clone(),
        })
    }

    pub fn open(&mut self, conversation_id: &ConversationId) {
        self.unread.remove(conversation_id);
        self.open = Some(conversation_id.clone());
    }

    pub fn close(&mut self, conversation_id: &ConversationId) {
        if self.open.as_ref() == Some(conversation_id) {
            self.open = None;
            self.acknowledged
                .retain(|(acked_in, _)| acked_in != conversation_id);
        }
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn unread(&self) -> &HashMap<ConversationId, UnreadEntry> {
        &self.unread
    }

    pub fn has_unread(&self, conversation_id: &ConversationId) -> bool {
        self.unread
            .get(conversation_id)
            .is_some_and(|entry| entry.has_unread)
    }

    pub fn clear(&mut self) {
        self.open = None;
        self.unread.clear();
        self.acknowledged.clear();
    }
}
