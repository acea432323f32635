//! Merge rules for live events against the open conversation's window.
//!
//! Every rule is idempotent: applying an event a second time reports
//! `Duplicate` and leaves the window as the first application left it.

use shared::{
    domain::{MessageId, UserId},
    protocol::{Message, PushEvent, ReadReceipt},
};
use tracing::debug;

use crate::window::{DeferredChange, MessageWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    /// Older than what the window already holds (last-writer-wins).
    Stale,
    /// Target message is not loaded; the change was buffered.
    NotInWindow,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        self == Self::Applied
    }
}

/// Who is reading: the local user and, for direct conversations, the peer.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptContext<'a> {
    pub self_id: &'a UserId,
    pub counterpart: Option<&'a UserId>,
}

impl ReceiptContext<'_> {
    fn counts_as_reader(&self, reader: &UserId) -> bool {
        match self.counterpart {
            Some(counterpart) => reader == counterpart,
            None => reader != self.self_id,
        }
    }
}

pub fn apply(window: &mut MessageWindow, event: &PushEvent, ctx: ReceiptContext<'_>) -> ApplyOutcome {
    let outcome = match event {
        PushEvent::MessageNew(message) => insert(window, message.clone()),
        PushEvent::MessageEdit(message) => edit(window, message.clone()),
        PushEvent::MessageDelete(deleted) => delete(window, &deleted.id),
        PushEvent::MessageRead(receipt) => mark_read(window, receipt, ctx),
        PushEvent::UnreadUpdate(update) => match &update.message {
            Some(message) => insert(window, message.clone()),
            None => ApplyOutcome::Duplicate,
        },
    };
    if outcome == ApplyOutcome::Duplicate {
        debug!(conversation_id = %event.conversation_id(), "reconciler: event already reflected");
    }
    outcome
}

pub fn insert(window: &mut MessageWindow, message: Message) -> ApplyOutcome {
    if window.insert_sorted(message) {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Duplicate
    }
}

pub fn edit(window: &mut MessageWindow, incoming: Message) -> ApplyOutcome {
    let Some(existing) = window.get_mut(&incoming.id) else {
        window.defer(DeferredChange::Edit(incoming));
        return ApplyOutcome::NotInWindow;
    };
    if incoming.last_write_at() < existing.last_write_at() {
        return ApplyOutcome::Stale;
    }

    let mut merged = existing.clone();
    merged.kind = incoming.kind;
    merged.text = incoming.text;
    merged.attachment = incoming.attachment;
    merged.updated_at = incoming.updated_at.or(merged.updated_at);
    merged.edited = true;
    merged.read = merged.read || incoming.read;
    if &merged == existing {
        return ApplyOutcome::Duplicate;
    }
    *existing = merged;
    ApplyOutcome::Applied
}

pub fn delete(window: &mut MessageWindow, id: &MessageId) -> ApplyOutcome {
    match window.remove(id) {
        Some(_) => {
            window.drop_deferred(id);
            ApplyOutcome::Applied
        }
        None => {
            window.defer(DeferredChange::Delete(id.clone()));
            ApplyOutcome::NotInWindow
        }
    }
}

/// Marks own messages named in the receipt as read. Empty receipts change nothing.
pub fn mark_read(
    window: &mut MessageWindow,
    receipt: &ReadReceipt,
    ctx: ReceiptContext<'_>,
) -> ApplyOutcome {
    if receipt.message_ids.is_empty() || !ctx.counts_as_reader(&receipt.reader) {
        return ApplyOutcome::Duplicate;
    }
    let mut changed = false;
    for message in window.messages_mut() {
        if message.is_from(ctx.self_id) && !message.read && receipt.message_ids.contains(&message.id)
        {
            message.read = true;
            changed = true;
        }
    }
    if changed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Duplicate
    }
}

/// Replaces the optimistic entry with the server's copy.
pub fn confirm_send(window: &mut MessageWindow, local_id: &str, acked: Message) -> ApplyOutcome {
    if window.take_pending(local_id).is_none() {
        debug!(local_id, "reconciler: ack for unknown pending send");
    }
    insert(window, acked)
}

pub(crate) fn apply_deferred(window: &mut MessageWindow, change: DeferredChange) {
    let outcome = match change {
        DeferredChange::Edit(message) => edit(window, message),
        DeferredChange::Delete(id) => delete(window, &id),
    };
    debug!(?outcome, "reconciler: replayed buffered change");
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
