//! Pure timeline merge.
//!
//! Every arrival (a history page, a socket push, an acknowledgement, a
//! local optimistic write) goes through [`merge`] or one of the
//! [`Timeline`] methods built on the same helpers. No I/O, no locks; the
//! caller serializes access.
//!
//! Rules:
//! - one entry per confirmed id; a repeated id only updates mutable fields
//!   (`is_read` flips to true, the offer moves forward, a pending attachment
//!   completes), the first write wins for body, timestamp and participants
//! - a confirmed message supersedes the provisional it references through
//!   `client_ref`, or failing that one from the same sender to the same
//!   receiver with the same body within the match window
//! - superseded and rolled-back provisional ids are retired and never come
//!   back
//! - entries are ordered by `(created_at, seq)`, `seq` being arrival order

use std::collections::HashSet;
use std::time::Duration;

use haggle_proto::message::{
    ConversationKey, Message, MessageId, ProvisionalId, Transition, UserId,
};

use crate::offer::merge_embedded;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: Message,
}

/// What a merge did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Messages that were not in the timeline before.
    pub inserted: usize,
    /// Existing messages whose mutable fields changed.
    pub updated: usize,
    /// Provisional messages replaced by their confirmation.
    pub superseded: Vec<ProvisionalId>,
    /// Malformed, misaddressed or retired records that were skipped.
    pub dropped: usize,
}

impl MergeReport {
    /// Whether the timeline changed at all.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0 || !self.superseded.is_empty()
    }
}

/// How [`Timeline::promote`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The provisional was replaced in place.
    Replaced,
    /// A push already delivered the confirmation; the provisional (if still
    /// present) was dropped and the confirmed entry updated.
    AlreadyConfirmed,
    /// The provisional was gone (discarded or rolled back); the confirmed
    /// message was inserted on its own.
    Inserted,
}

/// Ordered messages of one conversation.
#[derive(Debug, Clone)]
pub struct Timeline {
    key: ConversationKey,
    entries: Vec<Entry>,
    next_seq: u64,
    retired: HashSet<ProvisionalId>,
}

impl Timeline {
    /// An empty timeline for `key`.
    #[must_use]
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
            next_seq: 0,
            retired: HashSet::new(),
        }
    }

    /// The conversation this timeline belongs to.
    #[must_use]
    pub const fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Messages in display order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Owned copy of the messages in display order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest message, if any.
    #[must_use]
    pub fn newest(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|i| &self.entries[i].message)
    }

    /// Whether `id` was superseded or rolled back.
    #[must_use]
    pub fn is_retired(&self, id: ProvisionalId) -> bool {
        self.retired.contains(&id)
    }

    pub(crate) fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        let index = self.position(id)?;
        Some(&mut self.entries[index].message)
    }

    /// The message carrying the offer for `order_id`.
    pub(crate) fn find_order_mut(&mut self, order_id: &str) -> Option<&mut Message> {
        self.entries
            .iter_mut()
            .map(|e| &mut e.message)
            .find(|m| m.order_id() == Some(order_id))
    }

    /// Unread messages addressed to `me`.
    #[must_use]
    pub fn unread_for(&self, me: &UserId) -> usize {
        self.messages()
            .filter(|m| !m.is_read && m.receiver_id == *me)
            .count()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == *id)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn push(&mut self, message: Message) {
        let seq = self.next_seq();
        self.entries.push(Entry { seq, message });
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|e| (e.message.created_at, e.seq));
    }

    /// Insert a local optimistic message.
    ///
    /// Returns `false` (and changes nothing) for a confirmed id, a retired
    /// id, or an id already present.
    pub fn insert_provisional(&mut self, message: Message) -> bool {
        let MessageId::Provisional(id) = message.id else {
            return false;
        };
        if self.retired.contains(&id) || self.position(&message.id).is_some() {
            return false;
        }
        self.push(message);
        self.sort();
        true
    }

    /// Replace provisional `id` with its acknowledged confirmation.
    pub fn promote(&mut self, id: ProvisionalId, mut confirmed: Message) -> Promotion {
        confirmed.client_ref.get_or_insert(id);
        self.retired.insert(id);
        let provisional = self.position(&MessageId::Provisional(id));

        let outcome = if let Some(existing) = self.position(&confirmed.id) {
            merge_mutable(&mut self.entries[existing].message, &confirmed);
            if let Some(index) = provisional {
                self.entries.remove(index);
            }
            Promotion::AlreadyConfirmed
        } else if let Some(index) = provisional {
            replace_in_slot(&mut self.entries[index].message, confirmed);
            Promotion::Replaced
        } else {
            self.push(confirmed);
            Promotion::Inserted
        };
        self.sort();
        outcome
    }

    /// Remove provisional `id` (failed send) and retire it.
    pub fn remove_provisional(&mut self, id: ProvisionalId) -> Option<Message> {
        self.retired.insert(id);
        let index = self.position(&MessageId::Provisional(id))?;
        Some(self.entries.remove(index).message)
    }

    /// Index of the provisional a confirmed message supersedes, if any.
    fn superseded_by(&self, confirmed: &Message, match_window: Duration) -> Option<usize> {
        if let Some(reference) = confirmed.client_ref {
            if let Some(index) = self.position(&MessageId::Provisional(reference)) {
                return Some(index);
            }
        }
        let window = u64::try_from(match_window.as_millis()).unwrap_or(u64::MAX);
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                let m = &e.message;
                m.id.is_provisional()
                    && m.sender_id == confirmed.sender_id
                    && m.receiver_id == confirmed.receiver_id
                    && m.body == confirmed.body
                    && m.created_at.abs_diff(confirmed.created_at) <= window
            })
            .min_by_key(|(_, e)| (e.message.created_at.abs_diff(confirmed.created_at), e.seq))
            .map(|(index, _)| index)
    }
}

/// Merge `incoming` into `timeline`. Idempotent: merging the same records
/// again reports no change.
pub fn merge(
    timeline: &mut Timeline,
    incoming: Vec<Message>,
    match_window: Duration,
) -> MergeReport {
    let mut report = MergeReport::default();

    for message in incoming {
        if message.conversation_key != timeline.key {
            tracing::warn!(
                id = %message.id,
                expected = %timeline.key,
                actual = %message.conversation_key,
                "message for another conversation dropped"
            );
            report.dropped += 1;
            continue;
        }

        match message.id.clone() {
            MessageId::Provisional(id) => {
                if timeline.retired.contains(&id) {
                    tracing::debug!(%id, "retired provisional id not reinserted");
                    report.dropped += 1;
                } else if let Some(index) = timeline.position(&message.id) {
                    if merge_mutable(&mut timeline.entries[index].message, &message) {
                        report.updated += 1;
                    }
                } else {
                    timeline.push(message);
                    report.inserted += 1;
                }
            }
            MessageId::Confirmed(raw) if raw.trim().is_empty() => {
                tracing::warn!(sender = %message.sender_id, "message with blank id dropped");
                report.dropped += 1;
            }
            MessageId::Confirmed(_) => {
                merge_confirmed(timeline, message, match_window, &mut report);
            }
        }
    }

    timeline.sort();
    report
}

fn merge_confirmed(
    timeline: &mut Timeline,
    message: Message,
    match_window: Duration,
    report: &mut MergeReport,
) {
    if let Some(index) = timeline.position(&message.id) {
        if merge_mutable(&mut timeline.entries[index].message, &message) {
            report.updated += 1;
        }
        // The ack and the push can both carry the confirmation; whichever
        // lands second still has to clear a provisional left behind.
        if let Some(reference) = message.client_ref {
            if let Some(stale) = timeline.position(&MessageId::Provisional(reference)) {
                timeline.entries.remove(stale);
                timeline.retired.insert(reference);
                report.superseded.push(reference);
            }
        }
        return;
    }

    if let Some(index) = timeline.superseded_by(&message, match_window) {
        let slot = &mut timeline.entries[index].message;
        if let MessageId::Provisional(id) = slot.id {
            timeline.retired.insert(id);
            report.superseded.push(id);
        }
        replace_in_slot(slot, message);
        return;
    }

    timeline.push(message);
    report.inserted += 1;
}

/// Swap a provisional for its confirmation, keeping the local attachment if
/// the server did not echo one.
fn replace_in_slot(slot: &mut Message, mut confirmed: Message) {
    if confirmed.attachment.is_none() {
        confirmed.attachment = slot.attachment.take();
    }
    if let MessageId::Provisional(id) = slot.id {
        confirmed.client_ref.get_or_insert(id);
    }
    *slot = confirmed;
}

/// Merge the mutable fields of `incoming` into `existing`. Returns whether
/// anything changed.
fn merge_mutable(existing: &mut Message, incoming: &Message) -> bool {
    let mut changed = false;

    if incoming.is_read && !existing.is_read {
        existing.is_read = true;
        changed = true;
    }

    if let Some(offer) = &incoming.offer {
        if merge_embedded(&mut existing.offer, offer) == Transition::Applied {
            changed = true;
        }
    }

    match (&mut existing.attachment, &incoming.attachment) {
        (Some(local), Some(remote)) if local.pending && !remote.pending => {
            *local = remote.clone();
            changed = true;
        }
        (None, Some(remote)) => {
            existing.attachment = Some(remote.clone());
            changed = true;
        }
        _ => {}
    }

    if existing.conversation_id.is_none() && incoming.conversation_id.is_some() {
        existing.conversation_id.clone_from(&incoming.conversation_id);
        changed = true;
    }
    if existing.client_ref.is_none() && incoming.client_ref.is_some() {
        existing.client_ref = incoming.client_ref;
    }

    changed
}
