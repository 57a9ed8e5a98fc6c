//! Message timeline store.
//!
//! Holds one [`Timeline`] per open conversation and is the only place that
//! mutates them. Every operation takes the store lock, runs the synchronous
//! merge to completion and releases it, so merges for a conversation never
//! interleave. Subscribers get a [`TimelineChange`] after every mutation.
//!
//! Offer updates for messages that are not loaded yet are parked in a
//! [`PendingOffers`] buffer and replayed inside the merge that brings the
//! message in.

pub mod merge;

use std::collections::HashMap;

use tokio::sync::broadcast;

use haggle_proto::message::{
    Attachment, ConversationKey, Message, MessageId, ProvisionalId, Transition, UserId,
};

use crate::config::{OfferBufferConfig, TimelineConfig};
use crate::offer::{OfferUpdate, PendingOffers, merge_offer};

pub use merge::{MergeReport, Promotion, Timeline};

/// Capacity of the change channel.
const CHANGE_BUFFER: usize = 256;

/// Which operation produced a [`TimelineChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A batch from history or a push was merged.
    Merged,
    /// A local optimistic message was added.
    Provisional,
    /// A provisional message was replaced by its confirmation.
    Promoted,
    /// A failed send was removed.
    RolledBack,
    /// An upload finished for a provisional message.
    Attachment,
    /// Messages were marked read locally.
    Read,
    /// An offer changed.
    Offer,
    /// The timeline was torn down.
    Discarded,
}

/// Snapshot of a conversation after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineChange {
    /// Conversation that changed.
    pub key: ConversationKey,
    /// What happened.
    pub kind: ChangeKind,
    /// Newest message after the change.
    pub newest: Option<Message>,
    /// Unread messages addressed to the local user.
    pub unread: usize,
    /// Number of messages.
    pub len: usize,
}

/// Result of [`TimelineStore::apply_offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The offer changed in this conversation.
    Applied(ConversationKey),
    /// The offer already had these values.
    Unchanged(ConversationKey),
    /// A terminal offer refused a conflicting update.
    Ignored(ConversationKey),
    /// The carrying message is not loaded; the update was parked.
    Parked,
}

struct StoreState {
    timelines: HashMap<ConversationKey, Timeline>,
    pending_offers: PendingOffers,
}

impl StoreState {
    fn timeline_mut(&mut self, key: &ConversationKey) -> &mut Timeline {
        self.timelines
            .entry(key.clone())
            .or_insert_with(|| Timeline::new(key.clone()))
    }

    /// Apply parked offer updates whose message is now in `key`'s timeline.
    fn replay_offers(&mut self, key: &ConversationKey) -> usize {
        let Some(timeline) = self.timelines.get_mut(key) else {
            return 0;
        };
        let mut replayed = 0;
        for order_id in self.pending_offers.order_ids() {
            let Some(message) = timeline.find_order_mut(&order_id) else {
                continue;
            };
            let Some(update) = self.pending_offers.take(&order_id) else {
                continue;
            };
            if let Some(offer) = message.offer.as_mut() {
                if merge_offer(offer, &update) == Transition::Applied {
                    replayed += 1;
                }
                tracing::debug!(
                    order_id = %order_id,
                    key = %key,
                    "replayed parked offer update"
                );
            }
        }
        replayed
    }
}

/// Per-conversation timelines plus the parked offer buffer.
pub struct TimelineStore {
    me: UserId,
    config: TimelineConfig,
    state: parking_lot::Mutex<StoreState>,
    changes: broadcast::Sender<TimelineChange>,
}

impl std::fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TimelineStore")
            .field("me", &self.me)
            .field("timelines", &state.timelines.len())
            .field("parked_offers", &state.pending_offers.len())
            .finish()
    }
}

impl TimelineStore {
    /// Creates an empty store for user `me`.
    #[must_use]
    pub fn new(me: UserId, config: TimelineConfig, offers: OfferBufferConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            me,
            config,
            state: parking_lot::Mutex::new(StoreState {
                timelines: HashMap::new(),
                pending_offers: PendingOffers::new(offers),
            }),
            changes,
        }
    }

    /// The local user.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineChange> {
        self.changes.subscribe()
    }

    fn notify(&self, timeline: &Timeline, kind: ChangeKind) {
        let _ = self.changes.send(TimelineChange {
            key: timeline.key().clone(),
            kind,
            newest: timeline.newest().cloned(),
            unread: timeline.unread_for(&self.me),
            len: timeline.len(),
        });
    }

    /// Merge a batch from one source into `key`'s timeline.
    ///
    /// Creates the timeline if needed and replays any parked offer updates
    /// the batch makes resolvable, all under one lock.
    pub fn merge(&self, key: &ConversationKey, incoming: Vec<Message>) -> MergeReport {
        let mut state = self.state.lock();
        let report = merge::merge(state.timeline_mut(key), incoming, self.config.match_window);
        let replayed = state.replay_offers(key);
        if report.dropped > 0 {
            tracing::debug!(key = %key, dropped = report.dropped, "merge skipped records");
        }
        if report.changed() || replayed > 0 {
            if let Some(timeline) = state.timelines.get(key) {
                self.notify(timeline, ChangeKind::Merged);
            }
        }
        report
    }

    /// Add a local optimistic message. Returns `false` if it was refused
    /// (retired or duplicate id).
    pub fn insert_provisional(&self, message: Message) -> bool {
        let key = message.conversation_key.clone();
        let mut state = self.state.lock();
        let timeline = state.timeline_mut(&key);
        let inserted = timeline.insert_provisional(message);
        if inserted {
            self.notify(timeline, ChangeKind::Provisional);
        }
        inserted
    }

    /// Replace provisional `id` with the acknowledged `confirmed` message.
    pub fn promote(&self, id: ProvisionalId, confirmed: Message) -> Promotion {
        let key = confirmed.conversation_key.clone();
        let mut state = self.state.lock();
        let outcome = state.timeline_mut(&key).promote(id, confirmed);
        state.replay_offers(&key);
        if let Some(timeline) = state.timelines.get(&key) {
            self.notify(timeline, ChangeKind::Promoted);
        }
        tracing::debug!(%id, key = %key, ?outcome, "provisional promoted");
        outcome
    }

    /// Remove provisional `id` after a failed send.
    pub fn rollback(&self, key: &ConversationKey, id: ProvisionalId) -> Option<Message> {
        let mut state = self.state.lock();
        let timeline = state.timelines.get_mut(key)?;
        let removed = timeline.remove_provisional(id);
        if removed.is_some() {
            self.notify(timeline, ChangeKind::RolledBack);
        }
        removed
    }

    /// Fill in the uploaded attachment of provisional `id`.
    ///
    /// Returns `false` if the message is no longer provisional (or gone).
    pub fn set_attachment(
        &self,
        key: &ConversationKey,
        id: ProvisionalId,
        attachment: Attachment,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(timeline) = state.timelines.get_mut(key) else {
            return false;
        };
        let Some(message) = timeline.get_mut(&MessageId::Provisional(id)) else {
            return false;
        };
        message.attachment = Some(attachment);
        self.notify(timeline, ChangeKind::Attachment);
        true
    }

    /// Flip `is_read` on every message addressed to the local user in `key`.
    /// Returns how many changed.
    pub fn mark_read(&self, key: &ConversationKey) -> usize {
        let mut state = self.state.lock();
        let Some(timeline) = state.timelines.get_mut(key) else {
            return 0;
        };
        let unread: Vec<MessageId> = timeline
            .messages()
            .filter(|m| !m.is_read && m.receiver_id == self.me)
            .map(|m| m.id.clone())
            .collect();
        for id in &unread {
            if let Some(message) = timeline.get_mut(id) {
                message.is_read = true;
            }
        }
        if !unread.is_empty() {
            self.notify(timeline, ChangeKind::Read);
        }
        unread.len()
    }

    /// Apply a normalized offer update to whichever timeline holds the
    /// offer, or park it until that message arrives.
    pub fn apply_offer(&self, update: OfferUpdate) -> OfferOutcome {
        let mut state = self.state.lock();
        let by_id = update.message_id.as_deref().map(MessageId::from_wire);

        for timeline in state.timelines.values_mut() {
            let key = timeline.key().clone();
            let named = by_id.as_ref().is_some_and(|id| {
                timeline
                    .get(id)
                    .is_some_and(|m| m.order_id() == Some(update.order_id.as_str()))
            });
            let message = if named {
                by_id.as_ref().and_then(|id| timeline.get_mut(id))
            } else {
                timeline.find_order_mut(&update.order_id)
            };
            let Some(offer) = message.and_then(|m| m.offer.as_mut()) else {
                continue;
            };

            return match merge_offer(offer, &update) {
                Transition::Applied => {
                    tracing::debug!(
                        order_id = %update.order_id,
                        source = ?update.source,
                        "offer updated"
                    );
                    self.notify(timeline, ChangeKind::Offer);
                    OfferOutcome::Applied(key)
                }
                Transition::Unchanged => OfferOutcome::Unchanged(key),
                Transition::Ignored => OfferOutcome::Ignored(key),
            };
        }

        state.pending_offers.hold(update);
        OfferOutcome::Parked
    }

    /// Messages of `key` in display order (empty if not loaded).
    #[must_use]
    pub fn timeline(&self, key: &ConversationKey) -> Vec<Message> {
        self.state
            .lock()
            .timelines
            .get(key)
            .map(Timeline::to_vec)
            .unwrap_or_default()
    }

    /// Whether `key` has a timeline.
    #[must_use]
    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.state.lock().timelines.contains_key(key)
    }

    /// Number of parked offer updates.
    #[must_use]
    pub fn parked_offers(&self) -> usize {
        self.state.lock().pending_offers.len()
    }

    /// Tear down every timeline except `keep` that holds no provisional
    /// message. Returns how many were dropped.
    ///
    /// Pushes for conversations that are not open still land in the store so
    /// the directory sees them; this releases them once they are idle.
    pub fn discard_idle(&self, keep: &ConversationKey) -> usize {
        let idle: Vec<ConversationKey> = {
            let mut state = self.state.lock();
            let idle: Vec<ConversationKey> = state
                .timelines
                .values()
                .filter(|t| t.key() != keep && !t.messages().any(|m| m.id.is_provisional()))
                .map(|t| t.key().clone())
                .collect();
            for key in &idle {
                state.timelines.remove(key);
            }
            idle
        };
        for key in &idle {
            let _ = self.changes.send(TimelineChange {
                key: key.clone(),
                kind: ChangeKind::Discarded,
                newest: None,
                unread: 0,
                len: 0,
            });
        }
        if !idle.is_empty() {
            tracing::debug!(kept = %keep, dropped = idle.len(), "idle timelines discarded");
        }
        idle.len()
    }

    /// Tear down `key`'s timeline (navigation away).
    ///
    /// In-flight sends for it still resolve; their promotion re-creates a
    /// timeline holding only the confirmed message.
    pub fn discard(&self, key: &ConversationKey) -> bool {
        let removed = self.state.lock().timelines.remove(key);
        match removed {
            Some(timeline) => {
                let _ = self.changes.send(TimelineChange {
                    key: key.clone(),
                    kind: ChangeKind::Discarded,
                    newest: None,
                    unread: 0,
                    len: 0,
                });
                tracing::debug!(key = %key, messages = timeline.len(), "timeline discarded");
                true
            }
            None => false,
        }
    }
}
