//! Conversation directory: the list of conversations with their previews.
//!
//! Two sources feed it. REST conversation lists come in through
//! [`ConversationDirectory::apply_rest`]; timeline changes come in through
//! [`ConversationDirectory::follow`]. For the same conversation the entry
//! with the newer `last_activity_at` wins, so a stale REST page cannot undo
//! a preview derived from a fresher push.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use haggle_proto::message::{ConversationKey, Timestamp, UserId, WireConversation};

use crate::timeline::{ChangeKind, TimelineChange, TimelineStore};

/// Capacity of the change channel.
const CHANGE_BUFFER: usize = 64;

/// Identifier of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationId {
    /// Synthesized locally before the server knows the conversation.
    Temporary(String),
    /// Assigned by the server.
    Server(String),
}

impl ConversationId {
    /// A fresh temporary id.
    #[must_use]
    pub fn temporary() -> Self {
        Self::Temporary(format!("local-{}", uuid::Uuid::now_v7()))
    }

    /// Whether the server has not assigned an id yet.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Temporary(id) | Self::Server(id) => id,
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Local or server id.
    pub id: ConversationId,
    /// Participants.
    pub key: ConversationKey,
    /// The local user.
    pub me: UserId,
    /// The other participant.
    pub counterpart: UserId,
    /// Preview of the newest message.
    pub last_message_summary: Option<String>,
    /// Time of the newest activity.
    pub last_activity_at: Timestamp,
    /// Unread messages addressed to `me`.
    pub unread_count: u32,
}

impl Conversation {
    /// Converts a REST record for user `me`.
    #[must_use]
    pub fn from_wire(me: &UserId, wire: WireConversation) -> Self {
        Self {
            id: ConversationId::Server(wire.id),
            key: ConversationKey::between(me, &wire.counterpart_id),
            me: me.clone(),
            counterpart: wire.counterpart_id,
            last_message_summary: wire.last_message,
            last_activity_at: wire.last_activity_at,
            unread_count: wire.unread_count,
        }
    }

    /// An empty conversation with a temporary id.
    #[must_use]
    pub fn temporary(me: &UserId, counterpart: &UserId) -> Self {
        Self {
            id: ConversationId::temporary(),
            key: ConversationKey::between(me, counterpart),
            me: me.clone(),
            counterpart: counterpart.clone(),
            last_message_summary: None,
            last_activity_at: Timestamp::from_millis(0),
            unread_count: 0,
        }
    }
}

/// The user's conversations, keyed by participants.
pub struct ConversationDirectory {
    me: UserId,
    entries: parking_lot::RwLock<HashMap<ConversationKey, Conversation>>,
    /// Entries as they were before an unconfirmed send replaced the preview.
    settled: parking_lot::Mutex<HashMap<ConversationKey, Conversation>>,
    changes: broadcast::Sender<Conversation>,
}

impl ConversationDirectory {
    /// Creates an empty directory for user `me`.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            me,
            entries: parking_lot::RwLock::new(HashMap::new()),
            settled: parking_lot::Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// All conversations, most recent activity first.
    #[must_use]
    pub fn list(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.entries.read().values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        list
    }

    /// The conversation for `key`, if known.
    #[must_use]
    pub fn get(&self, key: &ConversationKey) -> Option<Conversation> {
        self.entries.read().get(key).cloned()
    }

    /// Subscribe to updated entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Conversation> {
        self.changes.subscribe()
    }

    /// Merge a REST conversation list. Entries missing from the list are
    /// kept; an entry with newer local activity keeps its preview.
    pub fn apply_rest(&self, conversations: Vec<Conversation>) {
        let mut updated = Vec::new();
        {
            let mut entries = self.entries.write();
            for incoming in conversations {
                match entries.get_mut(&incoming.key) {
                    Some(existing) if existing.last_activity_at > incoming.last_activity_at => {
                        if existing.id.is_temporary() && !incoming.id.is_temporary() {
                            existing.id = incoming.id;
                            updated.push(existing.clone());
                        }
                    }
                    Some(existing) => {
                        if *existing != incoming {
                            *existing = incoming;
                            updated.push(existing.clone());
                        }
                    }
                    None => {
                        updated.push(incoming.clone());
                        entries.insert(incoming.key.clone(), incoming);
                    }
                }
            }
        }
        tracing::debug!(updated = updated.len(), "conversation list applied");
        for conversation in updated {
            let _ = self.changes.send(conversation);
        }
    }

    /// Fold a timeline change into the matching entry. Returns `true` if the
    /// entry changed.
    pub fn apply_timeline(&self, change: &TimelineChange) -> bool {
        match change.kind {
            ChangeKind::Discarded => return false,
            ChangeKind::RolledBack => return self.apply_rollback(change),
            _ => {}
        }
        let Some(newest) = &change.newest else {
            return false;
        };
        let unread = u32::try_from(change.unread).unwrap_or(u32::MAX);

        let updated = {
            let mut entries = self.entries.write();
            let entry = entries
                .entry(change.key.clone())
                .or_insert_with(|| Conversation::temporary(&self.me, change.key.other(&self.me)));
            let before = entry.clone();

            match change.kind {
                ChangeKind::Provisional => {
                    self.settled
                        .lock()
                        .entry(change.key.clone())
                        .or_insert_with(|| before.clone());
                }
                ChangeKind::Merged | ChangeKind::Promoted => {
                    self.settled.lock().remove(&change.key);
                }
                _ => {}
            }

            if newest.created_at >= entry.last_activity_at {
                entry.last_activity_at = newest.created_at;
                entry.last_message_summary = Some(newest.summary());
                entry.unread_count = unread;
            }
            if let (ConversationId::Temporary(_), Some(server_id)) =
                (&entry.id, &newest.conversation_id)
            {
                entry.id = ConversationId::Server(server_id.clone());
            }
            (*entry != before).then(|| entry.clone())
        };

        updated.is_some_and(|conversation| {
            let _ = self.changes.send(conversation);
            true
        })
    }

    /// Undo the preview of a failed send, even if that moves the entry
    /// backwards in time.
    ///
    /// The newest remaining message wins unless the entry recorded before
    /// the send is more recent (a REST preview for history that is not
    /// loaded).
    fn apply_rollback(&self, change: &TimelineChange) -> bool {
        let pending_left = change.newest.as_ref().is_some_and(|m| m.id.is_provisional());
        let settled = {
            let mut settled = self.settled.lock();
            if pending_left {
                settled.get(&change.key).cloned()
            } else {
                settled.remove(&change.key)
            }
        };

        let updated = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(&change.key) else {
                return false;
            };
            let before = entry.clone();

            let restore = settled.filter(|settled| {
                change
                    .newest
                    .as_ref()
                    .is_none_or(|newest| settled.last_activity_at > newest.created_at)
            });
            match (restore, &change.newest) {
                (Some(settled), _) => {
                    entry.last_message_summary = settled.last_message_summary;
                    entry.last_activity_at = settled.last_activity_at;
                    entry.unread_count = settled.unread_count;
                }
                (None, Some(newest)) => {
                    entry.last_message_summary = Some(newest.summary());
                    entry.last_activity_at = newest.created_at;
                    entry.unread_count = u32::try_from(change.unread).unwrap_or(u32::MAX);
                }
                (None, None) => {
                    entry.last_message_summary = None;
                    entry.unread_count = 0;
                }
            }
            (*entry != before).then(|| entry.clone())
        };

        updated.is_some_and(|conversation| {
            tracing::debug!(key = %change.key, "failed send removed from conversation preview");
            let _ = self.changes.send(conversation);
            true
        })
    }

    /// Keep the directory in step with `store` until the store goes away.
    pub fn follow(self: &Arc<Self>, store: &TimelineStore) -> JoinHandle<()> {
        let mut rx = store.subscribe();
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        directory.apply_timeline(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "directory fell behind timeline changes");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// The conversation with `counterpart`, created with a temporary id if
    /// it does not exist yet.
    pub fn ensure(&self, counterpart: &UserId) -> Conversation {
        let key = ConversationKey::between(&self.me, counterpart);
        let (conversation, created) = {
            let mut entries = self.entries.write();
            if let Some(existing) = entries.get(&key) {
                (existing.clone(), false)
            } else {
                let fresh = Conversation::temporary(&self.me, counterpart);
                entries.insert(key, fresh.clone());
                (fresh, true)
            }
        };
        if created {
            tracing::debug!(id = %conversation.id, counterpart = %counterpart, "temporary conversation created");
            let _ = self.changes.send(conversation.clone());
        }
        conversation
    }

    /// Replace a temporary id with the server's. Returns `false` if the
    /// conversation is unknown or already has a server id.
    pub fn reconcile_id(&self, key: &ConversationKey, server_id: impl Into<String>) -> bool {
        let reconciled = {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                Some(entry) if entry.id.is_temporary() => {
                    entry.id = ConversationId::Server(server_id.into());
                    Some(entry.clone())
                }
                _ => None,
            }
        };
        reconciled.is_some_and(|conversation| {
            tracing::debug!(key = %key, id = %conversation.id, "conversation id reconciled");
            let _ = self.changes.send(conversation);
            true
        })
    }
}
