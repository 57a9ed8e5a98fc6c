//! Presence registry: who is online right now.
//!
//! Rebuilt from the server's `presence_snapshot` after every (re)connect and
//! kept current by `presence_changed` pushes. Everything is forgotten on
//! disconnect; there is no stale presence.

use std::collections::HashSet;

use tokio::sync::broadcast;

use haggle_proto::event::ServerEvent;
use haggle_proto::message::UserId;
use haggle_proto::presence::PresenceStatus;

/// Capacity of the change channel.
const CHANGE_BUFFER: usize = 64;

/// A single user's presence flipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    /// The user.
    pub user_id: UserId,
    /// Their new status.
    pub status: PresenceStatus,
}

/// Online/offline state of every user the server has told us about.
pub struct PresenceRegistry {
    online: parking_lot::RwLock<HashSet<UserId>>,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceRegistry {
    /// Creates an empty registry (everyone offline).
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            online: parking_lot::RwLock::new(HashSet::new()),
            changes,
        }
    }

    /// Whether `user` is currently online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.read().contains(user)
    }

    /// Presence status of `user`.
    #[must_use]
    pub fn status(&self, user: &UserId) -> PresenceStatus {
        PresenceStatus::from(self.is_online(user))
    }

    /// All online users, sorted.
    #[must_use]
    pub fn online(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.read().iter().cloned().collect();
        users.sort();
        users
    }

    /// Subscribe to individual presence flips.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Replace the whole set with a server snapshot, announcing only the
    /// users whose status actually changed.
    pub fn apply_snapshot(&self, online: Vec<UserId>) {
        let next: HashSet<UserId> = online.into_iter().collect();
        let mut flips = Vec::new();
        {
            let mut current = self.online.write();
            flips.extend(
                current
                    .difference(&next)
                    .map(|user| (user.clone(), PresenceStatus::Offline)),
            );
            flips.extend(
                next.difference(&current)
                    .map(|user| (user.clone(), PresenceStatus::Online)),
            );
            *current = next;
        }
        tracing::debug!(flips = flips.len(), "presence snapshot applied");
        for (user_id, status) in flips {
            self.announce(user_id, status);
        }
    }

    /// Record a single user's status. Returns `true` if it changed.
    pub fn set(&self, user_id: UserId, online: bool) -> bool {
        let changed = {
            let mut current = self.online.write();
            if online {
                current.insert(user_id.clone())
            } else {
                current.remove(&user_id)
            }
        };
        if changed {
            self.announce(user_id, PresenceStatus::from(online));
        }
        changed
    }

    /// Forget everything, announcing each online user as offline.
    pub fn clear(&self) {
        let dropped: Vec<UserId> = self.online.write().drain().collect();
        for user_id in dropped {
            self.announce(user_id, PresenceStatus::Offline);
        }
    }

    /// Apply a presence frame. Returns `false` for unrelated events.
    pub fn handle(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::PresenceSnapshot { online } => {
                self.apply_snapshot(online.clone());
                true
            }
            ServerEvent::PresenceChanged { user_id, online } => {
                self.set(user_id.clone(), *online);
                true
            }
            _ => false,
        }
    }

    fn announce(&self, user_id: UserId, status: PresenceStatus) {
        let _ = self.changes.send(PresenceChange { user_id, status });
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
