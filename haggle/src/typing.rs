//! Typing indicators, both directions.
//!
//! Local: [`TypingChannel::start_typing`] sends `typing(true)` once and arms
//! a debounce timer; every further keystroke re-arms it, and when it fires
//! `typing(false)` goes out. Remote: the last `typing_changed` frame per
//! counterpart, expiring on its own after `remote_timeout` in case the stop
//! frame is lost. Both sides are cleared on conversation switch and on
//! disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::UserId;

use crate::config::TypingConfig;
use crate::transport::Emitter;

/// Capacity of the change channel.
const CHANGE_BUFFER: usize = 64;

/// A counterpart started or stopped typing to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    /// Who is typing.
    pub user_id: UserId,
    /// Current state.
    pub is_typing: bool,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    local: HashMap<UserId, Timer>,
    remote: HashMap<UserId, Timer>,
    next_generation: u64,
}

impl TypingState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Inner<E> {
    me: UserId,
    emitter: E,
    config: TypingConfig,
    state: parking_lot::Mutex<TypingState>,
    changes: broadcast::Sender<TypingChange>,
}

impl<E: Emitter> Inner<E> {
    fn emit(&self, counterpart: &UserId, is_typing: bool) {
        let frame = ClientEvent::Typing {
            counterpart_id: counterpart.clone(),
            is_typing,
        };
        if let Err(e) = self.emitter.emit(frame) {
            tracing::debug!(
                counterpart = %counterpart,
                is_typing,
                error = %e,
                "typing frame not sent"
            );
        }
    }

    fn announce(&self, user_id: UserId, is_typing: bool) {
        let _ = self.changes.send(TypingChange { user_id, is_typing });
    }
}

/// Debounced local typing signals plus the projection of remote ones.
pub struct TypingChannel<E: Emitter> {
    inner: Arc<Inner<E>>,
}

impl<E: Emitter> TypingChannel<E> {
    /// Creates a channel for user `me`, sending frames through `emitter`.
    pub fn new(me: UserId, emitter: E, config: TypingConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                me,
                emitter,
                config,
                state: parking_lot::Mutex::new(TypingState::default()),
                changes,
            }),
        }
    }

    /// Record a keystroke towards `counterpart`.
    ///
    /// Sends `typing(true)` only on the first call of a burst; later calls
    /// just push the automatic stop further out.
    pub fn start_typing(&self, counterpart: &UserId) {
        let mut state = self.inner.state.lock();
        let generation = state.next_generation();
        let handle = spawn_local_stop(&self.inner, counterpart.clone(), generation);
        let previous = state.local.insert(counterpart.clone(), Timer { generation, handle });
        drop(state);

        match previous {
            Some(timer) => timer.handle.abort(),
            None => self.inner.emit(counterpart, true),
        }
    }

    /// Stop typing towards `counterpart` now (e.g. the message was sent).
    pub fn stop_typing(&self, counterpart: &UserId) {
        let previous = self.inner.state.lock().local.remove(counterpart);
        if let Some(timer) = previous {
            timer.handle.abort();
            self.inner.emit(counterpart, false);
        }
    }

    /// Whether we are currently flagged as typing to `counterpart`.
    #[must_use]
    pub fn is_local_typing(&self, counterpart: &UserId) -> bool {
        self.inner.state.lock().local.contains_key(counterpart)
    }

    /// Whether `counterpart` is currently typing to us.
    #[must_use]
    pub fn is_typing(&self, counterpart: &UserId) -> bool {
        self.inner.state.lock().remote.contains_key(counterpart)
    }

    /// Every counterpart currently typing to us, sorted.
    #[must_use]
    pub fn typing_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.inner.state.lock().remote.keys().cloned().collect();
        users.sort();
        users
    }

    /// Subscribe to remote typing changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TypingChange> {
        self.inner.changes.subscribe()
    }

    /// Run `callback` for every remote typing change until the channel is
    /// dropped.
    pub fn on_typing_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&TypingChange) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => callback(&change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "typing listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply a `typing_changed` frame addressed to us. Returns `false` for
    /// unrelated events.
    pub fn handle(&self, event: &ServerEvent) -> bool {
        let ServerEvent::TypingChanged {
            user_id,
            counterpart_id,
            is_typing,
        } = event
        else {
            return false;
        };
        if *counterpart_id != self.inner.me {
            tracing::debug!(
                from = %user_id,
                to = %counterpart_id,
                "typing frame for another user ignored"
            );
            return true;
        }
        self.apply_remote(user_id.clone(), *is_typing);
        true
    }

    /// Record a remote typing state for `user_id`.
    pub fn apply_remote(&self, user_id: UserId, is_typing: bool) {
        let mut state = self.inner.state.lock();
        if is_typing {
            let generation = state.next_generation();
            let handle = spawn_remote_expiry(&self.inner, user_id.clone(), generation);
            let previous = state.remote.insert(user_id.clone(), Timer { generation, handle });
            drop(state);
            match previous {
                Some(timer) => timer.handle.abort(),
                None => self.inner.announce(user_id, true),
            }
        } else {
            let previous = state.remote.remove(&user_id);
            drop(state);
            if let Some(timer) = previous {
                timer.handle.abort();
                self.inner.announce(user_id, false);
            }
        }
    }

    /// Conversation switch: stop our own indicator and forget theirs.
    pub fn clear_counterpart(&self, counterpart: &UserId) {
        self.stop_typing(counterpart);
        let previous = self.inner.state.lock().remote.remove(counterpart);
        if let Some(timer) = previous {
            timer.handle.abort();
            self.inner.announce(counterpart.clone(), false);
        }
    }

    /// Disconnect: drop every timer and report every remote typer as stopped.
    ///
    /// No stop frames are sent; there is no link to send them on.
    pub fn clear_remote(&self) {
        let (local, remote) = {
            let mut state = self.inner.state.lock();
            (
                std::mem::take(&mut state.local),
                std::mem::take(&mut state.remote),
            )
        };
        for timer in local.into_values() {
            timer.handle.abort();
        }
        for (user_id, timer) in remote {
            timer.handle.abort();
            self.inner.announce(user_id, false);
        }
    }
}

impl<E: Emitter> Drop for TypingChannel<E> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let TypingState { local, remote, .. } = &mut *state;
        for (_, timer) in local.drain().chain(remote.drain()) {
            timer.handle.abort();
        }
    }
}

fn spawn_local_stop<E: Emitter>(
    inner: &Arc<Inner<E>>,
    counterpart: UserId,
    generation: u64,
) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.config.debounce).await;
        let expired = {
            let mut state = inner.state.lock();
            let current = state.local.get(&counterpart).map(|t| t.generation);
            if current == Some(generation) {
                state.local.remove(&counterpart);
                true
            } else {
                false
            }
        };
        if expired {
            tracing::trace!(counterpart = %counterpart, "typing debounce elapsed");
            inner.emit(&counterpart, false);
        }
    })
}

fn spawn_remote_expiry<E: Emitter>(
    inner: &Arc<Inner<E>>,
    user_id: UserId,
    generation: u64,
) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.config.remote_timeout).await;
        let expired = {
            let mut state = inner.state.lock();
            let current = state.remote.get(&user_id).map(|t| t.generation);
            if current == Some(generation) {
                state.remote.remove(&user_id);
                true
            } else {
                false
            }
        };
        if expired {
            tracing::debug!(user = %user_id, "remote typing indicator expired");
            inner.announce(user_id, false);
        }
    })
}
