//! Sync engine: wires the transport to every component that consumes it.
//!
//! One engine exists per logged-in session. [`SyncEngine::start`] opens the
//! socket and spawns a single dispatcher task, the only place raw server
//! events are routed:
//!
//! ```text
//! ConnectionManager ── TransportEvent ──> dispatcher
//!                                          ├─ presence / typing frames  -> PresenceRegistry, TypingChannel
//!                                          ├─ message pushes            -> TimelineStore::merge
//!                                          ├─ offer events (normalized) -> TimelineStore::apply_offer
//!                                          └─ conversations_changed     -> HistoryLoader -> ConversationDirectory
//! ```
//!
//! Request/response work (history, sends, read marks) runs on the caller's
//! task. [`SyncEngine::shutdown`] tears the socket down on logout.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use haggle_proto::event::ServerEvent;
use haggle_proto::message::{ConversationKey, Message, UserId, WireMessage};

use crate::chat::history::{HistoryError, HistoryLoader, RestApi};
use crate::chat::media::MediaUploader;
use crate::chat::send::{Draft, OptimisticSender, PendingSend, SendFailure, SendReceipt};
use crate::config::ClientConfig;
use crate::directory::{Conversation, ConversationDirectory};
use crate::offer::{self, OfferEventSource};
use crate::presence::PresenceRegistry;
use crate::timeline::{MergeReport, OfferOutcome, TimelineStore};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionManager, Connector, Credentials, TransportError,
    TransportEvent,
};
use crate::typing::TypingChannel;

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The socket could not be opened or authenticated.
    #[error("connection failed: {0}")]
    Transport(#[from] TransportError),

    /// A REST request failed.
    #[error("history request failed: {0}")]
    History(#[from] HistoryError),
}

/// A running session: one socket, one timeline store, one directory.
pub struct SyncEngine<K: Connector, A: RestApi, U: MediaUploader> {
    me: UserId,
    manager: ConnectionManager<K>,
    connection: Connection,
    history: Arc<HistoryLoader<A>>,
    store: Arc<TimelineStore>,
    directory: Arc<ConversationDirectory>,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingChannel<Connection>>,
    sender: OptimisticSender<U>,
    active: parking_lot::Mutex<Option<UserId>>,
    page_limit: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl<K: Connector, A: RestApi, U: MediaUploader> std::fmt::Debug for SyncEngine<K, A, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("me", &self.me)
            .field("page_limit", &self.page_limit)
            .finish_non_exhaustive()
    }
}

impl<K: Connector, A: RestApi, U: MediaUploader> SyncEngine<K, A, U> {
    /// Connect and start dispatching.
    ///
    /// The transport subscription is taken before the socket opens, so the
    /// presence snapshot requested on connect is never missed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Transport`] if the first connection attempt
    /// fails; an auth rejection leaves nothing running.
    pub async fn start(
        config: &ClientConfig,
        connector: K,
        api: A,
        uploader: U,
        credentials: Credentials,
    ) -> Result<Self, EngineError> {
        let me = credentials.user_id().clone();
        let manager = ConnectionManager::new(connector, config.transport.clone());
        let events = manager.subscribe();
        let connection = manager.connect(credentials).await?;

        let history = Arc::new(HistoryLoader::new(api, me.clone()));
        let store = Arc::new(TimelineStore::new(me.clone(), config.timeline, config.offers));
        let directory = Arc::new(ConversationDirectory::new(me.clone()));
        let presence = Arc::new(PresenceRegistry::new());
        let typing = Arc::new(TypingChannel::new(me.clone(), connection.clone(), config.typing));
        let sender = OptimisticSender::new(
            connection.clone(),
            Arc::clone(&store),
            Arc::new(uploader),
            config.send,
        );

        let dispatcher = Dispatcher {
            me: me.clone(),
            history: Arc::clone(&history),
            store: Arc::clone(&store),
            directory: Arc::clone(&directory),
            presence: Arc::clone(&presence),
            typing: Arc::clone(&typing),
        };
        let tasks = vec![
            tokio::spawn(dispatcher.run(events)),
            directory.follow(&store),
        ];

        tracing::info!(user = %me, "sync engine started");
        Ok(Self {
            me,
            manager,
            connection,
            history,
            store,
            directory,
            presence,
            typing,
            sender,
            active: parking_lot::Mutex::new(None),
            page_limit: config.timeline.page_limit,
            tasks,
        })
    }

    /// The logged-in user.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// Make `counterpart` the active conversation and load its first page.
    ///
    /// The previously active timeline is discarded and its typing state
    /// cleared. Background timelines with no send in flight are released as
    /// well. In-flight sends and requests are not cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::History`] if the first page cannot be loaded;
    /// the conversation is still selected.
    pub async fn select_conversation(
        &self,
        counterpart: &UserId,
    ) -> Result<Conversation, EngineError> {
        let previous = self.active.lock().replace(counterpart.clone());
        if let Some(previous) = previous.filter(|p| p != counterpart) {
            self.store
                .discard(&ConversationKey::between(&self.me, &previous));
            self.typing.clear_counterpart(&previous);
            tracing::debug!(from = %previous, to = %counterpart, "active conversation switched");
        }
        self.store
            .discard_idle(&ConversationKey::between(&self.me, counterpart));
        let conversation = self.directory.ensure(counterpart);
        self.load_history(counterpart, 1).await?;
        Ok(conversation)
    }

    /// The active counterpart, if any.
    #[must_use]
    pub fn active_conversation(&self) -> Option<UserId> {
        self.active.lock().clone()
    }

    /// Load one page of history and merge it into the timeline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::History`] if the request fails.
    pub async fn load_history(
        &self,
        counterpart: &UserId,
        page: u32,
    ) -> Result<MergeReport, EngineError> {
        let messages = self
            .history
            .load_history(counterpart, page, self.page_limit)
            .await?;
        let key = ConversationKey::between(&self.me, counterpart);
        Ok(self.store.merge(&key, messages))
    }

    /// Send and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the [`SendFailure`] with the draft for a retry.
    pub async fn send(&self, draft: Draft) -> Result<SendReceipt, SendFailure> {
        self.typing.stop_typing(&draft.counterpart);
        self.sender.send(draft).await
    }

    /// Show the message now and finish the send in the background.
    ///
    /// # Errors
    ///
    /// Returns the [`SendFailure`] if the draft is invalid or the socket is
    /// down.
    pub fn submit(&self, draft: Draft) -> Result<PendingSend, SendFailure> {
        self.typing.stop_typing(&draft.counterpart);
        self.sender.submit(draft)
    }

    /// Record a keystroke towards `counterpart`.
    pub fn start_typing(&self, counterpart: &UserId) {
        self.typing.start_typing(counterpart);
    }

    /// Stop the typing indicator towards `counterpart`.
    pub fn stop_typing(&self, counterpart: &UserId) {
        self.typing.stop_typing(counterpart);
    }

    /// Mark everything from `counterpart` read, locally and on the server.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::History`] if the server call fails; the local
    /// flags stay flipped.
    pub async fn mark_read(&self, counterpart: &UserId) -> Result<usize, EngineError> {
        let key = ConversationKey::between(&self.me, counterpart);
        let flipped = self.store.mark_read(&key);
        self.history.mark_read(counterpart).await?;
        Ok(flipped)
    }

    /// Refetch the conversation list.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::History`] if the request fails.
    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>, EngineError> {
        let list = self.history.load_conversations().await?;
        self.directory.apply_rest(list);
        Ok(self.directory.list())
    }

    /// Messages with `counterpart`, in display order.
    #[must_use]
    pub fn timeline(&self, counterpart: &UserId) -> Vec<Message> {
        self.store
            .timeline(&ConversationKey::between(&self.me, counterpart))
    }

    /// Conversations, most recent first.
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        self.directory.list()
    }

    /// The timeline store, for change subscriptions.
    #[must_use]
    pub const fn store(&self) -> &Arc<TimelineStore> {
        &self.store
    }

    /// The conversation directory.
    #[must_use]
    pub const fn directory(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }

    /// Presence of every known user.
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Local and remote typing state.
    #[must_use]
    pub fn typing(&self) -> &TypingChannel<Connection> {
        &self.typing
    }

    /// The socket connection handle.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Subscribe to raw transport events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.manager.subscribe()
    }

    /// Log out: close the socket, clear ephemeral state, stop background
    /// tasks.
    pub async fn shutdown(self) {
        self.typing.clear_remote();
        self.manager.disconnect().await;
        self.presence.clear();
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!(user = %self.me, "sync engine stopped");
    }
}

/// Routes server events to the components. Owned by the dispatcher task.
struct Dispatcher<A: RestApi> {
    me: UserId,
    history: Arc<HistoryLoader<A>>,
    store: Arc<TimelineStore>,
    directory: Arc<ConversationDirectory>,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingChannel<Connection>>,
}

impl<A: RestApi> Dispatcher<A> {
    async fn run(self, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Server(event)) => self.route(&event),
                Ok(TransportEvent::Connection(event)) => self.on_connection(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "dispatcher lagged behind transport events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    fn on_connection(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => tracing::debug!("dispatcher saw connect"),
            ConnectionEvent::Disconnected(reason) => {
                tracing::info!(%reason, "connection lost, clearing presence and typing");
                self.presence.clear();
                self.typing.clear_remote();
            }
            ConnectionEvent::ConnectError(reason) => {
                tracing::warn!(%reason, "reconnect attempt failed");
            }
        }
    }

    fn route(&self, event: &ServerEvent) {
        if self.presence.handle(event) || self.typing.handle(event) {
            return;
        }
        match event {
            ServerEvent::NewMessage { message } => {
                self.merge_push(message);
                return;
            }
            ServerEvent::MessageUpdated { message } | ServerEvent::NewOffer { message } => {
                if !self.merge_push(message) {
                    return;
                }
            }
            ServerEvent::ConversationsChanged => {
                self.refresh_conversations();
                return;
            }
            _ => {}
        }
        if let Some(update) = offer::normalize(event) {
            let order_id = update.order_id.clone();
            let source = update.source;
            match self.store.apply_offer(update) {
                OfferOutcome::Parked => {
                    tracing::debug!(%order_id, ?source, "offer update parked until its message loads");
                }
                OfferOutcome::Ignored(key) if source != OfferEventSource::MessageUpdated => {
                    tracing::warn!(%order_id, %key, ?source, "conflicting update for settled offer ignored");
                }
                _ => {}
            }
        }
    }

    /// Merge a pushed message. Returns `false` if it was dropped.
    fn merge_push(&self, wire: &WireMessage) -> bool {
        let message = match Message::from_wire(wire.clone()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "malformed message push dropped");
                return false;
            }
        };
        if !message.conversation_key.contains(&self.me) {
            tracing::warn!(id = %message.id, "push for a conversation we are not in dropped");
            return false;
        }
        let key = message.conversation_key.clone();
        if let Some(server_id) = &message.conversation_id {
            self.directory.reconcile_id(&key, server_id.clone());
        }
        self.store.merge(&key, vec![message]);
        true
    }

    fn refresh_conversations(&self) {
        let history = Arc::clone(&self.history);
        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            match history.load_conversations().await {
                Ok(list) => directory.apply_rest(list),
                Err(e) => tracing::warn!(error = %e, "conversation refresh failed"),
            }
        });
    }
}
