//! Connection manager: owns the single live socket for a session.
//!
//! [`ConnectionManager::connect`] opens and authenticates a link, then hands
//! it to a background supervisor that reads frames, resolves send
//! acknowledgements, publishes everything else on a broadcast channel, and
//! re-establishes the link with bounded exponential backoff when it drops.
//! Only the manager opens or closes links; every other component holds a
//! [`Connection`] handle (read-only event source plus `emit` / `send_message`).
//!
//! Nothing is buffered while disconnected: outbound calls fail fast with
//! [`TransportError::NotConnected`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use haggle_proto::codec;
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::{Attachment, ProvisionalId, UserId, WireMessage};

use crate::config::TransportConfig;

use super::{
    AckError, ConnectionEvent, ConnectionState, Connector, Credentials, DisconnectReason, Emitter,
    Link, TransportError, TransportEvent,
};

/// Result delivered to a waiting [`Connection::send_message`] call.
#[derive(Debug)]
enum AckOutcome {
    Confirmed(Box<WireMessage>),
    Rejected(String),
}

/// Broadcast hub shared by the manager and its connections.
///
/// Replaced wholesale on `disconnect()`, which closes every existing receiver.
struct EventHub {
    sender: parking_lot::Mutex<broadcast::Sender<TransportEvent>>,
    capacity: usize,
}

impl EventHub {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: parking_lot::Mutex::new(sender),
            capacity,
        }
    }

    fn publish(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.sender.lock().send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.lock().subscribe()
    }

    fn reset(&self) {
        let (sender, _) = broadcast::channel(self.capacity);
        *self.sender.lock() = sender;
    }
}

/// State shared between a [`Connection`] handle and its supervisor task.
struct Shared {
    user_id: UserId,
    hub: Arc<EventHub>,
    state: watch::Sender<ConnectionState>,
    /// Writer queue of the current link; `None` while no link is live.
    outbound: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    pending_acks: parking_lot::Mutex<HashMap<u64, oneshot::Sender<AckOutcome>>>,
    next_ack_id: AtomicU64,
    outbound_capacity: usize,
}

impl Shared {
    fn new(user_id: UserId, hub: Arc<EventHub>, outbound_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            user_id,
            hub,
            state,
            outbound: parking_lot::Mutex::new(None),
            pending_acks: parking_lot::Mutex::new(HashMap::new()),
            next_ack_id: AtomicU64::new(1),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn publish_connection(&self, event: ConnectionEvent) {
        self.hub.publish(TransportEvent::Connection(event));
    }

    fn enqueue(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let text = codec::encode_client(event)?;
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    /// Installs a fresh writer queue, marks the link live, and re-requests
    /// presence so the registry is rebuilt from a server snapshot.
    fn go_live(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Connected);
        self.publish_connection(ConnectionEvent::Connected);
        if let Err(e) = self.enqueue(&ClientEvent::RequestPresence) {
            tracing::warn!(error = %e, "failed to request presence snapshot");
        }
        rx
    }

    /// Drops the writer queue and fails every in-flight acknowledgement.
    fn detach(&self) {
        self.outbound.lock().take();
        let dropped = std::mem::take(&mut *self.pending_acks.lock());
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "failing in-flight acknowledgements");
        }
    }

    fn resolve_ack(&self, ack_id: u64, outcome: AckOutcome) {
        let waiter = self.pending_acks.lock().remove(&ack_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(ack_id, "acknowledgement for unknown or expired request"),
        }
    }
}

/// Handle to the managed connection.
///
/// Cheap to clone; all clones observe the same link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// The authenticated user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether a live, authenticated link exists right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to transport events. Each subscriber receives every event
    /// independently of the others.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.hub.subscribe()
    }

    /// Send a message and wait for the server's acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`AckError::NotSent`] if there is no live link (fails fast).
    /// - [`AckError::Timeout`] if no acknowledgement arrives within `timeout`.
    /// - [`AckError::Rejected`] on a negative acknowledgement.
    /// - [`AckError::ConnectionLost`] if the link drops while waiting.
    pub async fn send_message(
        &self,
        receiver_id: UserId,
        body: String,
        attachment: Option<Attachment>,
        client_ref: ProvisionalId,
        timeout: Duration,
    ) -> Result<WireMessage, AckError> {
        if !self.is_connected() {
            return Err(AckError::NotSent(TransportError::NotConnected));
        }

        let ack_id = self.shared.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending_acks.lock().insert(ack_id, tx);

        let frame = ClientEvent::SendMessage {
            ack_id,
            receiver_id,
            body,
            attachment,
            client_ref,
        };
        if let Err(e) = self.shared.enqueue(&frame) {
            self.shared.pending_acks.lock().remove(&ack_id);
            return Err(AckError::NotSent(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(AckOutcome::Confirmed(message))) => Ok(*message),
            Ok(Ok(AckOutcome::Rejected(reason))) => Err(AckError::Rejected(reason)),
            Ok(Err(_)) => Err(AckError::ConnectionLost),
            Err(_) => {
                self.shared.pending_acks.lock().remove(&ack_id);
                tracing::debug!(ack_id, %client_ref, "acknowledgement timed out");
                Err(AckError::Timeout)
            }
        }
    }
}

impl Emitter for Connection {
    fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        self.shared.enqueue(&event)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.shared.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The link currently owned by the supervisor, reachable for `disconnect()`.
type LinkSlot<L> = Arc<parking_lot::Mutex<Option<Arc<L>>>>;

struct Active<L> {
    connection: Connection,
    link: LinkSlot<L>,
    supervisor: JoinHandle<()>,
}

impl<L: Link> Active<L> {
    async fn shutdown(self) {
        self.supervisor.abort();
        let shared = &self.connection.shared;
        shared.detach();
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.close().await;
        }
        shared.set_state(ConnectionState::Disconnected);
        shared.publish_connection(ConnectionEvent::Disconnected(DisconnectReason::Requested));
    }
}

/// Owns the one live socket connection for a session.
///
/// Created on login and torn down with [`disconnect`](Self::disconnect) on
/// logout. Subscribe with [`subscribe`](Self::subscribe) *before* connecting
/// to observe the first server pushes.
pub struct ConnectionManager<K: Connector> {
    connector: Arc<K>,
    config: TransportConfig,
    hub: Arc<EventHub>,
    active: tokio::sync::Mutex<Option<Active<K::Link>>>,
}

impl<K: Connector> ConnectionManager<K> {
    /// Creates a manager that opens links through `connector`.
    #[must_use]
    pub fn new(connector: K, config: TransportConfig) -> Self {
        let hub = Arc::new(EventHub::new(config.event_buffer));
        Self {
            connector: Arc::new(connector),
            config,
            hub,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe to transport events for the lifetime of the current hub.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.hub.subscribe()
    }

    /// The current connection handle, if one is being managed.
    pub async fn connection(&self) -> Option<Connection> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.connection.clone())
    }

    /// Open and authenticate the connection.
    ///
    /// Idempotent: while a connection for the same user is connected or
    /// reconnecting, the existing handle is returned and no new link is
    /// opened. The first attempt is not retried; once established, link drops
    /// are retried in the background per the reconnect policy.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Auth`] if the credentials are rejected (state
    ///   becomes [`ConnectionState::NeedsLogin`]).
    /// - Any transient [`TransportError`] if the link cannot be opened.
    pub async fn connect(&self, credentials: Credentials) -> Result<Connection, TransportError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            let alive = !current.supervisor.is_finished();
            if alive && current.connection.user_id() == credentials.user_id() {
                tracing::debug!(user = %credentials.user_id(), "already connected, reusing connection");
                return Ok(current.connection.clone());
            }
        }
        if let Some(stale) = active.take() {
            stale.shutdown().await;
        }

        let shared = Arc::new(Shared::new(
            credentials.user_id().clone(),
            Arc::clone(&self.hub),
            self.config.event_buffer,
        ));
        shared.set_state(ConnectionState::Connecting);

        let link = match establish(self.connector.as_ref(), &credentials, &self.config).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                let state = if e.is_transient() {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::NeedsLogin
                };
                tracing::warn!(user = %credentials.user_id(), error = %e, "socket connect failed");
                shared.set_state(state);
                shared.publish_connection(ConnectionEvent::ConnectError(e.to_string()));
                return Err(e);
            }
        };

        let slot: LinkSlot<K::Link> = Arc::new(parking_lot::Mutex::new(Some(Arc::clone(&link))));
        let outbound = shared.go_live();
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.connector),
            credentials,
            self.config.clone(),
            Arc::clone(&shared),
            Arc::clone(&slot),
            link,
            outbound,
        ));

        let connection = Connection { shared };
        tracing::info!(user = %connection.user_id(), "socket connected");
        *active = Some(Active {
            connection: connection.clone(),
            link: slot,
            supervisor,
        });
        Ok(connection)
    }

    /// Tear down the connection and clear every registered listener.
    ///
    /// Subscribers receive `Disconnected(Requested)` and then observe the
    /// channel closing. In-flight acknowledgements fail with
    /// [`AckError::ConnectionLost`].
    pub async fn disconnect(&self) {
        let current = self.active.lock().await.take();
        if let Some(current) = current {
            tracing::info!(user = %current.connection.user_id(), "disconnecting socket");
            current.shutdown().await;
        }
        self.hub.reset();
    }
}

/// Open a link and wait for the server's handshake verdict.
async fn establish<K: Connector>(
    connector: &K,
    credentials: &Credentials,
    config: &TransportConfig,
) -> Result<K::Link, TransportError> {
    let link = tokio::time::timeout(config.connect_timeout, connector.open(credentials))
        .await
        .map_err(|_| TransportError::Timeout)??;

    let first = match tokio::time::timeout(config.handshake_timeout, link.recv_text()).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            link.close().await;
            return Err(e);
        }
        Err(_) => {
            link.close().await;
            return Err(TransportError::Timeout);
        }
    };

    let verdict = match codec::decode_server(&first) {
        Ok(ServerEvent::Authenticated { user_id }) if user_id == *credentials.user_id() => Ok(()),
        Ok(ServerEvent::Authenticated { user_id }) => Err(TransportError::Auth(format!(
            "token belongs to {user_id}, not {}",
            credentials.user_id()
        ))),
        Ok(ServerEvent::AuthError { reason }) => Err(TransportError::Auth(reason)),
        Ok(other) => Err(TransportError::Handshake(format!(
            "expected authenticated, got {}",
            other.name()
        ))),
        Err(e) => Err(TransportError::Codec(e)),
    };

    match verdict {
        Ok(()) => Ok(link),
        Err(e) => {
            link.close().await;
            Err(e)
        }
    }
}

/// Background task: run the link, and re-establish it when it drops.
async fn supervise<K: Connector>(
    connector: Arc<K>,
    credentials: Credentials,
    config: TransportConfig,
    shared: Arc<Shared>,
    slot: LinkSlot<K::Link>,
    mut link: Arc<K::Link>,
    mut outbound: mpsc::Receiver<String>,
) {
    loop {
        let reason = run_link(&shared, &link, outbound).await;
        shared.detach();
        slot.lock().take();
        link.close().await;
        tracing::warn!(reason = %reason, "socket link lost");
        shared.publish_connection(ConnectionEvent::Disconnected(reason.clone()));

        if let DisconnectReason::AuthRevoked(_) = reason {
            shared.set_state(ConnectionState::NeedsLogin);
            return;
        }

        let Some(next) = reconnect(connector.as_ref(), &credentials, &config, &shared).await else {
            return;
        };
        link = Arc::new(next);
        *slot.lock() = Some(Arc::clone(&link));
        outbound = shared.go_live();
    }
}

/// Retry with capped exponential backoff. Returns `None` on auth rejection
/// or when the attempts run out.
async fn reconnect<K: Connector>(
    connector: &K,
    credentials: &Credentials,
    config: &TransportConfig,
    shared: &Shared,
) -> Option<K::Link> {
    let policy = config.reconnect;
    for attempt in 0..policy.max_attempts {
        shared.set_state(ConnectionState::Reconnecting {
            attempt: attempt + 1,
        });
        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        tokio::time::sleep(delay).await;

        match establish(connector, credentials, config).await {
            Ok(link) => {
                tracing::info!(attempt = attempt + 1, "socket re-established");
                return Some(link);
            }
            Err(TransportError::Auth(reason)) => {
                tracing::warn!(reason = %reason, "reconnect rejected, login required");
                shared.set_state(ConnectionState::NeedsLogin);
                shared.publish_connection(ConnectionEvent::ConnectError(format!(
                    "authentication rejected: {reason}"
                )));
                return None;
            }
            Err(e) => {
                tracing::debug!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                shared.publish_connection(ConnectionEvent::ConnectError(e.to_string()));
            }
        }
    }

    tracing::warn!(attempts = policy.max_attempts, "giving up on reconnect");
    shared.set_state(ConnectionState::Disconnected);
    shared.publish_connection(ConnectionEvent::Disconnected(
        DisconnectReason::RetriesExhausted,
    ));
    None
}

/// Pump one link until it fails. Returns why it stopped.
async fn run_link<L: Link>(
    shared: &Shared,
    link: &Arc<L>,
    mut outbound: mpsc::Receiver<String>,
) -> DisconnectReason {
    let writer_link = Arc::clone(link);
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = writer_link.send_text(text).await {
                return Some(e.to_string());
            }
        }
        None
    });

    let reason = tokio::select! {
        reason = read_loop(shared, link.as_ref()) => reason,
        result = &mut writer => match result {
            Ok(Some(err)) => DisconnectReason::Network(err),
            Ok(None) => DisconnectReason::Requested,
            Err(e) => DisconnectReason::Network(e.to_string()),
        },
    };
    writer.abort();
    reason
}

/// Read frames, resolve acks, and publish everything else.
///
/// Malformed frames are logged and skipped; they never end the link.
async fn read_loop<L: Link>(shared: &Shared, link: &L) -> DisconnectReason {
    loop {
        let text = match link.recv_text().await {
            Ok(text) => text,
            Err(TransportError::ConnectionClosed) => return DisconnectReason::ServerClosed,
            Err(e) => return DisconnectReason::Network(e.to_string()),
        };

        match codec::decode_server(&text) {
            Ok(ServerEvent::Ack {
                ack_id,
                message,
                error,
            }) => {
                let outcome = match (message, error) {
                    (_, Some(reason)) => AckOutcome::Rejected(reason),
                    (Some(message), None) => AckOutcome::Confirmed(Box::new(message)),
                    (None, None) => AckOutcome::Rejected("acknowledgement without message".into()),
                };
                shared.resolve_ack(ack_id, outcome);
            }
            Ok(ServerEvent::AuthError { reason }) => return DisconnectReason::AuthRevoked(reason),
            Ok(ServerEvent::Authenticated { .. }) => {
                tracing::debug!("ignoring repeated authenticated frame");
            }
            Ok(event) => shared.hub.publish(TransportEvent::Server(event)),
            Err(e) => tracing::warn!(error = %e, "dropping malformed socket frame"),
        }
    }
}
