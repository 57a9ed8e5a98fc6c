//! WebSocket link to the marketplace backend.
//!
//! Opens a `ws://` or `wss://` connection carrying the bearer token in the
//! upgrade request, then exposes the socket as a text-frame [`Link`]. A
//! background reader task forwards text frames into a channel; binary and
//! control frames are ignored.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, Credentials, Link, TransportError};

/// Write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Frames buffered between the reader task and `recv_text`.
const INCOMING_BUFFER: usize = 256;

/// Opens authenticated WebSocket links to a fixed socket URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Validates `socket_url` and builds a connector for it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL does not parse or
    /// its scheme is not `ws` / `wss`.
    pub fn new(socket_url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(socket_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{socket_url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::InvalidUrl(format!(
                "{socket_url}: unsupported scheme {other}"
            ))),
        }
    }

    /// The socket URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    type Link = WebSocketLink;

    async fn open(&self, credentials: &Credentials) -> Result<Self::Link, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token()))
            .map_err(|_| TransportError::Auth("token contains invalid header characters".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = connect_async(request).await.map_err(|e| {
            tracing::warn!(url = %self.url, err = %e, "socket connect failed");
            map_ws_connect_error(e)
        })?;
        tracing::debug!(url = %self.url, user = %credentials.user_id(), "socket upgraded");

        let (sender, reader) = stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);
        let reader_handle = tokio::spawn(reader_loop(reader, tx));

        Ok(WebSocketLink {
            sender: Mutex::new(sender),
            incoming: Mutex::new(rx),
            reader_handle,
        })
    }
}

/// One open WebSocket connection.
pub struct WebSocketLink {
    sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::Receiver<String>>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl Link for WebSocketLink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "socket send failed");
            TransportError::Network(e.to_string())
        })
    }

    async fn recv_text(&self) -> Result<String, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let mut sender = self.sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "socket close frame not sent");
        }
        self.reader_handle.abort();
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Forward text frames until the socket closes or errors.
async fn reader_loop(mut reader: WsReader, tx: mpsc::Sender<String>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if tx.send(text.as_str().to_owned()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("socket closed by server");
                break;
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "socket read error");
                break;
            }
        }
    }
    tracing::debug!("socket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            TransportError::Auth(format!("upgrade refused: {}", response.status()))
        }
        WsError::Http(response) => {
            TransportError::Handshake(format!("upgrade failed: {}", response.status()))
        }
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        other => TransportError::Network(other.to_string()),
    }
}
