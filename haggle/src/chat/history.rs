//! Paginated REST history.
//!
//! [`RestApi`] is the seam to the backend's REST endpoints; [`HttpRestClient`]
//! implements it with `reqwest`. [`HistoryLoader`] turns wire records into
//! domain [`Message`]s and [`Conversation`]s, dropping records without an id.
//! Pagination is caller-driven and nothing is retried automatically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use haggle_proto::message::{ConversationKey, Message, UserId, WireConversation, WireMessage};

use crate::directory::Conversation;

/// Largest page the backend serves.
pub const MAX_PAGE_LIMIT: u16 = 100;

/// Connect timeout for REST calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from history and conversation-list requests.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The request did not complete.
    #[error("network error: {0}")]
    Network(String),

    /// The counterpart or conversation does not exist.
    #[error("not found")]
    NotFound,

    /// The backend answered with an error status.
    #[error("server error: status {status}")]
    Server {
        /// HTTP status code.
        status: u16,
    },

    /// The response body was not the expected JSON.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The configured API URL is unusable.
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}

/// The backend's REST surface, as far as the sync engine needs it.
pub trait RestApi: Send + Sync + 'static {
    /// `GET {api}/conversations`
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<WireConversation>, HistoryError>> + Send;

    /// `GET {api}/messages/{counterpart}?page=&limit=`
    fn fetch_messages(
        &self,
        counterpart: &UserId,
        page: u32,
        limit: u16,
    ) -> impl Future<Output = Result<Vec<WireMessage>, HistoryError>> + Send;

    /// `POST {api}/conversations/{counterpart}/read`
    fn mark_read(&self, counterpart: &UserId) -> impl Future<Output = Result<(), HistoryError>> + Send;
}

impl<T: RestApi> RestApi for Arc<T> {
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<WireConversation>, HistoryError>> + Send {
        (**self).list_conversations()
    }

    fn fetch_messages(
        &self,
        counterpart: &UserId,
        page: u32,
        limit: u16,
    ) -> impl Future<Output = Result<Vec<WireMessage>, HistoryError>> + Send {
        (**self).fetch_messages(counterpart, page, limit)
    }

    fn mark_read(&self, counterpart: &UserId) -> impl Future<Output = Result<(), HistoryError>> + Send {
        (**self).mark_read(counterpart)
    }
}

/// Clamp a requested page size to `1..=MAX_PAGE_LIMIT`.
#[must_use]
pub fn clamp_limit(limit: u16) -> u16 {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

// =============================================================================
// LOADER
// =============================================================================

/// Loads history pages and conversation lists for one user.
pub struct HistoryLoader<A: RestApi> {
    api: A,
    me: UserId,
}

impl<A: RestApi> HistoryLoader<A> {
    /// Creates a loader for user `me`.
    pub const fn new(api: A, me: UserId) -> Self {
        Self { api, me }
    }

    /// The underlying API client.
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Fetch one page of the conversation with `counterpart`, oldest first.
    ///
    /// Records without an id, or that belong to another conversation, are
    /// dropped with a warning.
    ///
    /// # Errors
    ///
    /// Propagates the [`HistoryError`] of the request.
    pub async fn load_history(
        &self,
        counterpart: &UserId,
        page: u32,
        limit: u16,
    ) -> Result<Vec<Message>, HistoryError> {
        let limit = clamp_limit(limit);
        let records = self.api.fetch_messages(counterpart, page, limit).await?;
        let key = ConversationKey::between(&self.me, counterpart);
        let received = records.len();

        let mut messages: Vec<Message> = records
            .into_iter()
            .filter_map(|wire| match Message::from_wire(wire) {
                Ok(message) if message.conversation_key == key => Some(message),
                Ok(message) => {
                    tracing::warn!(id = %message.id, key = %key, "history record for another conversation dropped");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, counterpart = %counterpart, "malformed history record dropped");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m| m.created_at);

        tracing::debug!(
            counterpart = %counterpart,
            page,
            limit,
            received,
            kept = messages.len(),
            "history page loaded"
        );
        Ok(messages)
    }

    /// Fetch the conversation list.
    ///
    /// # Errors
    ///
    /// Propagates the [`HistoryError`] of the request.
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>, HistoryError> {
        let records = self.api.list_conversations().await?;
        Ok(records
            .into_iter()
            .map(|wire| Conversation::from_wire(&self.me, wire))
            .collect())
    }

    /// Tell the backend the conversation with `counterpart` has been read.
    ///
    /// # Errors
    ///
    /// Propagates the [`HistoryError`] of the request.
    pub async fn mark_read(&self, counterpart: &UserId) -> Result<(), HistoryError> {
        self.api.mark_read(counterpart).await
    }
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

/// [`RestApi`] over HTTPS with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpRestClient {
    /// Builds a client for `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidUrl`] for an unusable base URL and
    /// [`HistoryError::Network`] if the HTTP client cannot be built.
    pub fn new(
        api_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HistoryError> {
        let base = Url::parse(api_url)
            .map_err(|e| HistoryError::InvalidUrl(format!("{api_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(HistoryError::InvalidUrl(api_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| HistoryError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HistoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| HistoryError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_records<T: DeserializeOwned>(
        &self,
        url: Url,
        what: &str,
    ) -> Result<Vec<T>, HistoryError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HistoryError::Network(e.to_string()))?;
        let text = read_body(response).await?;
        parse_records(&text, what)
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, HistoryError> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(HistoryError::NotFound);
    }
    if !status.is_success() {
        return Err(HistoryError::Server {
            status: status.as_u16(),
        });
    }
    response
        .text()
        .await
        .map_err(|e| HistoryError::Network(e.to_string()))
}

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, HistoryError> {
    serde_json::from_str(text).map_err(|e| HistoryError::Decode(e.to_string()))
}

/// Decode a JSON array record by record. Records that do not decode are
/// dropped with a warning; only a body that is not an array fails.
fn parse_records<T: DeserializeOwned>(text: &str, what: &str) -> Result<Vec<T>, HistoryError> {
    let raw: Vec<serde_json::Value> = parse_json(text)?;
    let received = raw.len();
    let records: Vec<T> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, index, what, "malformed record dropped");
                None
            }
        })
        .collect();
    if records.len() < received {
        tracing::debug!(what, received, kept = records.len(), "page decoded with drops");
    }
    Ok(records)
}

impl RestApi for HttpRestClient {
    async fn list_conversations(&self) -> Result<Vec<WireConversation>, HistoryError> {
        let url = self.endpoint(&["conversations"])?;
        self.get_records(url, "conversation").await
    }

    async fn fetch_messages(
        &self,
        counterpart: &UserId,
        page: u32,
        limit: u16,
    ) -> Result<Vec<WireMessage>, HistoryError> {
        let mut url = self.endpoint(&["messages", counterpart.as_str()])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        self.get_records(url, "message").await
    }

    async fn mark_read(&self, counterpart: &UserId) -> Result<(), HistoryError> {
        let url = self.endpoint(&["conversations", counterpart.as_str(), "read"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HistoryError::Network(e.to_string()))?;
        read_body(response).await.map(|_| ())
    }
}

// =============================================================================
// IN-MEMORY API
// =============================================================================

#[derive(Default)]
struct MemoryState {
    messages: HashMap<UserId, Vec<WireMessage>>,
    conversations: Vec<WireConversation>,
    read_marks: Vec<UserId>,
    unavailable: bool,
}

/// [`RestApi`] served from memory, for tests and offline use.
///
/// Pages are cut newest first, like the backend: page 1 holds the most
/// recent `limit` messages.
#[derive(Default)]
pub struct InMemoryApi {
    state: parking_lot::Mutex<MemoryState>,
}

impl InMemoryApi {
    /// Creates an empty API.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add history for the conversation with `counterpart`.
    pub fn insert_messages(&self, counterpart: &UserId, messages: Vec<WireMessage>) {
        self.state
            .lock()
            .messages
            .entry(counterpart.clone())
            .or_default()
            .extend(messages);
    }

    /// Replace the conversation list.
    pub fn set_conversations(&self, conversations: Vec<WireConversation>) {
        self.state.lock().conversations = conversations;
    }

    /// Make every call fail with [`HistoryError::Network`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Counterparts passed to `mark_read`, in call order.
    #[must_use]
    pub fn read_marks(&self) -> Vec<UserId> {
        self.state.lock().read_marks.clone()
    }

    fn check(state: &MemoryState) -> Result<(), HistoryError> {
        if state.unavailable {
            return Err(HistoryError::Network("backend unavailable".into()));
        }
        Ok(())
    }
}

impl RestApi for InMemoryApi {
    async fn list_conversations(&self) -> Result<Vec<WireConversation>, HistoryError> {
        let state = self.state.lock();
        Self::check(&state)?;
        Ok(state.conversations.clone())
    }

    async fn fetch_messages(
        &self,
        counterpart: &UserId,
        page: u32,
        limit: u16,
    ) -> Result<Vec<WireMessage>, HistoryError> {
        let state = self.state.lock();
        Self::check(&state)?;
        let Some(all) = state.messages.get(counterpart) else {
            return Ok(Vec::new());
        };
        let mut newest_first = all.clone();
        newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = usize::from(limit);
        let skip = usize::try_from(page.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .saturating_mul(limit);
        Ok(newest_first.into_iter().skip(skip).take(limit).collect())
    }

    async fn mark_read(&self, counterpart: &UserId) -> Result<(), HistoryError> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state.read_marks.push(counterpart.clone());
        Ok(())
    }
}
