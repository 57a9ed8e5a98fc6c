//! Optimistic send pipeline.
//!
//! A send shows up in the timeline immediately as a provisional message and
//! ends in exactly one of two ways: the server's acknowledgement promotes it
//! in place, or any failure rolls it back and hands the draft back to the
//! caller for a retry.

use std::sync::Arc;

use tokio::task::JoinHandle;

use haggle_proto::message::{
    ConversationKey, MalformedRecord, Message, ProvisionalId, UserId, ValidationError,
    validate_draft,
};

use crate::config::SendConfig;
use crate::timeline::{Promotion, TimelineStore};
use crate::transport::manager::Connection;
use crate::transport::{AckError, TransportError};

use super::media::{MediaUploader, OutgoingAttachment, UploadError};

/// A message the user composed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Recipient.
    pub counterpart: UserId,
    /// Text body (may be empty when an attachment is present).
    pub body: String,
    /// File to upload before sending.
    pub attachment: Option<OutgoingAttachment>,
}

impl Draft {
    /// Text-only draft.
    pub fn text(counterpart: UserId, body: impl Into<String>) -> Self {
        Self {
            counterpart,
            body: body.into(),
            attachment: None,
        }
    }
}

/// Reasons a send did not complete.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The draft failed validation; nothing was inserted.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// There is no live connection; nothing was inserted.
    #[error("not connected")]
    NotConnected,

    /// The attachment could not be uploaded.
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    /// No acknowledgement arrived in time.
    #[error("send timed out")]
    Timeout,

    /// The server refused the message.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The link dropped before the acknowledgement.
    #[error("connection lost")]
    ConnectionLost,

    /// The acknowledgement carried an unusable message.
    #[error("malformed acknowledgement: {0}")]
    Malformed(#[from] MalformedRecord),

    /// The frame could not be queued.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The send task was cancelled.
    #[error("send aborted")]
    Aborted,
}

impl From<AckError> for SendError {
    fn from(err: AckError) -> Self {
        match err {
            AckError::Timeout => Self::Timeout,
            AckError::Rejected(reason) => Self::Rejected(reason),
            AckError::ConnectionLost => Self::ConnectionLost,
            AckError::NotSent(TransportError::NotConnected) => Self::NotConnected,
            AckError::NotSent(e) => Self::Transport(e),
        }
    }
}

/// A failed send, with the draft so the caller can offer a retry.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SendFailure {
    /// Provisional id that was rolled back, if one was inserted.
    pub provisional_id: Option<ProvisionalId>,
    /// The original draft.
    pub draft: Draft,
    /// What went wrong.
    #[source]
    pub error: SendError,
}

/// A completed send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Provisional id the message had while in flight.
    pub provisional_id: ProvisionalId,
    /// The confirmed message.
    pub message: Message,
    /// How the timeline took the confirmation.
    pub promotion: Promotion,
}

/// A send running in the background.
#[derive(Debug)]
pub struct PendingSend {
    /// Id of the provisional message already in the timeline.
    pub provisional_id: ProvisionalId,
    key: ConversationKey,
    draft: Draft,
    store: Arc<TimelineStore>,
    handle: JoinHandle<Result<SendReceipt, SendFailure>>,
}

impl PendingSend {
    /// Wait for the send to finish.
    ///
    /// # Errors
    ///
    /// Returns the [`SendFailure`] of the pipeline, or [`SendError::Aborted`]
    /// if the task was cancelled (the provisional message is rolled back).
    pub async fn outcome(self) -> Result<SendReceipt, SendFailure> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(id = %self.provisional_id, error = %e, "send task ended abnormally");
                self.store.rollback(&self.key, self.provisional_id);
                Err(SendFailure {
                    provisional_id: Some(self.provisional_id),
                    draft: self.draft,
                    error: SendError::Aborted,
                })
            }
        }
    }

    /// Cancel the send without waiting.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Runs the optimistic send pipeline against one connection.
pub struct OptimisticSender<U: MediaUploader> {
    connection: Connection,
    store: Arc<TimelineStore>,
    uploader: Arc<U>,
    config: SendConfig,
}

impl<U: MediaUploader> Clone for OptimisticSender<U> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            store: Arc::clone(&self.store),
            uploader: Arc::clone(&self.uploader),
            config: self.config,
        }
    }
}

impl<U: MediaUploader> OptimisticSender<U> {
    /// Creates a sender writing into `store`.
    pub const fn new(
        connection: Connection,
        store: Arc<TimelineStore>,
        uploader: Arc<U>,
        config: SendConfig,
    ) -> Self {
        Self {
            connection,
            store,
            uploader,
            config,
        }
    }

    /// Send `draft` and wait for the outcome.
    ///
    /// Pipeline:
    /// 1. Validate and check the connection (nothing is inserted on failure)
    /// 2. Insert the provisional message
    /// 3. Upload the attachment, if any
    /// 4. Send with acknowledgement
    /// 5. Promote on ack, roll back on any failure
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure`] carrying the draft. When `provisional_id` is
    /// set, the provisional message has already been removed.
    pub async fn send(&self, draft: Draft) -> Result<SendReceipt, SendFailure> {
        let id = self.begin(&draft)?;
        self.deliver(id, draft).await
    }

    /// Insert the provisional message now and finish the send in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure`] without a provisional id if the draft is
    /// invalid or there is no live connection.
    pub fn submit(&self, draft: Draft) -> Result<PendingSend, SendFailure> {
        let id = self.begin(&draft)?;
        let key = ConversationKey::between(self.connection.user_id(), &draft.counterpart);
        let this = self.clone();
        let task_draft = draft.clone();
        let handle = tokio::spawn(async move { this.deliver(id, task_draft).await });
        Ok(PendingSend {
            provisional_id: id,
            key,
            draft,
            store: Arc::clone(&self.store),
            handle,
        })
    }

    fn begin(&self, draft: &Draft) -> Result<ProvisionalId, SendFailure> {
        let fail = |error| SendFailure {
            provisional_id: None,
            draft: draft.clone(),
            error,
        };

        // Step 1: Validate, then refuse to go optimistic without a link
        validate_draft(&draft.body, draft.attachment.is_some())
            .map_err(|e| fail(SendError::Invalid(e)))?;
        if !self.connection.is_connected() {
            return Err(fail(SendError::NotConnected));
        }

        // Step 2: Provisional message with a pending preview
        let id = ProvisionalId::new();
        let message = Message::provisional(
            id,
            self.connection.user_id().clone(),
            draft.counterpart.clone(),
            draft.body.clone(),
            draft.attachment.as_ref().map(OutgoingAttachment::preview),
        );
        if !self.store.insert_provisional(message) {
            return Err(fail(SendError::Aborted));
        }
        tracing::debug!(%id, counterpart = %draft.counterpart, "provisional message inserted");
        Ok(id)
    }

    async fn deliver(&self, id: ProvisionalId, draft: Draft) -> Result<SendReceipt, SendFailure> {
        let key = ConversationKey::between(self.connection.user_id(), &draft.counterpart);
        match self.complete(&key, id, &draft).await {
            Ok((message, promotion)) => Ok(SendReceipt {
                provisional_id: id,
                message,
                promotion,
            }),
            Err(error) => {
                self.store.rollback(&key, id);
                tracing::warn!(%id, key = %key, error = %error, "send failed, provisional rolled back");
                Err(SendFailure {
                    provisional_id: Some(id),
                    draft,
                    error,
                })
            }
        }
    }

    async fn complete(
        &self,
        key: &ConversationKey,
        id: ProvisionalId,
        draft: &Draft,
    ) -> Result<(Message, Promotion), SendError> {
        // Step 3: Upload (the timeline may have been discarded meanwhile)
        let attachment = match &draft.attachment {
            Some(file) => {
                let uploaded = self.uploader.upload(file).await?;
                if !self.store.set_attachment(key, id, uploaded.clone()) {
                    tracing::debug!(%id, "upload finished after provisional left the timeline");
                }
                Some(uploaded)
            }
            None => None,
        };

        // Step 4: Send with acknowledgement
        let wire = self
            .connection
            .send_message(
                draft.counterpart.clone(),
                draft.body.clone(),
                attachment,
                id,
                self.config.ack_timeout,
            )
            .await?;

        // Step 5: Promote in place
        let mut confirmed = Message::from_wire(wire)?;
        confirmed.client_ref.get_or_insert(id);
        let promotion = self.store.promote(id, confirmed.clone());
        Ok((confirmed, promotion))
    }
}
