//! Media uploads for message attachments.
//!
//! The backend stores files behind `POST {api}/media` and answers with the
//! public URL. Uploads happen before the `send_message` frame goes out; the
//! provisional message shows a local preview with `pending = true` meanwhile.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use haggle_proto::message::{Attachment, AttachmentKind};

/// Largest file accepted for upload (25 MiB).
pub const MAX_UPLOAD_SIZE: usize = 25 * 1024 * 1024;

/// A file picked by the user, not uploaded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    /// Original file name.
    pub file_name: String,
    /// MIME type sent with the multipart part.
    pub content_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
    /// Kind shown in the timeline.
    pub kind: AttachmentKind,
}

impl OutgoingAttachment {
    /// Creates an attachment, inferring its kind from the MIME type.
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let content_type = content_type.into();
        let kind = if content_type.starts_with("image/") {
            AttachmentKind::Image
        } else if content_type.starts_with("video/") {
            AttachmentKind::Video
        } else {
            AttachmentKind::File
        };
        Self {
            file_name: file_name.into(),
            content_type,
            bytes,
            kind,
        }
    }

    /// Placeholder URL shown until the upload completes.
    #[must_use]
    pub fn preview_url(&self) -> String {
        format!("local://{}", self.file_name)
    }

    /// The pending attachment placed on the provisional message.
    #[must_use]
    pub fn preview(&self) -> Attachment {
        Attachment {
            url: self.preview_url(),
            kind: self.kind,
            pending: true,
        }
    }
}

/// Errors from uploading an attachment.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The file exceeds [`MAX_UPLOAD_SIZE`].
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size.
        size: usize,
        /// Allowed size.
        max: usize,
    },

    /// The request did not complete.
    #[error("network error: {0}")]
    Network(String),

    /// The media service refused the file.
    #[error("upload rejected: status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The response body was not the expected JSON.
    #[error("malformed upload response: {0}")]
    Decode(String),

    /// The configured API URL is unusable.
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}

/// Stores an attachment and returns its public reference.
pub trait MediaUploader: Send + Sync + 'static {
    /// Upload `file`; the returned attachment has `pending = false`.
    fn upload(
        &self,
        file: &OutgoingAttachment,
    ) -> impl Future<Output = Result<Attachment, UploadError>> + Send;
}

impl<T: MediaUploader> MediaUploader for Arc<T> {
    fn upload(
        &self,
        file: &OutgoingAttachment,
    ) -> impl Future<Output = Result<Attachment, UploadError>> + Send {
        (**self).upload(file)
    }
}

// =============================================================================
// HTTP UPLOADER
// =============================================================================

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
    #[serde(default)]
    kind: Option<AttachmentKind>,
}

/// [`MediaUploader`] posting multipart forms to `{api}/media`.
#[derive(Debug, Clone)]
pub struct HttpMediaUploader {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl HttpMediaUploader {
    /// Builds an uploader for `api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidUrl`] for an unusable base URL and
    /// [`UploadError::Network`] if the HTTP client cannot be built.
    pub fn new(
        api_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let mut endpoint = Url::parse(api_url)
            .map_err(|e| UploadError::InvalidUrl(format!("{api_url}: {e}")))?;
        endpoint
            .path_segments_mut()
            .map_err(|()| UploadError::InvalidUrl(api_url.to_string()))?
            .pop_if_empty()
            .push("media");
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Network(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            token: token.into(),
        })
    }
}

impl MediaUploader for HttpMediaUploader {
    async fn upload(&self, file: &OutgoingAttachment) -> Result<Attachment, UploadError> {
        check_size(file)?;

        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)
            .map_err(|e| UploadError::Network(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }
        let text = response
            .text()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;
        let attachment = parse_upload_response(&text, file.kind)?;

        tracing::debug!(
            file_name = %file.file_name,
            size = file.bytes.len(),
            url = %attachment.url,
            "attachment uploaded"
        );
        Ok(attachment)
    }
}

fn check_size(file: &OutgoingAttachment) -> Result<(), UploadError> {
    if file.bytes.len() > MAX_UPLOAD_SIZE {
        return Err(UploadError::TooLarge {
            size: file.bytes.len(),
            max: MAX_UPLOAD_SIZE,
        });
    }
    Ok(())
}

fn parse_upload_response(text: &str, fallback: AttachmentKind) -> Result<Attachment, UploadError> {
    let response: UploadResponse =
        serde_json::from_str(text).map_err(|e| UploadError::Decode(e.to_string()))?;
    if response.url.trim().is_empty() {
        return Err(UploadError::Decode("empty url".into()));
    }
    Ok(Attachment {
        url: response.url,
        kind: response.kind.unwrap_or(fallback),
        pending: false,
    })
}

// =============================================================================
// IN-MEMORY UPLOADER
// =============================================================================

/// [`MediaUploader`] that keeps files in memory and can be told to fail.
#[derive(Debug, Default)]
pub struct InMemoryUploader {
    stored: parking_lot::Mutex<Vec<OutgoingAttachment>>,
    failing: AtomicBool,
}

impl InMemoryUploader {
    /// Creates an uploader that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every upload with status 503 while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Names of the files stored so far.
    #[must_use]
    pub fn stored(&self) -> Vec<String> {
        self.stored
            .lock()
            .iter()
            .map(|file| file.file_name.clone())
            .collect()
    }
}

impl MediaUploader for InMemoryUploader {
    async fn upload(&self, file: &OutgoingAttachment) -> Result<Attachment, UploadError> {
        check_size(file)?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(UploadError::Rejected { status: 503 });
        }
        let mut stored = self.stored.lock();
        stored.push(file.clone());
        Ok(Attachment {
            url: format!("memory://{}/{}", stored.len(), file.file_name),
            kind: file.kind,
            pending: false,
        })
    }
}
