//! Request/response side of a conversation.
//!
//! - [`history`]: paginated REST history and the conversation list
//! - [`media`]: attachment uploads
//! - [`send`]: the optimistic send pipeline
//!
//! Everything here talks to the backend through a trait ([`RestApi`],
//! [`MediaUploader`]) or the shared [`Connection`](crate::transport::manager::Connection),
//! so tests run against the in-memory implementations.

pub mod history;
pub mod media;
pub mod send;

pub use history::{HistoryError, HistoryLoader, HttpRestClient, InMemoryApi, RestApi};
pub use media::{
    HttpMediaUploader, InMemoryUploader, MediaUploader, OutgoingAttachment, UploadError,
};
pub use send::{Draft, OptimisticSender, PendingSend, SendError, SendFailure, SendReceipt};
