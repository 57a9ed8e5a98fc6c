//! `Haggle` — conversation synchronization engine for marketplace chat.
//!
//! Keeps each conversation's message timeline consistent across REST
//! history, socket pushes and optimistic local sends, tracks the offer
//! negotiation embedded in messages, and projects typing and presence.
//! [`engine::SyncEngine`] wires the pieces together for one session.

pub mod chat;
pub mod config;
pub mod directory;
pub mod engine;
pub mod offer;
pub mod presence;
pub mod timeline;
pub mod transport;
pub mod typing;
