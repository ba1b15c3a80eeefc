//! Real-time task chat and notification delivery.
//!
//! The server half is an actix hub ([`chat_server::ChatServer`]) fed by
//! per-socket actors, with a send path in [`delivery`] and persist-then-push
//! notifications in [`notifications`]. The [`client`] half keeps a
//! reconnecting session and an optimistic per-room message view.

pub mod app_state;
pub mod auth;
pub mod chat;
pub mod chat_db;
pub mod chat_server;
pub mod client;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod models;
pub mod notifications;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod store;
pub mod web_socket_server;

#[cfg(test)]
pub(crate) mod test_support;
