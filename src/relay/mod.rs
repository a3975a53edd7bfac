//! Line-based chat relay.
//!
//! Clients connect over TCP, receive a numeric identity and exchange text lines through
//! the relay, which supports broadcast, direct addressing, one admin and kicking.
//!
//! ## Architecture
//!
//! - `identity`: connection identities and their allocator
//! - `codec`: envelope framing, command grammar, line charset coding
//! - `connection`: one accepted socket, its lifecycle and receive loop
//! - `admin`: the single admin slot
//! - `notices`: texts of relay-originated notices
//! - `registry`: listener, live-connection table and routing

pub mod admin;
pub mod codec;
pub mod connection;
pub mod identity;
pub mod notices;
mod registry;

pub use connection::{Connection, ConnectionState, LineHandler};
pub use identity::{ConnectionId, IdAllocator};
pub use notices::Language;
pub use registry::{Registry, ServerState};
