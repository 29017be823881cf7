//! Real-time broadcast chat hub.
//!
//! Clients connect over WebSocket with the `chat` subprotocol at `/<nickname>`.
//! Every text frame a client sends is relayed to all connected clients as
//! `{"type":"message","data":...}`, and membership changes are followed by a
//! `{"type":"nicks","data":[...]}` roster.

pub mod broadcast;
pub mod config;
pub mod connection_limiter;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::serve;
