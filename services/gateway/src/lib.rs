//! Parley Gateway Library Crate
//!
//! This library contains the session/connection lifecycle manager for
//! real-time avatar conversations: per-client session state machines, the
//! reconnection arbiter, the pre-warmed connection pool, the streaming chat
//! relay, and the REST/websocket surface the browser talks to. The
//! `gateway` binary is a thin wrapper around this library.

pub mod config;
pub mod detectors;
pub mod handlers;
pub mod models;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;
pub mod stt;
pub mod synthesis;
pub mod tokens;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;
