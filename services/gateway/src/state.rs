//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources: the session registry, the connection pool, the token
//! cache and the loaded configuration.

use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use crate::tokens::TokenCache;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all
/// handlers and detectors.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub pool: Arc<ConnectionPool>,
    pub tokens: TokenCache,
    pub config: Arc<Config>,
}
