//! Keywarden Server Library
//!
//! Stateless request handlers in front of a relational store. The server
//! only ever sees sealed field bytes: all item secrets are ciphertext
//! under a key the server cannot unwrap.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod storage;

use auth::TokenAuthority;
use std::sync::Arc;
use storage::Storage;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub tokens: Arc<TokenAuthority>,
}

#[cfg(test)]
mod test_support {
    use super::*;
    use std::time::Duration;

    /// Fresh in-memory application state for handler tests.
    pub fn test_state() -> AppState {
        AppState {
            storage: Storage::in_memory(1024).unwrap(),
            tokens: Arc::new(TokenAuthority::new(
                *b"0123456789abcdef0123456789abcdef",
                Duration::from_secs(60),
            )),
        }
    }
}
