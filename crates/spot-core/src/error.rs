//! Typed error definitions for the spot relay.
//!
//! [`UpstreamError`] is the taxonomy shared by the upstream session and the
//! relay: every variant either rolls back registry state or is surfaced to
//! clients as a response / status message. All variants implement
//! `std::error::Error` via `thiserror`, so they integrate with `anyhow::Result`.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the upstream session and its provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Application credentials or account token rejected (or the exchange
    /// timed out). Fatal to the current connection attempt.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Symbol name is not in the current directory.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Upstream action attempted while the session is not `Ready`.
    #[error("upstream session not ready")]
    NotReady,

    /// Upstream connection dropped or could not be opened.
    #[error("upstream transport closed: {0}")]
    TransportClosed(String),

    /// Request/response exchange did not complete in time.
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// Provider answered with an error payload.
    #[error("upstream rejected request: {0}")]
    Rejected(String),

    /// Malformed or unexpected provider payload.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Whether this error means the connection itself is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::TransportClosed(_))
    }
}
