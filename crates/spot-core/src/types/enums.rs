//! Enumerations shared by the upstream session and the relay.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Link status (client-facing)
// ---------------------------------------------------------------------------

/// Upstream readiness as reported to downstream clients in `status` pushes.
///
/// The session's finer-grained lifecycle (`Authenticating`, `Reconnecting`)
/// is folded into [`LinkStatus::Connecting`] for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Directory loading policy
// ---------------------------------------------------------------------------

/// When the symbol directory's price scales are fetched from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryMode {
    /// Fetch every symbol's price scale during `connect()`.
    #[default]
    Eager,
    /// Fetch a symbol's price scale on its first subscribe and cache it
    /// until the next disconnect.
    Lazy,
}
