//! Event types flowing out of the upstream provider and session.
//!
//! A provider pushes raw [`ProviderEvent`]s on a bounded channel created
//! per connection (see [`event_channel`]). The session decodes them into [`SessionEvent`]s for the
//! relay: spot ticks become decimal [`PriceUpdate`]s, closures tear the
//! session down.

use spot_core::types::PriceUpdate;

/// A raw push from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Spot quote in integer ticks. Either side may be absent when only the
    /// other one changed.
    Spot {
        symbol_id: u64,
        bid: Option<i64>,
        ask: Option<i64>,
    },

    /// The transport closed or the provider ended the session.
    Closed {
        /// Human-readable reason.
        reason: String,
    },

    /// A non-fatal provider error.
    Error {
        /// Error description.
        message: String,
    },
}

/// A decoded event emitted by [`UpstreamSession`](crate::UpstreamSession).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Price update ready for fan-out.
    Price(PriceUpdate),

    /// The session left `Ready` because the transport dropped.
    Disconnected {
        /// Human-readable reason.
        reason: String,
    },

    /// A non-fatal provider error.
    Error {
        /// Error description.
        message: String,
    },
}

/// Pushes buffered per connection before providers start dropping ticks.
pub const EVENT_QUEUE_CAPACITY: usize = 4096;

/// Sender half of a provider's event channel.
pub type ProviderEventSender = tokio::sync::mpsc::Sender<ProviderEvent>;

/// Receiver half of a provider's event channel.
pub type ProviderEventReceiver = tokio::sync::mpsc::Receiver<ProviderEvent>;

/// Create the event channel for one provider connection.
///
/// Providers must not block on a full queue: spot ticks are dropped with
/// `try_send` (the next tick supersedes them), so request responses keep
/// flowing while the relay catches up.
pub fn event_channel() -> (ProviderEventSender, ProviderEventReceiver) {
    tokio::sync::mpsc::channel(EVENT_QUEUE_CAPACITY)
}
