//! Market data flowing from the upstream session to the relay.
//!
//! # Timestamp convention
//!
//! `timestamp_ms` is the relay's wall-clock receipt time in **milliseconds
//! since Unix epoch**; the provider's spot events carry no timestamp.

/// A decoded best bid/ask update for one symbol.
///
/// Ephemeral: consumed immediately by fan-out, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp_ms: u64,
}

impl std::fmt::Display for PriceUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Price({} bid={} ask={} ts={})",
            self.symbol, self.bid, self.ask, self.timestamp_ms
        )
    }
}
