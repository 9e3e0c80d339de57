//! # spot-upstream
//!
//! The single upstream market-data session and the provider boundary it
//! drives.
//!
//! - [`Provider`] — the opaque upstream contract (transport, auth, symbol
//!   directory, spot subscriptions, heartbeat). Any implementation, real or
//!   mock, that satisfies it can back the relay.
//! - [`session::UpstreamSession`] — lifecycle state machine, symbol directory,
//!   tick decoding and request timeouts on top of a `Provider`.
//! - [`ctrader::CTraderProvider`] — cTrader Open API over JSON WebSocket.
//! - [`mock::MockProvider`] — scriptable in-memory provider for tests.
//!
//! ## Lifecycle
//!
//! 1. Construct a provider and hand it to [`UpstreamSession::new`].
//! 2. [`connect`](UpstreamSession::connect) opens, authenticates twice and
//!    loads the directory.
//! 3. Subscribe/unsubscribe by symbol name; poll
//!    [`next_event`](UpstreamSession::next_event) for provider pushes.
//! 4. [`disconnect`](UpstreamSession::disconnect) for a deliberate teardown.

pub mod ctrader;
pub mod directory;
pub mod event;
pub mod mock;
pub mod session;

use async_trait::async_trait;
use spot_core::{error::UpstreamError, types::Symbol};

pub use event::{
    ProviderEvent, ProviderEventReceiver, ProviderEventSender, SessionEvent, event_channel,
};
pub use session::{SessionReady, SessionState, UpstreamSession};

/// Price scale for one symbol, returned by [`Provider::symbol_details`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolScale {
    pub id: u64,
    pub price_scale: u32,
}

/// Upstream provider contract.
///
/// Calls are issued sequentially by the owning [`UpstreamSession`], which
/// applies its own request timeout around each one. Only `Send` is required
/// because the session is owned by a single task.
#[async_trait]
pub trait Provider: Send {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Open the transport. Returns the receiver for inbound pushes of this
    /// connection; it yields [`ProviderEvent::Closed`] when the transport
    /// drops.
    async fn open(&mut self) -> Result<ProviderEventReceiver, UpstreamError>;

    /// Application-level credentials exchange.
    async fn authenticate_application(
        &mut self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), UpstreamError>;

    /// Account-level token exchange.
    async fn authenticate_account(
        &mut self,
        access_token: &str,
        account_id: u64,
    ) -> Result<(), UpstreamError>;

    /// Every tradable instrument. `price_scale` may be `None` when the
    /// provider's list omits it; see [`symbol_details`](Provider::symbol_details).
    async fn list_symbols(&mut self) -> Result<Vec<Symbol>, UpstreamError>;

    /// Price scales for the given symbol ids.
    async fn symbol_details(&mut self, ids: &[u64]) -> Result<Vec<SymbolScale>, UpstreamError>;

    /// Start spot pushes for the given ids.
    async fn subscribe(&mut self, ids: &[u64]) -> Result<(), UpstreamError>;

    /// Stop spot pushes for the given ids.
    async fn unsubscribe(&mut self, ids: &[u64]) -> Result<(), UpstreamError>;

    /// No-payload keep-alive.
    async fn send_heartbeat(&mut self) -> Result<(), UpstreamError>;

    /// Close the transport. Idempotent.
    async fn close(&mut self);
}
