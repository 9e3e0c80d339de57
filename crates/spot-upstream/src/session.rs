//! The single upstream market-data session.
//!
//! [`UpstreamSession`] owns a boxed [`Provider`] and layers on top of it:
//!
//! 1. The lifecycle state machine
//!    `Disconnected → Connecting → Authenticating → Ready`, with any state
//!    falling back to `Disconnected` on transport failure and
//!    `Disconnected → Reconnecting → Connecting` driven by the supervisor.
//! 2. The symbol directory (name ↔ id ↔ price scale), rebuilt on every
//!    connect and cleared on every disconnect.
//! 3. A request timeout around every provider call.
//! 4. Tick decoding: integer ticks → decimal [`PriceUpdate`]s.
//!
//! The session does not deduplicate subscriptions; the relay's registry
//! guarantees at most one upstream call per symbol transition.

use std::future::Future;
use std::time::Duration;

use ahash::AHashMap;
use spot_core::{
    config::UpstreamConfig,
    error::UpstreamError,
    time_util,
    types::{DirectoryMode, LinkStatus, PriceUpdate, scale_price},
};
use tracing::{debug, error, info, warn};

use crate::directory::SymbolDirectory;
use crate::{Provider, ProviderEvent, ProviderEventReceiver, SessionEvent};

/// Maximum ids per symbol-detail request during eager directory loading.
const DETAIL_CHUNK: usize = 100;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Upstream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

impl SessionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting | Authenticating | Ready | Reconnecting, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Ready)
        )
    }

    /// Status reported to clients.
    pub fn link_status(self) -> LinkStatus {
        match self {
            Self::Disconnected => LinkStatus::Disconnected,
            Self::Ready => LinkStatus::Ready,
            Self::Connecting | Self::Authenticating | Self::Reconnecting => LinkStatus::Connecting,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Successful outcome of [`UpstreamSession::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReady {
    /// Every symbol name in the freshly loaded directory, sorted.
    pub symbols: Vec<String>,
}

/// Last known integer quote per symbol id.
#[derive(Debug, Clone, Copy, Default)]
struct Quote {
    bid: Option<i64>,
    ask: Option<i64>,
}

// ---------------------------------------------------------------------------
// UpstreamSession
// ---------------------------------------------------------------------------

/// Stateful wrapper around the upstream [`Provider`].
pub struct UpstreamSession {
    provider: Box<dyn Provider>,
    config: UpstreamConfig,
    state: SessionState,
    directory: SymbolDirectory,
    quotes: AHashMap<u64, Quote>,
    /// Inbound pushes of the current connection; `None` while disconnected.
    events: Option<ProviderEventReceiver>,
}

impl UpstreamSession {
    /// Create a disconnected session. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(provider: Box<dyn Provider>, config: UpstreamConfig) -> Self {
        Self {
            provider,
            config,
            state: SessionState::Disconnected,
            directory: SymbolDirectory::new(),
            quotes: AHashMap::new(),
            events: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn directory(&self) -> &SymbolDirectory {
        &self.directory
    }

    /// Symbol names clients may subscribe to; empty unless `Ready`.
    pub fn available_symbols(&self) -> Vec<String> {
        if self.is_ready() {
            self.directory.names()
        } else {
            Vec::new()
        }
    }

    /// Validate a client-requested symbol without touching the provider.
    pub fn check_symbol(&self, name: &str) -> Result<(), UpstreamError> {
        self.resolve(name).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Enter `Reconnecting` ahead of a supervisor-driven [`connect`](Self::connect).
    pub fn begin_reconnect(&mut self) -> bool {
        self.transition(SessionState::Reconnecting)
    }

    /// Open the transport, authenticate (application, then account) and load
    /// the symbol directory.
    ///
    /// On any failure the transport is closed and the session returns to
    /// `Disconnected`. Rejected or timed-out credential exchanges surface as
    /// [`UpstreamError::Auth`].
    pub async fn connect(&mut self) -> Result<SessionReady, UpstreamError> {
        if !matches!(self.state, SessionState::Disconnected | SessionState::Reconnecting) {
            warn!("[session] connect() while {}, tearing down first", self.state);
            self.teardown().await;
        }
        self.transition(SessionState::Connecting);
        info!("[session] connecting via {}", self.provider.name());

        let limit = self.config.request_timeout();
        match bounded(limit, self.provider.open()).await {
            Ok(rx) => self.events = Some(rx),
            Err(e) => {
                error!("[session] transport open failed: {e}");
                self.teardown().await;
                return Err(e);
            }
        }

        if let Err(e) = self.authenticate().await {
            error!("[session] {e}");
            self.teardown().await;
            return Err(e);
        }

        if let Err(e) = self.load_directory().await {
            error!("[session] symbol directory load failed: {e}");
            self.teardown().await;
            return Err(e);
        }

        self.transition(SessionState::Ready);
        let symbols = self.directory.names();
        info!("[session] ready with {} symbols", symbols.len());
        Ok(SessionReady { symbols })
    }

    /// Deliberate teardown (shutdown or operator request).
    pub async fn disconnect(&mut self) {
        info!("[session] disconnecting");
        self.teardown().await;
    }

    /// Transport-failure path: same cleanup as [`disconnect`](Self::disconnect),
    /// logged as a loss rather than a request.
    pub async fn mark_closed(&mut self, reason: &str) {
        warn!("[session] transport closed: {reason}");
        self.teardown().await;
    }

    async fn authenticate(&mut self) -> Result<(), UpstreamError> {
        self.transition(SessionState::Authenticating);
        let limit = self.config.request_timeout();

        let UpstreamConfig {
            client_id,
            client_secret,
            access_token,
            account_id,
            ..
        } = &self.config;

        let application = self.provider.authenticate_application(client_id, client_secret);
        bounded(limit, application)
            .await
            .map_err(|e| auth_failure("application", e))?;
        debug!("[session] application authenticated");

        let account = self.provider.authenticate_account(access_token, *account_id);
        bounded(limit, account)
            .await
            .map_err(|e| auth_failure("account", e))?;
        info!("[session] account {} authenticated", self.config.account_id);
        Ok(())
    }

    async fn load_directory(&mut self) -> Result<(), UpstreamError> {
        let limit = self.config.request_timeout();
        let symbols = bounded(limit, self.provider.list_symbols()).await?;
        self.directory.load(symbols);

        if self.config.directory_mode == DirectoryMode::Eager {
            let missing = self.directory.missing_scales();
            for chunk in missing.chunks(DETAIL_CHUNK) {
                let scales = bounded(limit, self.provider.symbol_details(chunk)).await?;
                self.directory.apply_scales(&scales);
            }
            let unresolved = self.directory.missing_scales().len();
            if unresolved > 0 {
                warn!("[session] no price scale for {unresolved} symbols, their ticks are dropped");
            }
        }

        info!(
            "[session] directory loaded: {} symbols ({:?} mode)",
            self.directory.len(),
            self.config.directory_mode
        );
        Ok(())
    }

    /// Close the provider and forget everything tied to the connection.
    async fn teardown(&mut self) {
        self.provider.close().await;
        self.events = None;
        self.directory.clear();
        self.quotes.clear();
        if self.state != SessionState::Disconnected {
            self.transition(SessionState::Disconnected);
        }
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("[session] illegal transition {} -> {next}", self.state);
            return false;
        }
        debug!("[session] {} -> {next}", self.state);
        self.state = next;
        true
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Start upstream spot pushes for `name`.
    ///
    /// In lazy directory mode the symbol's price scale is fetched first.
    pub async fn subscribe_symbol(&mut self, name: &str) -> Result<(), UpstreamError> {
        let id = self.resolve(name)?;
        let limit = self.config.request_timeout();

        if self.directory.by_id(id).is_some_and(|s| s.price_scale.is_none()) {
            let scales = bounded(limit, self.provider.symbol_details(&[id])).await?;
            if self.directory.apply_scales(&scales) == 0 {
                return Err(UpstreamError::Protocol(format!("no price scale returned for {name}")));
            }
        }

        bounded(limit, self.provider.subscribe(&[id])).await?;
        debug!("[session] subscribed {name} (id={id})");
        Ok(())
    }

    /// Stop upstream spot pushes for `name`.
    pub async fn unsubscribe_symbol(&mut self, name: &str) -> Result<(), UpstreamError> {
        let id = self.resolve(name)?;
        let limit = self.config.request_timeout();
        bounded(limit, self.provider.unsubscribe(&[id])).await?;
        self.quotes.remove(&id);
        debug!("[session] unsubscribed {name} (id={id})");
        Ok(())
    }

    /// Send one keep-alive. Only meaningful while `Ready`.
    pub async fn heartbeat(&mut self) -> Result<(), UpstreamError> {
        if !self.is_ready() {
            return Err(UpstreamError::NotReady);
        }
        let limit = self.config.request_timeout();
        bounded(limit, self.provider.send_heartbeat()).await
    }

    fn resolve(&self, name: &str) -> Result<u64, UpstreamError> {
        if !self.is_ready() {
            return Err(UpstreamError::NotReady);
        }
        self.directory
            .get(name)
            .map(|s| s.id)
            .ok_or_else(|| UpstreamError::UnknownSymbol(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------------

    /// Wait for the next provider push. Pends forever while disconnected.
    ///
    /// Cancel-safe: suitable as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> ProviderEvent {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await.unwrap_or_else(|| ProviderEvent::Closed {
                reason: "provider event stream ended".into(),
            }),
            None => std::future::pending().await,
        }
    }

    /// Apply a provider push to the session and decode it for the relay.
    ///
    /// `Closed` tears the session down; spot ticks for unknown ids are
    /// dropped.
    pub async fn handle_event(&mut self, event: ProviderEvent) -> Option<SessionEvent> {
        match event {
            ProviderEvent::Spot { symbol_id, bid, ask } => {
                self.decode_spot(symbol_id, bid, ask).map(SessionEvent::Price)
            }
            ProviderEvent::Closed { reason } => {
                self.mark_closed(&reason).await;
                Some(SessionEvent::Disconnected { reason })
            }
            ProviderEvent::Error { message } => {
                warn!("[session] provider error: {message}");
                Some(SessionEvent::Error { message })
            }
        }
    }

    /// Merge a (possibly one-sided) tick into the last quote and convert it
    /// to decimal. Returns `None` for unknown ids, unknown scales, or while
    /// one side has never been seen.
    pub fn decode_spot(
        &mut self,
        symbol_id: u64,
        bid: Option<i64>,
        ask: Option<i64>,
    ) -> Option<PriceUpdate> {
        let Some(sym) = self.directory.by_id(symbol_id) else {
            warn!("[session] dropping tick for unknown symbol id {symbol_id}");
            return None;
        };
        let Some(scale) = sym.price_scale else {
            warn!("[session] dropping tick for {}: price scale not loaded", sym.name);
            return None;
        };

        let quote = self.quotes.entry(symbol_id).or_default();
        if bid.is_some() {
            quote.bid = bid;
        }
        if ask.is_some() {
            quote.ask = ask;
        }
        let (Some(b), Some(a)) = (quote.bid, quote.ask) else {
            debug!("[session] {} waiting for both quote sides", sym.name);
            return None;
        };

        Some(PriceUpdate {
            symbol: sym.name.clone(),
            bid: scale_price(b, scale),
            ask: scale_price(a, scale),
            timestamp_ms: time_util::now_ms(),
        })
    }
}

/// Run `fut` with a deadline, mapping expiry to [`UpstreamError::Timeout`].
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(UpstreamError::Timeout(limit)))
}

/// Credential exchanges that fail for any reason other than a dropped
/// transport count as authentication failures.
fn auth_failure(stage: &str, e: UpstreamError) -> UpstreamError {
    match e {
        UpstreamError::TransportClosed(_) | UpstreamError::Auth(_) => e,
        other => UpstreamError::Auth(format!("{stage} auth: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use spot_core::types::Symbol;

    use super::*;
    use crate::mock::{MockControl, MockProvider, ProviderCall};

    fn symbols() -> Vec<Symbol> {
        vec![
            Symbol::new("EURUSD", 1, Some(5)),
            Symbol::new("GBPUSD", 2, Some(5)),
            Symbol::new("USDJPY", 4, Some(3)),
        ]
    }

    fn config(mode: DirectoryMode) -> UpstreamConfig {
        UpstreamConfig {
            client_id: "app".into(),
            client_secret: "secret".into(),
            access_token: "token".into(),
            account_id: 99,
            request_timeout_ms: 100,
            directory_mode: mode,
            ..Default::default()
        }
    }

    fn session(mode: DirectoryMode) -> (UpstreamSession, MockControl) {
        let (provider, control) = MockProvider::new(symbols());
        (UpstreamSession::new(Box::new(provider), config(mode)), control)
    }

    #[test]
    fn transition_table() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Disconnected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Ready));
        for s in [Connecting, Authenticating, Ready, Reconnecting] {
            assert!(s.can_transition_to(Disconnected));
        }
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Disconnected));
    }

    #[test]
    fn link_status_folds_intermediate_states() {
        assert_eq!(SessionState::Authenticating.link_status(), LinkStatus::Connecting);
        assert_eq!(SessionState::Reconnecting.link_status(), LinkStatus::Connecting);
        assert_eq!(SessionState::Ready.link_status(), LinkStatus::Ready);
    }

    #[tokio::test]
    async fn connect_authenticates_in_order_and_loads_directory() {
        let (mut s, control) = session(DirectoryMode::Eager);
        let ready = s.connect().await.unwrap();
        assert_eq!(ready.symbols, vec!["EURUSD", "GBPUSD", "USDJPY"]);
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(
            control.calls(),
            vec![
                ProviderCall::Open,
                ProviderCall::AuthApplication { client_id: "app".into() },
                ProviderCall::AuthAccount { account_id: 99 },
                ProviderCall::ListSymbols,
            ]
        );
    }

    #[tokio::test]
    async fn rejected_application_auth_returns_to_disconnected() {
        let (mut s, control) = session(DirectoryMode::Eager);
        control.set_reject_application(true);
        let err = s.connect().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Auth(_)));
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.directory().is_empty());
        assert!(!control.is_open());
        assert_eq!(control.calls().last(), Some(&ProviderCall::Close));
        assert!(!control.calls().contains(&ProviderCall::AuthAccount { account_id: 99 }));
    }

    #[tokio::test]
    async fn rejected_account_auth_is_auth_error() {
        let (mut s, control) = session(DirectoryMode::Eager);
        control.set_reject_account(true);
        assert!(matches!(s.connect().await, Err(UpstreamError::Auth(_))));
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_transport_is_not_auth_error() {
        let (mut s, control) = session(DirectoryMode::Eager);
        control.set_fail_open(true);
        assert!(matches!(s.connect().await, Err(UpstreamError::TransportClosed(_))));
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_path_goes_through_reconnecting() {
        let (mut s, _control) = session(DirectoryMode::Eager);
        assert!(s.begin_reconnect());
        assert_eq!(s.state(), SessionState::Reconnecting);
        s.connect().await.unwrap();
        assert!(s.is_ready());
        assert!(!s.begin_reconnect());
    }

    #[tokio::test]
    async fn subscribe_requires_ready_and_known_symbol() {
        let (mut s, control) = session(DirectoryMode::Eager);
        assert_eq!(s.subscribe_symbol("EURUSD").await, Err(UpstreamError::NotReady));
        s.connect().await.unwrap();
        assert_eq!(
            s.subscribe_symbol("BOGUS").await,
            Err(UpstreamError::UnknownSymbol("BOGUS".into()))
        );
        s.subscribe_symbol("EURUSD").await.unwrap();
        s.unsubscribe_symbol("EURUSD").await.unwrap();
        assert_eq!(control.subscribe_count(1), 1);
        assert_eq!(control.unsubscribe_count(1), 1);
    }

    #[tokio::test]
    async fn session_does_not_deduplicate() {
        let (mut s, control) = session(DirectoryMode::Eager);
        s.connect().await.unwrap();
        s.subscribe_symbol("EURUSD").await.unwrap();
        s.subscribe_symbol("EURUSD").await.unwrap();
        assert_eq!(control.subscribe_count(1), 2);
    }

    #[tokio::test]
    async fn slow_subscribe_times_out() {
        let (mut s, control) = session(DirectoryMode::Eager);
        s.connect().await.unwrap();
        control.set_response_delay(Some(Duration::from_millis(500)));
        assert_eq!(
            s.subscribe_symbol("EURUSD").await,
            Err(UpstreamError::Timeout(Duration::from_millis(100)))
        );
    }

    #[tokio::test]
    async fn eager_mode_loads_missing_scales_at_connect() {
        let (mut s, control) = session(DirectoryMode::Eager);
        control.set_light_directory(true);
        s.connect().await.unwrap();
        assert!(control.calls().contains(&ProviderCall::SymbolDetails(vec![1, 2, 4])));
        assert!(s.directory().missing_scales().is_empty());
        control.clear_calls();
        s.subscribe_symbol("USDJPY").await.unwrap();
        assert_eq!(control.calls(), vec![ProviderCall::Subscribe(vec![4])]);
    }

    #[tokio::test]
    async fn lazy_mode_loads_scale_on_first_subscribe() {
        let (mut s, control) = session(DirectoryMode::Lazy);
        control.set_light_directory(true);
        s.connect().await.unwrap();
        assert!(!control.calls().iter().any(|c| matches!(c, ProviderCall::SymbolDetails(_))));

        control.clear_calls();
        s.subscribe_symbol("USDJPY").await.unwrap();
        assert_eq!(
            control.calls(),
            vec![ProviderCall::SymbolDetails(vec![4]), ProviderCall::Subscribe(vec![4])]
        );

        control.clear_calls();
        s.unsubscribe_symbol("USDJPY").await.unwrap();
        s.subscribe_symbol("USDJPY").await.unwrap();
        assert_eq!(
            control.calls(),
            vec![ProviderCall::Unsubscribe(vec![4]), ProviderCall::Subscribe(vec![4])]
        );
    }

    #[tokio::test]
    async fn ticks_are_scaled_and_merged() {
        let (mut s, _control) = session(DirectoryMode::Eager);
        s.connect().await.unwrap();

        let p = s.decode_spot(4, Some(151_234), Some(151_250)).unwrap();
        assert_eq!(p.symbol, "USDJPY");
        assert!((p.bid - 151.234).abs() < 1e-9);
        assert!((p.ask - 151.250).abs() < 1e-9);

        // Ask-only update keeps the previous bid.
        let p = s.decode_spot(4, None, Some(151_260)).unwrap();
        assert!((p.bid - 151.234).abs() < 1e-9);
        assert!((p.ask - 151.260).abs() < 1e-9);

        // One-sided first tick is held back.
        assert!(s.decode_spot(1, Some(108_000), None).is_none());
        assert!(s.decode_spot(1, None, Some(108_010)).is_some());
    }

    #[tokio::test]
    async fn unknown_id_ticks_are_dropped() {
        let (mut s, _control) = session(DirectoryMode::Eager);
        s.connect().await.unwrap();
        assert!(s.decode_spot(999, Some(1), Some(2)).is_none());
        let stray = ProviderEvent::Spot { symbol_id: 999, bid: Some(1), ask: Some(2) };
        assert_eq!(s.handle_event(stray).await, None);
    }

    #[tokio::test]
    async fn transport_close_clears_directory() {
        let (mut s, control) = session(DirectoryMode::Eager);
        s.connect().await.unwrap();
        control.drop_connection("reset by peer");

        let ev = s.next_event().await;
        assert_eq!(ev, ProviderEvent::Closed { reason: "reset by peer".into() });
        let out = s.handle_event(ev).await;
        assert_eq!(
            out,
            Some(SessionEvent::Disconnected { reason: "reset by peer".into() })
        );
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(s.directory().is_empty());
        assert!(s.available_symbols().is_empty());
        // A tick racing the invalidation is dropped.
        assert!(s.decode_spot(1, Some(1), Some(2)).is_none());
    }

    #[tokio::test]
    async fn heartbeat_only_when_ready() {
        let (mut s, control) = session(DirectoryMode::Eager);
        assert_eq!(s.heartbeat().await, Err(UpstreamError::NotReady));
        s.connect().await.unwrap();
        s.heartbeat().await.unwrap();
        assert_eq!(control.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn mark_closed_tears_down_and_allows_reconnect() {
        let (mut s, control) = session(DirectoryMode::Eager);
        s.connect().await.unwrap();
        s.mark_closed("heartbeat failed").await;
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!control.is_open());
        assert!(s.directory().is_empty());

        assert!(s.begin_reconnect());
        s.connect().await.unwrap();
        assert!(s.is_ready());
        assert_eq!(control.open_count(), 2);
    }
}
