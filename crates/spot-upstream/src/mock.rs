//! Scriptable in-memory [`Provider`] for tests and local runs.
//!
//! [`MockProvider`] is handed to the session; the paired [`MockControl`]
//! stays with the test. The control records every provider call, injects
//! failures (refused transport, rejected auth, failing or slow subscribe
//! requests) and pushes inbound events (spot ticks, errors, connection loss)
//! into the currently open connection.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ahash::AHashSet;
use async_trait::async_trait;
use spot_core::{error::UpstreamError, types::Symbol};

use crate::{
    Provider, ProviderEvent, ProviderEventReceiver, ProviderEventSender, SymbolScale,
    event_channel,
};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Open,
    AuthApplication { client_id: String },
    AuthAccount { account_id: u64 },
    ListSymbols,
    SymbolDetails(Vec<u64>),
    Subscribe(Vec<u64>),
    Unsubscribe(Vec<u64>),
    Heartbeat,
    Close,
}

#[derive(Default)]
struct MockState {
    symbols: Vec<Symbol>,
    light_directory: bool,
    fail_open: bool,
    reject_application: bool,
    reject_account: bool,
    fail_heartbeat: bool,
    failing_subscribes: AHashSet<u64>,
    failing_unsubscribes: AHashSet<u64>,
    response_delay: Option<Duration>,
    calls: Vec<ProviderCall>,
    events: Option<ProviderEventSender>,
}

impl MockState {
    fn ensure_open(&self) -> Result<(), UpstreamError> {
        if self.events.is_some() {
            Ok(())
        } else {
            Err(UpstreamError::TransportClosed("mock connection closed".into()))
        }
    }

    /// Open connection and none of `ids` scripted to fail.
    fn check_ids(
        &self,
        ids: &[u64],
        failing: &AHashSet<u64>,
        what: &str,
    ) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        match ids.iter().find(|&id| failing.contains(id)) {
            Some(id) => Err(UpstreamError::Rejected(format!("{what} refused for id {id}"))),
            None => Ok(()),
        }
    }
}

/// Handle used by tests to script and inspect a [`MockProvider`].
#[derive(Clone, Default)]
pub struct MockControl {
    state: Arc<Mutex<MockState>>,
}

/// In-memory provider driven by a [`MockControl`].
pub struct MockProvider {
    control: MockControl,
}

impl MockProvider {
    /// Create a provider serving `symbols` and its control handle.
    pub fn new(symbols: Vec<Symbol>) -> (Self, MockControl) {
        let control = MockControl::default();
        control.set_symbols(symbols);
        (Self { control: control.clone() }, control)
    }
}

impl MockControl {
    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    // -- scripting ---------------------------------------------------------

    /// Replace the served directory (takes effect on the next `list_symbols`).
    pub fn set_symbols(&self, symbols: Vec<Symbol>) {
        self.with(|s| s.symbols = symbols);
    }

    /// Serve `list_symbols` without price scales, forcing detail requests.
    pub fn set_light_directory(&self, on: bool) {
        self.with(|s| s.light_directory = on);
    }

    pub fn set_fail_open(&self, on: bool) {
        self.with(|s| s.fail_open = on);
    }

    pub fn set_reject_application(&self, on: bool) {
        self.with(|s| s.reject_application = on);
    }

    pub fn set_reject_account(&self, on: bool) {
        self.with(|s| s.reject_account = on);
    }

    pub fn set_fail_heartbeat(&self, on: bool) {
        self.with(|s| s.fail_heartbeat = on);
    }

    /// Make subscribe requests containing `id` fail with `Rejected`.
    pub fn fail_subscribe(&self, id: u64) {
        self.with(|s| s.failing_subscribes.insert(id));
    }

    /// Make unsubscribe requests containing `id` fail with `Rejected`.
    pub fn fail_unsubscribe(&self, id: u64) {
        self.with(|s| s.failing_unsubscribes.insert(id));
    }

    /// Clear every injected failure and delay.
    pub fn clear_failures(&self) {
        self.with(|s| {
            s.fail_open = false;
            s.reject_application = false;
            s.reject_account = false;
            s.fail_heartbeat = false;
            s.failing_subscribes.clear();
            s.failing_unsubscribes.clear();
            s.response_delay = None;
        });
    }

    /// Delay subscribe/unsubscribe responses (to exercise request timeouts).
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.with(|s| s.response_delay = delay);
    }

    // -- inbound pushes ----------------------------------------------------

    /// Push a full spot quote. Returns `false` if no connection is open or
    /// its queue is full.
    pub fn push_spot(&self, symbol_id: u64, bid: i64, ask: i64) -> bool {
        self.push(ProviderEvent::Spot { symbol_id, bid: Some(bid), ask: Some(ask) })
    }

    /// Push a quote where either side may be missing.
    pub fn push_partial(&self, symbol_id: u64, bid: Option<i64>, ask: Option<i64>) -> bool {
        self.push(ProviderEvent::Spot { symbol_id, bid, ask })
    }

    pub fn push_error(&self, message: &str) -> bool {
        self.push(ProviderEvent::Error { message: message.to_string() })
    }

    /// Simulate a transport drop: emits `Closed` and closes the channel.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let sent = self.push(ProviderEvent::Closed { reason: reason.to_string() });
        self.with(|s| s.events = None);
        sent
    }

    fn push(&self, event: ProviderEvent) -> bool {
        self.with(|s| s.events.as_ref().is_some_and(|tx| tx.try_send(event).is_ok()))
    }

    // -- inspection --------------------------------------------------------

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub fn is_open(&self) -> bool {
        self.with(|s| s.events.is_some())
    }

    /// Provider id of a served symbol.
    pub fn id_of(&self, name: &str) -> Option<u64> {
        self.with(|s| s.symbols.iter().find(|sym| sym.name == name).map(|sym| sym.id))
    }

    /// Number of subscribe calls that included `id`.
    pub fn subscribe_count(&self, id: u64) -> usize {
        self.count(|c| matches!(c, ProviderCall::Subscribe(ids) if ids.contains(&id)))
    }

    /// Number of unsubscribe calls that included `id`.
    pub fn unsubscribe_count(&self, id: u64) -> usize {
        self.count(|c| matches!(c, ProviderCall::Unsubscribe(ids) if ids.contains(&id)))
    }

    pub fn open_count(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Open))
    }

    pub fn heartbeat_count(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Heartbeat))
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.with(|s| s.calls.iter().filter(|c| pred(c)).count())
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&mut self) -> Result<ProviderEventReceiver, UpstreamError> {
        self.control.with(|s| {
            s.calls.push(ProviderCall::Open);
            if s.fail_open {
                return Err(UpstreamError::TransportClosed("connection refused".into()));
            }
            let (tx, rx) = event_channel();
            s.events = Some(tx);
            Ok(rx)
        })
    }

    async fn authenticate_application(
        &mut self,
        client_id: &str,
        _client_secret: &str,
    ) -> Result<(), UpstreamError> {
        self.control.with(|s| {
            s.calls.push(ProviderCall::AuthApplication { client_id: client_id.to_string() });
            s.ensure_open()?;
            if s.reject_application {
                return Err(UpstreamError::Rejected("CH_CLIENT_AUTH_FAILURE".into()));
            }
            Ok(())
        })
    }

    async fn authenticate_account(
        &mut self,
        _access_token: &str,
        account_id: u64,
    ) -> Result<(), UpstreamError> {
        self.control.with(|s| {
            s.calls.push(ProviderCall::AuthAccount { account_id });
            s.ensure_open()?;
            if s.reject_account {
                return Err(UpstreamError::Rejected("CH_ACCESS_TOKEN_INVALID".into()));
            }
            Ok(())
        })
    }

    async fn list_symbols(&mut self) -> Result<Vec<Symbol>, UpstreamError> {
        self.control.with(|s| {
            s.calls.push(ProviderCall::ListSymbols);
            s.ensure_open()?;
            let light = s.light_directory;
            Ok(s.symbols
                .iter()
                .map(|sym| {
                    let scale = if light { None } else { sym.price_scale };
                    Symbol::new(sym.name.clone(), sym.id, scale)
                })
                .collect())
        })
    }

    async fn symbol_details(&mut self, ids: &[u64]) -> Result<Vec<SymbolScale>, UpstreamError> {
        self.control.with(|s| {
            s.calls.push(ProviderCall::SymbolDetails(ids.to_vec()));
            s.ensure_open()?;
            Ok(s.symbols
                .iter()
                .filter(|sym| ids.contains(&sym.id))
                .filter_map(|sym| {
                    sym.price_scale
                        .map(|price_scale| SymbolScale { id: sym.id, price_scale })
                })
                .collect())
        })
    }

    async fn subscribe(&mut self, ids: &[u64]) -> Result<(), UpstreamError> {
        let (delay, result) = self.control.with(|s| {
            s.calls.push(ProviderCall::Subscribe(ids.to_vec()));
            let result = s.check_ids(ids, &s.failing_subscribes, "subscribe");
            (s.response_delay, result)
        });
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        result
    }

    async fn unsubscribe(&mut self, ids: &[u64]) -> Result<(), UpstreamError> {
        let (delay, result) = self.control.with(|s| {
            s.calls.push(ProviderCall::Unsubscribe(ids.to_vec()));
            let result = s.check_ids(ids, &s.failing_unsubscribes, "unsubscribe");
            (s.response_delay, result)
        });
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        result
    }

    async fn send_heartbeat(&mut self) -> Result<(), UpstreamError> {
        self.control.with(|s| {
            s.calls.push(ProviderCall::Heartbeat);
            s.ensure_open()?;
            if s.fail_heartbeat {
                return Err(UpstreamError::TransportClosed("heartbeat write failed".into()));
            }
            Ok(())
        })
    }

    async fn close(&mut self) {
        self.control.with(|s| {
            s.calls.push(ProviderCall::Close);
            s.events = None;
        });
    }
}
