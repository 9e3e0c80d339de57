//! The relay actor.
//!
//! [`RelayServer`] owns the registry, the client table, the upstream session
//! and the reconnect supervisor. It consumes one merged input stream:
//!
//! - client commands from [`RelayHandle`] (connect, request, disconnect,
//!   shutdown),
//! - provider events from the session,
//! - the heartbeat interval,
//! - the supervisor's reconnect deadline.
//!
//! Each input is handled to completion before the next one is read, so a
//! request's registry change and its upstream call are atomic with respect
//! to every other client.
//!
//! Outbound frames go into a per-client `broadcast` channel with a single
//! receiver (the connection's writer task). A full outbox overwrites its
//! oldest frames instead of blocking the actor.
//!
//! A symbol whose upstream unsubscribe is refused stays subscribed upstream
//! with no holders. It is kept in a lingering set so the next first holder
//! reuses that subscription instead of asking for it twice. A new session
//! starts with no subscriptions, so the set is cleared on every reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use spot_core::{
    config::{ReconnectConfig, RelayConfig},
    error::UpstreamError,
    time_util,
    types::{LinkStatus, PriceUpdate},
};
use spot_upstream::{ProviderEvent, SessionEvent, UpstreamSession};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientRequest, ResultStatus, ServerMessage, SymbolResult};
use crate::registry::{Action, ClientId, SubscriptionRegistry};
use crate::supervisor::ReconnectSupervisor;

/// Pre-serialized outbound frame.
pub type Frame = Arc<str>;

/// Sender half of a client's outbox.
pub type Outbox = broadcast::Sender<Frame>;

/// Receiver half of a client's outbox, drained by the connection writer.
pub type OutboxReceiver = broadcast::Receiver<Frame>;

/// Inputs accepted by the actor.
#[derive(Debug)]
pub enum RelayCommand {
    Connect { id: ClientId, outbox: Outbox },
    Request { id: ClientId, request: ClientRequest },
    /// A frame that could not be parsed; `message` is sent back as `error`.
    Malformed { id: ClientId, message: String },
    Disconnect { id: ClientId },
    Shutdown,
}

struct ClientHandle {
    outbox: Outbox,
    /// Cleared on the first failed delivery; the client is skipped until
    /// its transport reports the disconnect.
    live: bool,
}

/// One iteration's worth of work, produced by the `select!`.
enum Input {
    Command(RelayCommand),
    Upstream(ProviderEvent),
    Heartbeat,
    Reconnect,
}

// ---------------------------------------------------------------------------
// RelayHandle
// ---------------------------------------------------------------------------

/// Cloneable entry point into the relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
    next_id: Arc<AtomicU64>,
    outbox_capacity: usize,
}

impl RelayHandle {
    /// Allocate a client id and outbox, and register the client.
    ///
    /// The returned receiver gets the initial `status` frame first.
    pub async fn attach(&self) -> Result<(ClientId, OutboxReceiver)> {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbox, rx) = broadcast::channel(self.outbox_capacity);
        self.send(RelayCommand::Connect { id, outbox }).await?;
        Ok((id, rx))
    }

    pub async fn request(&self, id: ClientId, request: ClientRequest) -> Result<()> {
        self.send(RelayCommand::Request { id, request }).await
    }

    pub async fn reject(&self, id: ClientId, message: String) -> Result<()> {
        self.send(RelayCommand::Malformed { id, message }).await
    }

    pub async fn disconnect(&self, id: ClientId) -> Result<()> {
        self.send(RelayCommand::Disconnect { id }).await
    }

    /// Ask the actor to stop. It closes the upstream session and every
    /// client outbox before returning from [`RelayServer::run`].
    pub async fn shutdown(&self) -> Result<()> {
        self.send(RelayCommand::Shutdown).await
    }

    async fn send(&self, cmd: RelayCommand) -> Result<()> {
        self.tx.send(cmd).await.ok().context("relay actor stopped")
    }
}

// ---------------------------------------------------------------------------
// RelayServer
// ---------------------------------------------------------------------------

pub struct RelayServer {
    session: UpstreamSession,
    registry: SubscriptionRegistry,
    clients: AHashMap<ClientId, ClientHandle>,
    /// Held by nobody but still subscribed upstream.
    lingering: AHashSet<String>,
    supervisor: ReconnectSupervisor,
    commands: mpsc::Receiver<RelayCommand>,
    heartbeat_every: Duration,
}

impl RelayServer {
    /// Build the actor around an explicitly constructed session.
    pub fn new(
        session: UpstreamSession,
        relay: &RelayConfig,
        reconnect: &ReconnectConfig,
    ) -> (Self, RelayHandle) {
        let (tx, commands) = mpsc::channel(relay.command_queue_capacity.max(1));
        let handle = RelayHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            outbox_capacity: relay.client_queue_capacity.max(1),
        };
        let heartbeat_every = session.config().heartbeat_interval();
        let server = Self {
            session,
            registry: SubscriptionRegistry::new(),
            clients: AHashMap::new(),
            lingering: AHashSet::new(),
            supervisor: ReconnectSupervisor::new(reconnect),
            commands,
            heartbeat_every,
        };
        (server, handle)
    }

    /// Run until [`RelayHandle::shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        info!("[relay] started");
        self.supervisor.schedule_initial();

        let mut heartbeat = tokio::time::interval(self.heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            let input = tokio::select! {
                cmd = self.commands.recv() => {
                    Input::Command(cmd.unwrap_or(RelayCommand::Shutdown))
                }
                event = self.session.next_event() => Input::Upstream(event),
                _ = heartbeat.tick() => Input::Heartbeat,
                _ = self.supervisor.wait_due() => Input::Reconnect,
            };

            match input {
                Input::Command(RelayCommand::Shutdown) => break,
                Input::Command(cmd) => self.handle_command(cmd).await,
                Input::Upstream(event) => self.handle_upstream(event).await,
                Input::Heartbeat => self.heartbeat().await,
                Input::Reconnect => self.attempt_connect().await,
            }
        }

        self.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Upstream lifecycle
    // -----------------------------------------------------------------------

    async fn attempt_connect(&mut self) {
        if self.supervisor.begin_attempt() {
            self.session.begin_reconnect();
        }
        self.lingering.clear();
        self.broadcast_status(LinkStatus::Connecting, None);

        if let Err(e) = self.session.connect().await {
            error!("[relay] upstream connect failed: {e}");
            self.broadcast_status(LinkStatus::Error, Some(e.to_string()));
            self.supervisor.on_failure();
            return;
        }

        if let Err(e) = self.restore().await {
            error!("[relay] restoring subscriptions failed: {e}");
            self.session.disconnect().await;
            self.broadcast_status(LinkStatus::Error, Some(e.to_string()));
            self.supervisor.on_failure();
            return;
        }

        self.supervisor.on_ready();
        info!(
            "[relay] upstream ready, {} clients, {} active symbols",
            self.clients.len(),
            self.registry.all_active_symbols().len()
        );
        self.broadcast_status(LinkStatus::Ready, None);
    }

    /// Re-subscribe the registry; purge symbols the new directory lacks.
    async fn restore(&mut self) -> Result<(), UpstreamError> {
        let restored = self.supervisor.restore(&mut self.session, &self.registry).await?;
        for symbol in restored.vanished {
            let affected = self.registry.purge_symbol(&symbol);
            let frame = ServerMessage::Error {
                message: format!("Symbol {symbol} is no longer available upstream"),
                timestamp: time_util::now_ms(),
            }
            .to_frame();
            for id in affected {
                self.deliver(id, &frame);
            }
        }
        Ok(())
    }

    async fn handle_upstream(&mut self, event: ProviderEvent) {
        match self.session.handle_event(event).await {
            Some(SessionEvent::Price(update)) => self.fan_out(&update),
            Some(SessionEvent::Disconnected { reason }) => self.on_upstream_lost(reason),
            Some(SessionEvent::Error { message }) => {
                self.broadcast_status(LinkStatus::Error, Some(message))
            }
            None => {}
        }
    }

    fn on_upstream_lost(&mut self, reason: String) {
        warn!("[relay] upstream lost: {reason}");
        self.lingering.clear();
        self.broadcast_status(LinkStatus::Disconnected, Some(reason));
        self.supervisor.on_disconnect();
    }

    async fn heartbeat(&mut self) {
        if !self.session.is_ready() {
            return;
        }
        match self.session.heartbeat().await {
            Ok(()) => debug!("[relay] heartbeat sent"),
            Err(e) if e.is_connection_loss() => {
                let reason = format!("heartbeat failed: {e}");
                self.session.mark_closed(&reason).await;
                self.on_upstream_lost(reason);
            }
            Err(e) => warn!("[relay] heartbeat failed: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        info!("[relay] shutting down");
        self.supervisor.shutdown();
        self.session.disconnect().await;
        self.broadcast_status(LinkStatus::Disconnected, Some("relay shutting down".into()));
        // Dropping the outboxes ends every writer task.
        self.clients.clear();
        info!("[relay] stopped");
    }

    // -----------------------------------------------------------------------
    // Client commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Connect { id, outbox } => {
                self.registry.register_client(id);
                self.clients.insert(id, ClientHandle { outbox, live: true });
                info!("[relay] {id} connected ({} clients)", self.clients.len());
                let frame = self.status_message().to_frame();
                self.deliver(id, &frame);
            }
            RelayCommand::Request { id, request } => {
                if !self.clients.contains_key(&id) {
                    debug!("[relay] dropping request from unknown {id}");
                    return;
                }
                let reply = self.handle_request(id, request).await;
                self.deliver(id, &reply.to_frame());
            }
            RelayCommand::Malformed { id, message } => {
                debug!("[relay] {id} sent a malformed frame: {message}");
                let frame = ServerMessage::Error {
                    message,
                    timestamp: time_util::now_ms(),
                }
                .to_frame();
                self.deliver(id, &frame);
            }
            RelayCommand::Disconnect { id } => self.drop_client(id).await,
            // Handled by the run loop.
            RelayCommand::Shutdown => {}
        }
    }

    async fn handle_request(&mut self, id: ClientId, request: ClientRequest) -> ServerMessage {
        match request {
            ClientRequest::Subscribe { symbols } => {
                let mut results = Vec::with_capacity(symbols.len());
                for symbol in &symbols {
                    results.push(self.subscribe_one(id, symbol).await);
                }
                ServerMessage::SubscribeResponse {
                    results,
                    timestamp: time_util::now_ms(),
                }
            }
            ClientRequest::Unsubscribe { symbols } => {
                let mut results = Vec::with_capacity(symbols.len());
                for symbol in &symbols {
                    results.push(self.unsubscribe_one(id, symbol).await);
                }
                ServerMessage::UnsubscribeResponse {
                    results,
                    timestamp: time_util::now_ms(),
                }
            }
            ClientRequest::Ping => ServerMessage::Pong { timestamp: time_util::now_ms() },
            ClientRequest::Connect => self.status_message(),
            ClientRequest::GetSubscriptions => ServerMessage::Subscriptions {
                symbols: self.registry.symbols_of(id),
                timestamp: time_util::now_ms(),
            },
        }
    }

    async fn subscribe_one(&mut self, id: ClientId, symbol: &str) -> SymbolResult {
        if let Err(e) = self.session.check_symbol(symbol) {
            debug!("[relay] {id} subscribe {symbol} refused: {e}");
            return SymbolResult::error(symbol, e.to_string());
        }

        if self.registry.add_interest(id, symbol) == Action::NeedsUpstreamSubscribe {
            if self.lingering.remove(symbol) {
                debug!("[relay] {symbol} is still subscribed upstream, reusing it");
            } else if let Err(e) = self.session.subscribe_symbol(symbol).await {
                warn!("[relay] upstream subscribe {symbol} failed, rolling back: {e}");
                self.registry.remove_interest(id, symbol);
                return SymbolResult::error(symbol, e.to_string());
            }
        }

        debug!(
            "[relay] {id} subscribed {symbol} (count={})",
            self.registry.ref_count(symbol)
        );
        SymbolResult::ok(symbol, ResultStatus::Subscribed)
    }

    async fn unsubscribe_one(&mut self, id: ClientId, symbol: &str) -> SymbolResult {
        let result = SymbolResult::ok(symbol, ResultStatus::Unsubscribed);
        if self.registry.remove_interest(id, symbol) != Action::NeedsUpstreamUnsubscribe {
            return result;
        }
        if !self.session.is_ready() {
            debug!("[relay] {symbol} released while upstream is down, nothing to unsubscribe");
            return result;
        }
        match self.release_upstream(symbol).await {
            Ok(()) => result,
            Err(e) => result.with_message(format!("upstream unsubscribe failed: {e}")),
        }
    }

    async fn drop_client(&mut self, id: ClientId) {
        self.clients.remove(&id);
        let orphaned = self.registry.remove_client(id);
        info!("[relay] {id} disconnected ({} clients)", self.clients.len());
        if !self.session.is_ready() {
            return;
        }
        for symbol in orphaned {
            let _ = self.release_upstream(&symbol).await;
        }
    }

    /// Unsubscribe a symbol nobody holds any more. A refusal on a live
    /// connection leaves it lingering upstream.
    async fn release_upstream(&mut self, symbol: &str) -> Result<(), UpstreamError> {
        let result = self.session.unsubscribe_symbol(symbol).await;
        if let Err(e) = &result {
            warn!("[relay] upstream unsubscribe {symbol} failed: {e}");
            if !e.is_connection_loss() {
                self.lingering.insert(symbol.to_string());
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    fn status_message(&self) -> ServerMessage {
        let status = self.session.state().link_status();
        ServerMessage::Status {
            status,
            available_symbols: self.symbols_if_ready(status),
            message: None,
        }
    }

    fn symbols_if_ready(&self, status: LinkStatus) -> Option<Vec<String>> {
        (status == LinkStatus::Ready).then(|| self.session.available_symbols())
    }

    fn broadcast_status(&mut self, status: LinkStatus, message: Option<String>) {
        let available_symbols = self.symbols_if_ready(status);
        let frame = ServerMessage::Status {
            status,
            available_symbols,
            message,
        }
        .to_frame();
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.deliver(id, &frame);
        }
    }

    fn fan_out(&mut self, update: &PriceUpdate) {
        let frame = ServerMessage::tick(update).to_frame();
        for id in self.registry.interested_clients(&update.symbol) {
            self.deliver(id, &frame);
        }
    }

    /// Queue `frame` for `id`. A client whose outbox has no receiver left is
    /// marked not-live and skipped from then on.
    fn deliver(&mut self, id: ClientId, frame: &Frame) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        if !client.live {
            return false;
        }
        if client.outbox.send(Arc::clone(frame)).is_err() {
            warn!("[relay] {id} outbox closed, skipping until disconnect");
            client.live = false;
            return false;
        }
        true
    }
}
