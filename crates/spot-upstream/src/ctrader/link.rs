//! One cTrader WebSocket connection with request/response correlation.
//!
//! A background task owns the socket. It writes frames queued on the
//! outbound channel, routes responses to the waiting caller by
//! `clientMsgId`, and forwards unsolicited pushes as [`ProviderEvent`]s.
//! When the socket drops, every waiting caller fails with
//! [`UpstreamError::TransportClosed`] and a single
//! [`ProviderEvent::Closed`] is emitted. The link never reconnects on its
//! own; that is the relay supervisor's job.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use futures_util::{SinkExt, StreamExt};
use spot_core::error::UpstreamError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::protocol::{self, Envelope};
use crate::{ProviderEvent, ProviderEventSender};

/// Request id → waiting caller.
type PendingMap = Arc<Mutex<AHashMap<String, oneshot::Sender<Envelope>>>>;

/// How long [`Link::close`] waits for the close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct Link {
    outbound_tx: mpsc::Sender<String>,
    pending: PendingMap,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Link {
    /// Connect to `url` and start the socket task. Pushes go to `events`.
    pub(crate) async fn connect(
        url: &str,
        events: ProviderEventSender,
    ) -> Result<Self, UpstreamError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| UpstreamError::TransportClosed(format!("invalid url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(UpstreamError::TransportClosed(format!(
                "unsupported scheme in {url}"
            )));
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| UpstreamError::TransportClosed(format!("connect {url}: {e}")))?;
        info!("[ctrader] connected to {url}");

        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending: PendingMap = Arc::new(Mutex::new(AHashMap::new()));

        let task = tokio::spawn(socket_loop(
            ws_stream,
            outbound_rx,
            shutdown_rx,
            Arc::clone(&pending),
            events,
        ));

        Ok(Self {
            outbound_tx,
            pending,
            shutdown_tx,
            task,
        })
    }

    /// Send a request envelope and wait for the correlated response.
    ///
    /// No deadline is applied here; callers bound the wait themselves.
    pub(crate) async fn request(&self, env: Envelope) -> Result<Envelope, UpstreamError> {
        let id = env
            .client_msg_id
            .clone()
            .ok_or_else(|| UpstreamError::Protocol("request without clientMsgId".into()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            // Callers that gave up (timed out) leave closed senders behind.
            map.retain(|_, waiting| !waiting.is_closed());
            map.insert(id, tx);
        }

        self.send(&env).await?;
        rx.await
            .map_err(|_| UpstreamError::TransportClosed("connection closed before response".into()))
    }

    /// Queue a frame without waiting for a response.
    pub(crate) async fn send(&self, env: &Envelope) -> Result<(), UpstreamError> {
        let text =
            serde_json::to_string(env).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        self.outbound_tx
            .send(text)
            .await
            .map_err(|_| UpstreamError::TransportClosed("socket task stopped".into()))
    }

    /// Close the socket. No [`ProviderEvent::Closed`] is emitted for a
    /// deliberate close.
    pub(crate) async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, self.task).await.is_err() {
            warn!("[ctrader] close handshake timed out, aborting socket task");
            abort.abort();
        }
        self.pending.lock().await.clear();
    }
}

type CTraderStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn socket_loop(
    ws_stream: CTraderStream,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    pending: PendingMap,
    events: ProviderEventSender,
) {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("[ctrader] shutdown requested");
                let _ = ws_write.close().await;
                pending.lock().await.clear();
                return;
            }

            frame = ws_read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = route_frame(&text, &pending, &events).await {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("[ctrader] received close frame: {frame:?}");
                        break "server closed the connection".to_string();
                    }
                    Some(Err(e)) => {
                        error!("[ctrader] read error: {e}");
                        break format!("read error: {e}");
                    }
                    None => {
                        warn!("[ctrader] stream ended");
                        break "stream ended".to_string();
                    }
                    _ => {}
                }
            }

            Some(text) = outbound_rx.recv() => {
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    error!("[ctrader] send error: {e}");
                    break format!("send error: {e}");
                }
            }
        }
    };

    // Dropping the senders wakes every waiting caller with an error.
    pending.lock().await.clear();
    // Waits for room: the close must not be lost behind queued ticks.
    let _ = events.send(ProviderEvent::Closed { reason }).await;
}

/// Deliver one text frame. Returns `Some(reason)` when the server announced
/// the end of the session.
async fn route_frame(
    text: &str,
    pending: &PendingMap,
    events: &ProviderEventSender,
) -> Option<String> {
    let env: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            warn!("[ctrader] unparseable frame ({e}): {text}");
            return None;
        }
    };

    if let Some(id) = env.client_msg_id.as_deref() {
        let waiting = pending.lock().await.remove(id);
        if let Some(tx) = waiting {
            let _ = tx.send(env);
            return None;
        }
        debug!("[ctrader] response {id} has no waiting caller");
    }

    match protocol::decode_push(&env) {
        Some(ProviderEvent::Closed { reason }) => Some(reason),
        Some(event) => {
            if let Err(TrySendError::Full(event)) = events.try_send(event) {
                warn!("[ctrader] event queue full, dropping {event:?}");
            }
            None
        }
        None => {
            if env.payload_type != protocol::HEARTBEAT_EVENT {
                debug!("[ctrader] ignoring payloadType {}", env.payload_type);
            }
            None
        }
    }
}
