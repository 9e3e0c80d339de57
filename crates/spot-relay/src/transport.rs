//! Downstream WebSocket listener.
//!
//! Each accepted connection runs two halves:
//!
//! 1. A writer task draining the client's outbox into the socket. A lagging
//!    receiver means the relay overwrote frames the client was too slow to
//!    take; the writer logs the gap and carries on.
//! 2. A reader loop parsing text frames into [`ClientRequest`]s and
//!    forwarding them to the relay actor.
//!
//! When the reader ends the relay is told the client is gone, which drops
//! every interest the client held.
//!
//! A failed `accept` (fd exhaustion, an aborted handshake at the TCP layer)
//! is logged and retried after [`ACCEPT_RETRY`]; it never stops the listener.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, SplitSink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientRequest, INVALID_FORMAT};
use crate::registry::ClientId;
use crate::server::{OutboxReceiver, RelayHandle};

/// Pause after a failed `accept` before trying again.
pub const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Bind the client listener.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = listener
        .local_addr()
        .map_or_else(|_| addr.to_string(), |a| a.to_string());
    info!("[relay] listening on ws://{local}");
    Ok(listener)
}

/// Accept connections until the task is aborted, one task per client.
pub async fn serve(listener: TcpListener, relay: RelayHandle) {
    serve_incoming(incoming(listener), relay).await;
}

type Accepted = io::Result<(TcpStream, SocketAddr)>;

fn incoming(listener: TcpListener) -> impl Stream<Item = Accepted> {
    stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    })
}

async fn serve_incoming<S>(incoming: S, relay: RelayHandle)
where
    S: Stream<Item = Accepted>,
{
    let mut incoming = std::pin::pin!(incoming);
    while let Some(accepted) = incoming.next().await {
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, relay.clone()));
            }
            Err(e) => {
                warn!("[relay] accept failed: {e}, retrying in {ACCEPT_RETRY:?}");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
    error!("[relay] listener stopped");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, relay: RelayHandle) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[relay] handshake with {peer} failed: {e}");
            return;
        }
    };

    let (id, outbox) = match relay.attach().await {
        Ok(attached) => attached,
        Err(e) => {
            error!("[relay] cannot register {peer}: {e}");
            return;
        }
    };
    info!("[{id}] connected from {peer}");

    let (sink, mut source) = ws.split();
    let writer = tokio::spawn(write_loop(id, sink, outbox));

    while let Some(frame) = source.next().await {
        let forwarded = match frame {
            Ok(Message::Text(text)) => match ClientRequest::parse(&text) {
                Ok(request) => relay.request(id, request).await,
                Err(message) => relay.reject(id, message).await,
            },
            Ok(Message::Binary(_)) => relay.reject(id, INVALID_FORMAT.to_string()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("[{id}] read error: {e}");
                break;
            }
        };
        if let Err(e) = forwarded {
            warn!("[{id}] {e}, closing");
            break;
        }
    }

    let _ = relay.disconnect(id).await;
    writer.abort();
    info!("[{id}] disconnected");
}

type ClientSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn write_loop(id: ClientId, mut sink: ClientSink, mut outbox: OutboxReceiver) {
    loop {
        match outbox.recv().await {
            Ok(frame) => {
                if let Err(e) = sink.send(Message::Text(frame.to_string().into())).await {
                    debug!("[{id}] send error: {e}");
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("[{id}] slow consumer, dropped {skipped} oldest messages")
            }
            Err(RecvError::Closed) => break,
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use spot_core::config::{ReconnectConfig, RelayConfig, UpstreamConfig};
    use spot_core::types::Symbol;
    use spot_upstream::{UpstreamSession, mock::MockProvider};

    use tokio_tungstenite::MaybeTlsStream;

    use super::*;
    use crate::protocol::ServerMessage;
    use crate::server::RelayServer;

    type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn relay() -> (RelayServer, RelayHandle) {
        let (provider, _control) = MockProvider::new(vec![Symbol::new("EURUSD", 1, Some(5))]);
        let upstream = UpstreamConfig { request_timeout_ms: 100, ..Default::default() };
        let session = UpstreamSession::new(Box::new(provider), upstream);
        RelayServer::new(session, &RelayConfig::default(), &ReconnectConfig::default())
    }

    async fn recv_json(ws: &mut ClientSocket) -> ServerMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn websocket_round_trip() {
        let (server, relay) = relay();
        tokio::spawn(server.run());

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, relay.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();

        // Initial status, then possibly the connect/ready broadcasts.
        assert!(matches!(recv_json(&mut ws).await, ServerMessage::Status { .. }));

        ws.send(Message::Text("garbage".to_string().into())).await.unwrap();
        loop {
            if let ServerMessage::Error { message, .. } = recv_json(&mut ws).await {
                assert_eq!(message, INVALID_FORMAT);
                break;
            }
        }

        ws.send(Message::Text(r#"{"type":"ping"}"#.to_string().into())).await.unwrap();
        loop {
            if let ServerMessage::Pong { timestamp } = recv_json(&mut ws).await {
                assert!(timestamp > 0);
                break;
            }
        }

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn accept_error_does_not_stop_listener() {
        let (server, relay) = relay();
        tokio::spawn(server.run());

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let aborted: Accepted = Err(io::ErrorKind::ConnectionAborted.into());
        let accepts = stream::iter([aborted]).chain(incoming(listener));
        tokio::spawn(serve_incoming(accepts, relay.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        assert!(matches!(recv_json(&mut ws).await, ServerMessage::Status { .. }));

        relay.shutdown().await.unwrap();
    }
}
