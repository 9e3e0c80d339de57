//! Client-facing JSON messages.
//!
//! Every frame is a JSON object tagged by `"type"`.
//!
//! | Request            | Reply                  |
//! |--------------------|------------------------|
//! | `subscribe`        | `subscribeResponse`    |
//! | `unsubscribe`      | `unsubscribeResponse`  |
//! | `ping`             | `pong`                 |
//! | `connect`          | `status`               |
//! | `getSubscriptions` | `subscriptions`        |
//!
//! Pushes: `status`, `tick`, `error`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spot_core::types::{LinkStatus, PriceUpdate};

/// Reply to input that is not a JSON object with a string `type`.
pub const INVALID_FORMAT: &str = "Invalid message format.";

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    Subscribe {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        symbols: Vec<String>,
    },
    Ping,
    /// Ask for the current upstream status.
    Connect,
    GetSubscriptions,
}

impl ClientRequest {
    const TYPES: [&'static str; 5] =
        ["subscribe", "unsubscribe", "ping", "connect", "getSubscriptions"];

    /// Parse one text frame. The error is the message to send back.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| INVALID_FORMAT.to_string())?;
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(INVALID_FORMAT.to_string());
        };
        if !Self::TYPES.contains(&kind) {
            return Err(format!("Unknown message type: {kind}"));
        }
        serde_json::from_value(value).map_err(|e| format!("{INVALID_FORMAT} {e}"))
    }
}

/// Per-symbol outcome of a subscribe/unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Subscribed,
    Unsubscribed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolResult {
    pub symbol: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SymbolResult {
    pub fn ok(symbol: &str, status: ResultStatus) -> Self {
        Self {
            symbol: symbol.to_string(),
            status,
            message: None,
        }
    }

    pub fn error(symbol: &str, message: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            status: ResultStatus::Error,
            message: Some(message.into()),
        }
    }

    /// A successful result that still carries a note.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    SubscribeResponse {
        results: Vec<SymbolResult>,
        timestamp: u64,
    },
    UnsubscribeResponse {
        results: Vec<SymbolResult>,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        status: LinkStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        available_symbols: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Tick {
        symbol: String,
        bid: f64,
        ask: f64,
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Subscriptions {
        symbols: Vec<String>,
        timestamp: u64,
    },
    Error {
        message: String,
        timestamp: u64,
    },
}

impl ServerMessage {
    pub fn tick(update: &PriceUpdate) -> Self {
        Self::Tick {
            symbol: update.symbol.clone(),
            bid: update.bid,
            ask: update.ask,
            timestamp: update.timestamp_ms,
        }
    }

    /// Serialize once for fan-out to many outboxes.
    pub fn to_frame(&self) -> Arc<str> {
        // Only plain strings and numbers inside, serialization cannot fail.
        Arc::from(serde_json::to_string(self).unwrap_or_default())
    }
}
