//! cTrader Open API JSON framing.
//!
//! Every frame is an envelope `{"clientMsgId"?, "payloadType", "payload"}`.
//! Requests carry a fresh `clientMsgId` which the server echoes on the
//! matching response; pushes (spot events, heartbeats, disconnect notices)
//! arrive without one.
//!
//! | Message                            | Type |
//! |------------------------------------|------|
//! | `ProtoOAApplicationAuthReq`/`Res`  | 2100 / 2101 |
//! | `ProtoOAAccountAuthReq`/`Res`      | 2102 / 2103 |
//! | `ProtoOASymbolsListReq`/`Res`      | 2114 / 2115 |
//! | `ProtoOASymbolByIdReq`/`Res`       | 2116 / 2117 |
//! | `ProtoOASubscribeSpotsReq`/`Res`   | 2127 / 2128 |
//! | `ProtoOAUnsubscribeSpotsReq`/`Res` | 2129 / 2130 |
//! | `ProtoOASpotEvent`                 | 2131 |
//! | `ProtoHeartbeatEvent`              | 51 |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spot_core::{error::UpstreamError, types::Symbol};
use tracing::warn;
use uuid::Uuid;

use crate::{ProviderEvent, SymbolScale};

pub const ERROR_RES: u32 = 50;
pub const HEARTBEAT_EVENT: u32 = 51;

pub const APPLICATION_AUTH_REQ: u32 = 2100;
pub const APPLICATION_AUTH_RES: u32 = 2101;
pub const ACCOUNT_AUTH_REQ: u32 = 2102;
pub const ACCOUNT_AUTH_RES: u32 = 2103;
pub const SYMBOLS_LIST_REQ: u32 = 2114;
pub const SYMBOLS_LIST_RES: u32 = 2115;
pub const SYMBOL_BY_ID_REQ: u32 = 2116;
pub const SYMBOL_BY_ID_RES: u32 = 2117;
pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
pub const UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
pub const UNSUBSCRIBE_SPOTS_RES: u32 = 2130;
pub const SPOT_EVENT: u32 = 2131;
pub const OA_ERROR_RES: u32 = 2142;
pub const ACCOUNTS_TOKEN_INVALIDATED_EVENT: u32 = 2147;
pub const CLIENT_DISCONNECT_EVENT: u32 = 2148;

/// One JSON frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    pub payload_type: u32,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// A request envelope with a fresh correlation id.
    pub fn request(payload_type: u32, payload: Value) -> Self {
        Self {
            client_msg_id: Some(Uuid::new_v4().to_string()),
            payload_type,
            payload,
        }
    }

    /// A push envelope (no correlation id).
    pub fn event(payload_type: u32, payload: Value) -> Self {
        Self {
            client_msg_id: None,
            payload_type,
            payload,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload_type, ERROR_RES | OA_ERROR_RES)
    }

    /// Unwrap a response, turning error payloads into
    /// [`UpstreamError::Rejected`] and unexpected types into
    /// [`UpstreamError::Protocol`].
    pub fn expect(self, payload_type: u32) -> Result<Value, UpstreamError> {
        if self.is_error() {
            return Err(UpstreamError::Rejected(error_description(&self.payload)));
        }
        if self.payload_type != payload_type {
            return Err(UpstreamError::Protocol(format!(
                "expected payloadType {payload_type}, got {}",
                self.payload_type
            )));
        }
        Ok(self.payload)
    }
}

/// `"<errorCode>: <description>"` from an error payload.
pub fn error_description(payload: &Value) -> String {
    let code = payload
        .get("errorCode")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    match payload.get("description").and_then(Value::as_str) {
        Some(desc) => format!("{code}: {desc}"),
        None => code.to_string(),
    }
}

/// Decode an unsolicited push. Heartbeats and unknown types yield `None`.
pub fn decode_push(env: &Envelope) -> Option<ProviderEvent> {
    match env.payload_type {
        SPOT_EVENT => parse_spot(&env.payload),
        ERROR_RES | OA_ERROR_RES => Some(ProviderEvent::Error {
            message: error_description(&env.payload),
        }),
        CLIENT_DISCONNECT_EVENT => {
            let reason = env
                .payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("server disconnect");
            Some(ProviderEvent::Closed { reason: reason.to_string() })
        }
        ACCOUNTS_TOKEN_INVALIDATED_EVENT => Some(ProviderEvent::Closed {
            reason: "access token invalidated".into(),
        }),
        _ => None,
    }
}

/// `ProtoOASpotEvent` → [`ProviderEvent::Spot`]. Either price side may be
/// omitted by the server.
pub fn parse_spot(payload: &Value) -> Option<ProviderEvent> {
    let Some(symbol_id) = payload.get("symbolId").and_then(Value::as_u64) else {
        warn!("[ctrader] spot event without symbolId: {payload}");
        return None;
    };
    let bid = payload.get("bid").and_then(Value::as_i64);
    let ask = payload.get("ask").and_then(Value::as_i64);
    Some(ProviderEvent::Spot { symbol_id, bid, ask })
}

/// `ProtoOASymbolsListRes` → light symbols (no price scale).
pub fn parse_light_symbols(payload: &Value) -> Result<Vec<Symbol>, UpstreamError> {
    let list = symbol_array(payload)?;
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let id = entry.get("symbolId").and_then(Value::as_u64);
        let name = entry.get("symbolName").and_then(Value::as_str);
        match (id, name) {
            (Some(id), Some(name)) => out.push(Symbol::new(name, id, None)),
            _ => warn!("[ctrader] skipping malformed symbol entry: {entry}"),
        }
    }
    Ok(out)
}

/// `ProtoOASymbolByIdRes` → price scales (`digits`).
pub fn parse_symbol_scales(payload: &Value) -> Result<Vec<SymbolScale>, UpstreamError> {
    Ok(symbol_array(payload)?
        .iter()
        .filter_map(|entry| {
            let id = entry.get("symbolId").and_then(Value::as_u64)?;
            let digits = entry.get("digits").and_then(Value::as_u64)?;
            Some(SymbolScale { id, price_scale: u32::try_from(digits).ok()? })
        })
        .collect())
}

fn symbol_array(payload: &Value) -> Result<&Vec<Value>, UpstreamError> {
    payload
        .get("symbol")
        .and_then(Value::as_array)
        .ok_or_else(|| UpstreamError::Protocol("response has no symbol list".into()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_wire_format() {
        let env = Envelope::event(HEARTBEAT_EVENT, json!({}));
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"payloadType":51,"payload":{}}"#
        );

        let env = Envelope::request(SUBSCRIBE_SPOTS_REQ, json!({"symbolId": [1]}));
        let v: Value = serde_json::to_value(&env).unwrap();
        assert!(v["clientMsgId"].is_string());
        assert_eq!(v["payloadType"], 2127);
    }

    #[test]
    fn envelope_without_payload_parses() {
        let env: Envelope = serde_json::from_str(r#"{"payloadType":51}"#).unwrap();
        assert_eq!(env.payload_type, HEARTBEAT_EVENT);
        assert_eq!(env.client_msg_id, None);
        assert!(decode_push(&env).is_none());
    }

    #[test]
    fn expect_maps_errors() {
        let err = Envelope::event(
            OA_ERROR_RES,
            json!({"errorCode": "CH_CLIENT_AUTH_FAILURE", "description": "bad secret"}),
        );
        assert_eq!(
            err.expect(APPLICATION_AUTH_RES),
            Err(UpstreamError::Rejected("CH_CLIENT_AUTH_FAILURE: bad secret".into()))
        );

        let wrong = Envelope::event(SYMBOLS_LIST_RES, json!({}));
        assert!(matches!(
            wrong.expect(APPLICATION_AUTH_RES),
            Err(UpstreamError::Protocol(_))
        ));

        let ok = Envelope::event(APPLICATION_AUTH_RES, json!({"x": 1}));
        assert_eq!(ok.expect(APPLICATION_AUTH_RES), Ok(json!({"x": 1})));
    }

    #[test]
    fn spot_sides_are_optional() {
        let full = parse_spot(&json!({
            "ctidTraderAccountId": 7, "symbolId": 1, "bid": 108_345, "ask": 108_350
        }));
        assert_eq!(
            full,
            Some(ProviderEvent::Spot { symbol_id: 1, bid: Some(108_345), ask: Some(108_350) })
        );

        let ask_only = parse_spot(&json!({"symbolId": 1, "ask": 108_351}));
        assert_eq!(
            ask_only,
            Some(ProviderEvent::Spot { symbol_id: 1, bid: None, ask: Some(108_351) })
        );

        assert_eq!(parse_spot(&json!({"bid": 1})), None);
    }

    #[test]
    fn symbol_list_skips_malformed_entries() {
        let payload = json!({"symbol": [
            {"symbolId": 1, "symbolName": "EURUSD", "enabled": true},
            {"symbolId": 2},
            {"symbolId": 4, "symbolName": "USDJPY"}
        ]});
        let list = parse_light_symbols(&payload).unwrap();
        assert_eq!(
            list,
            vec![Symbol::new("EURUSD", 1, None), Symbol::new("USDJPY", 4, None)]
        );
        assert!(matches!(
            parse_light_symbols(&json!({})),
            Err(UpstreamError::Protocol(_))
        ));
    }

    #[test]
    fn symbol_scales_from_digits() {
        let payload = json!({"symbol": [
            {"symbolId": 1, "digits": 5},
            {"symbolId": 4, "digits": 3},
            {"symbolId": 9}
        ]});
        assert_eq!(
            parse_symbol_scales(&payload).unwrap(),
            vec![SymbolScale { id: 1, price_scale: 5 }, SymbolScale { id: 4, price_scale: 3 }]
        );
    }

    #[test]
    fn pushes_decode() {
        let bye = Envelope::event(CLIENT_DISCONNECT_EVENT, json!({"reason": "maintenance"}));
        assert_eq!(
            decode_push(&bye),
            Some(ProviderEvent::Closed { reason: "maintenance".into() })
        );

        let err = Envelope::event(ERROR_RES, json!({"errorCode": "FRAME_TOO_LONG"}));
        assert_eq!(
            decode_push(&err),
            Some(ProviderEvent::Error { message: "FRAME_TOO_LONG".into() })
        );
    }
}
