//! cTrader Open API provider (JSON over WebSocket, port 5036).
//!
//! | Provider call             | Request                       |
//! |---------------------------|-------------------------------|
//! | `authenticate_application`| `ProtoOAApplicationAuthReq`   |
//! | `authenticate_account`    | `ProtoOAAccountAuthReq`       |
//! | `list_symbols`            | `ProtoOASymbolsListReq`       |
//! | `symbol_details`          | `ProtoOASymbolByIdReq`        |
//! | `subscribe`               | `ProtoOASubscribeSpotsReq`    |
//! | `unsubscribe`             | `ProtoOAUnsubscribeSpotsReq`  |
//! | `send_heartbeat`          | `ProtoHeartbeatEvent`         |
//!
//! Prices arrive as integer ticks; `digits` from `ProtoOASymbolByIdRes` is
//! the price scale.

mod link;
pub mod protocol;

use async_trait::async_trait;
use serde_json::json;
use spot_core::{config::UpstreamConfig, error::UpstreamError, types::Symbol};
use tracing::{debug, info};

use self::link::Link;
use self::protocol::Envelope;
use crate::{Provider, ProviderEventReceiver, SymbolScale, event_channel};

/// [`Provider`] backed by a live cTrader Open API connection.
pub struct CTraderProvider {
    url: String,
    /// `ctidTraderAccountId`, set by account authentication.
    account_id: u64,
    link: Option<Link>,
}

impl CTraderProvider {
    /// Create a provider for the configured endpoint. Nothing is opened yet.
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.ws_url(),
            account_id: config.account_id,
            link: None,
        }
    }

    fn link(&self) -> Result<&Link, UpstreamError> {
        self.link
            .as_ref()
            .ok_or_else(|| UpstreamError::TransportClosed("not connected".into()))
    }

    async fn call(
        &self,
        req_type: u32,
        res_type: u32,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        let response = self
            .link()?
            .request(Envelope::request(req_type, payload))
            .await?;
        response.expect(res_type)
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

#[async_trait]
impl Provider for CTraderProvider {
    fn name(&self) -> &str {
        "ctrader"
    }

    async fn open(&mut self) -> Result<ProviderEventReceiver, UpstreamError> {
        self.drop_link().await;
        let (tx, rx) = event_channel();
        self.link = Some(Link::connect(&self.url, tx).await?);
        Ok(rx)
    }

    async fn authenticate_application(
        &mut self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), UpstreamError> {
        self.call(
            protocol::APPLICATION_AUTH_REQ,
            protocol::APPLICATION_AUTH_RES,
            json!({ "clientId": client_id, "clientSecret": client_secret }),
        )
        .await?;
        debug!("[ctrader] application auth accepted");
        Ok(())
    }

    async fn authenticate_account(
        &mut self,
        access_token: &str,
        account_id: u64,
    ) -> Result<(), UpstreamError> {
        self.call(
            protocol::ACCOUNT_AUTH_REQ,
            protocol::ACCOUNT_AUTH_RES,
            json!({ "ctidTraderAccountId": account_id, "accessToken": access_token }),
        )
        .await?;
        self.account_id = account_id;
        info!("[ctrader] account {account_id} authorized");
        Ok(())
    }

    async fn list_symbols(&mut self) -> Result<Vec<Symbol>, UpstreamError> {
        let payload = self
            .call(
                protocol::SYMBOLS_LIST_REQ,
                protocol::SYMBOLS_LIST_RES,
                json!({ "ctidTraderAccountId": self.account_id, "includeArchivedSymbols": false }),
            )
            .await?;
        protocol::parse_light_symbols(&payload)
    }

    async fn symbol_details(&mut self, ids: &[u64]) -> Result<Vec<SymbolScale>, UpstreamError> {
        let payload = self
            .call(
                protocol::SYMBOL_BY_ID_REQ,
                protocol::SYMBOL_BY_ID_RES,
                json!({ "ctidTraderAccountId": self.account_id, "symbolId": ids }),
            )
            .await?;
        protocol::parse_symbol_scales(&payload)
    }

    async fn subscribe(&mut self, ids: &[u64]) -> Result<(), UpstreamError> {
        self.call(
            protocol::SUBSCRIBE_SPOTS_REQ,
            protocol::SUBSCRIBE_SPOTS_RES,
            json!({ "ctidTraderAccountId": self.account_id, "symbolId": ids }),
        )
        .await
        .map(|_| ())
    }

    async fn unsubscribe(&mut self, ids: &[u64]) -> Result<(), UpstreamError> {
        self.call(
            protocol::UNSUBSCRIBE_SPOTS_REQ,
            protocol::UNSUBSCRIBE_SPOTS_RES,
            json!({ "ctidTraderAccountId": self.account_id, "symbolId": ids }),
        )
        .await
        .map(|_| ())
    }

    async fn send_heartbeat(&mut self) -> Result<(), UpstreamError> {
        self.link()?
            .send(&Envelope::event(protocol::HEARTBEAT_EVENT, json!({})))
            .await
    }

    async fn close(&mut self) {
        if self.link.is_some() {
            info!("[ctrader] closing connection");
        }
        self.drop_link().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_before_open_report_closed_transport() {
        let mut provider = CTraderProvider::new(&UpstreamConfig::default());
        assert_eq!(provider.name(), "ctrader");
        assert!(matches!(
            provider.subscribe(&[1]).await,
            Err(UpstreamError::TransportClosed(_))
        ));
        assert!(matches!(
            provider.send_heartbeat().await,
            Err(UpstreamError::TransportClosed(_))
        ));
        provider.close().await;
    }

    #[test]
    fn url_comes_from_config() {
        let provider = CTraderProvider::new(&UpstreamConfig::default());
        assert_eq!(provider.url, "wss://demo.ctraderapi.com:5036");
    }
}
