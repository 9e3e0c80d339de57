//! Reconnect scheduling and subscription restoration.
//!
//! The supervisor never drives I/O on its own. The relay actor polls
//! [`ReconnectSupervisor::wait_due`] as one of its `select!` branches and
//! performs the connect attempt when it fires; the supervisor only decides
//! *when*.
//!
//! Backoff: base delay on the first retry, doubling per consecutive failure,
//! capped at the max delay. Reaching `Ready` resets it.

use std::time::Duration;

use spot_core::{config::ReconnectConfig, error::UpstreamError};
use spot_upstream::UpstreamSession;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::SubscriptionRegistry;

/// Result of re-subscribing the registry after a reconnect.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Restored {
    /// Symbols subscribed upstream again.
    pub resubscribed: Vec<String>,
    /// Symbols the new directory no longer lists.
    pub vanished: Vec<String>,
}

#[derive(Debug)]
pub struct ReconnectSupervisor {
    base: Duration,
    max: Duration,
    /// Delay to use for the next scheduled retry.
    current: Duration,
    next_attempt: Option<Instant>,
    /// Whether the next attempt follows a failure or a drop.
    retrying: bool,
    /// Cleared by a deliberate shutdown.
    enabled: bool,
    failures: u32,
}

impl ReconnectSupervisor {
    pub fn new(config: &ReconnectConfig) -> Self {
        let base = config.base_delay();
        Self {
            base,
            max: config.max_delay().max(base),
            current: base,
            next_attempt: None,
            retrying: false,
            enabled: true,
            failures: 0,
        }
    }

    /// Schedule the first connect immediately.
    pub fn schedule_initial(&mut self) {
        if self.enabled {
            self.next_attempt = Some(Instant::now());
            self.retrying = false;
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve when the scheduled attempt is due; pend forever otherwise.
    ///
    /// Cancel-safe: suitable as a `tokio::select!` branch.
    pub async fn wait_due(&self) {
        match self.next_attempt {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    /// Consume the due attempt. Returns `true` when it is a retry (the
    /// session should pass through `Reconnecting`).
    pub fn begin_attempt(&mut self) -> bool {
        self.next_attempt = None;
        self.retrying
    }

    /// The session reached `Ready` and its subscriptions are restored.
    pub fn on_ready(&mut self) {
        if self.failures > 0 {
            info!("[supervisor] connected after {} failed attempts", self.failures);
        }
        self.current = self.base;
        self.failures = 0;
        self.next_attempt = None;
    }

    /// A connect attempt (or the restoration after it) failed.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        self.arm()
    }

    /// The session dropped unexpectedly.
    pub fn on_disconnect(&mut self) -> Option<Duration> {
        self.arm()
    }

    /// Deliberate shutdown: nothing is scheduled from now on.
    pub fn shutdown(&mut self) {
        self.enabled = false;
        self.next_attempt = None;
    }

    fn arm(&mut self) -> Option<Duration> {
        if !self.enabled {
            debug!("[supervisor] disabled, not scheduling a reconnect");
            return None;
        }
        if self.next_attempt.is_some() {
            return None;
        }
        let delay = self.current;
        self.next_attempt = Some(Instant::now() + delay);
        self.retrying = true;
        self.current = (self.current * 2).min(self.max);
        info!("[supervisor] reconnect in {delay:?}");
        Some(delay)
    }

    /// Re-subscribe every symbol with a positive count.
    ///
    /// Symbols missing from the fresh directory are reported in
    /// [`Restored::vanished`] rather than failing the restoration. Any other
    /// error aborts it.
    pub async fn restore(
        &self,
        session: &mut UpstreamSession,
        registry: &SubscriptionRegistry,
    ) -> Result<Restored, UpstreamError> {
        let mut out = Restored::default();
        for symbol in registry.all_active_symbols() {
            match session.subscribe_symbol(&symbol).await {
                Ok(()) => out.resubscribed.push(symbol),
                Err(UpstreamError::UnknownSymbol(_)) => {
                    warn!("[supervisor] {symbol} is gone from the directory after reconnect");
                    out.vanished.push(symbol);
                }
                Err(e) => {
                    warn!("[supervisor] restoring {symbol} failed: {e}");
                    return Err(e);
                }
            }
        }
        if !out.resubscribed.is_empty() {
            info!("[supervisor] restored {} upstream subscriptions", out.resubscribed.len());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use spot_core::{config::UpstreamConfig, types::Symbol};
    use spot_upstream::mock::MockProvider;

    use super::*;
    use crate::registry::ClientId;

    fn config() -> ReconnectConfig {
        ReconnectConfig { base_delay_ms: 1_000, max_delay_ms: 30_000 }
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let mut sup = ReconnectSupervisor::new(&config());
        let mut delays = Vec::new();
        for _ in 0..7 {
            delays.push(sup.on_failure().unwrap());
            assert!(sup.begin_attempt());
        }
        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(sup.consecutive_failures(), 7);

        sup.on_ready();
        assert_eq!(sup.current_delay(), Duration::from_secs(1));
        assert_eq!(sup.on_disconnect(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn initial_attempt_is_immediate_and_not_a_retry() {
        let mut sup = ReconnectSupervisor::new(&config());
        assert!(sup.deadline().is_none());
        sup.schedule_initial();
        assert!(sup.deadline().is_some_and(|at| at <= Instant::now()));
        sup.wait_due().await;
        assert!(!sup.begin_attempt());
        assert!(sup.deadline().is_none());
    }

    #[tokio::test]
    async fn shutdown_disables_scheduling() {
        let mut sup = ReconnectSupervisor::new(&config());
        sup.shutdown();
        assert_eq!(sup.on_disconnect(), None);
        assert_eq!(sup.on_failure(), None);
        sup.schedule_initial();
        assert!(sup.deadline().is_none());
        assert!(!sup.is_enabled());
    }

    #[tokio::test]
    async fn one_pending_attempt_at_a_time() {
        let mut sup = ReconnectSupervisor::new(&config());
        assert!(sup.on_disconnect().is_some());
        assert_eq!(sup.on_disconnect(), None);
        assert_eq!(sup.current_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn restore_resubscribes_and_reports_vanished() {
        let (provider, control) = MockProvider::new(vec![
            Symbol::new("EURUSD", 1, Some(5)),
            Symbol::new("GBPUSD", 2, Some(5)),
        ]);
        let upstream = UpstreamConfig { request_timeout_ms: 100, ..Default::default() };
        let mut session = UpstreamSession::new(Box::new(provider), upstream);
        session.connect().await.unwrap();

        let mut registry = SubscriptionRegistry::new();
        registry.add_interest(ClientId(1), "EURUSD");
        registry.add_interest(ClientId(2), "XAUUSD");

        let sup = ReconnectSupervisor::new(&config());
        let restored = sup.restore(&mut session, &registry).await.unwrap();
        assert_eq!(restored.resubscribed, vec!["EURUSD".to_string()]);
        assert_eq!(restored.vanished, vec!["XAUUSD".to_string()]);
        assert_eq!(control.subscribe_count(1), 1);
    }

    #[tokio::test]
    async fn restore_aborts_on_upstream_failure() {
        let (provider, control) = MockProvider::new(vec![Symbol::new("EURUSD", 1, Some(5))]);
        let upstream = UpstreamConfig { request_timeout_ms: 100, ..Default::default() };
        let mut session = UpstreamSession::new(Box::new(provider), upstream);
        session.connect().await.unwrap();
        control.fail_subscribe(1);

        let mut registry = SubscriptionRegistry::new();
        registry.add_interest(ClientId(1), "EURUSD");
        let sup = ReconnectSupervisor::new(&config());
        let restored = sup.restore(&mut session, &registry).await;
        assert!(matches!(restored, Err(UpstreamError::Rejected(_))));
    }
}
