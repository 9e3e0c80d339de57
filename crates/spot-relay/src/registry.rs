//! Per-client symbol interest with reference counting.
//!
//! Pure bookkeeping, no I/O. The registry tells the caller when a symbol's
//! count crosses 0↔1 so exactly one upstream subscribe/unsubscribe is issued
//! per transition, no matter how many clients come and go.
//!
//! The count of a symbol is the size of its subscriber set, so it always
//! equals the number of distinct clients holding it and cannot go negative.

use std::collections::BTreeSet;

use ahash::AHashMap;

/// Opaque downstream connection id, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// What the caller must do upstream after an interest change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Count went 0 → 1.
    NeedsUpstreamSubscribe,
    /// Count went 1 → 0.
    NeedsUpstreamUnsubscribe,
    NoOp,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Client → wanted symbols (ordered for stable replies).
    clients: AHashMap<ClientId, BTreeSet<String>>,
    /// Symbol → holding clients. Entries are removed when they empty.
    subscribers: AHashMap<String, BTreeSet<ClientId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a client with no interests yet. Idempotent.
    pub fn register_client(&mut self, client: ClientId) {
        self.clients.entry(client).or_default();
    }

    pub fn add_interest(&mut self, client: ClientId, symbol: &str) -> Action {
        let held = self.clients.entry(client).or_default();
        if !held.insert(symbol.to_string()) {
            return Action::NoOp;
        }
        let holders = self.subscribers.entry(symbol.to_string()).or_default();
        holders.insert(client);
        if holders.len() == 1 {
            Action::NeedsUpstreamSubscribe
        } else {
            Action::NoOp
        }
    }

    pub fn remove_interest(&mut self, client: ClientId, symbol: &str) -> Action {
        let Some(held) = self.clients.get_mut(&client) else {
            return Action::NoOp;
        };
        if !held.remove(symbol) {
            return Action::NoOp;
        }
        if self.release(client, symbol) {
            Action::NeedsUpstreamUnsubscribe
        } else {
            Action::NoOp
        }
    }

    /// Drop every holding of `client`. Returns the symbols whose count
    /// reached zero.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<String> {
        let Some(held) = self.clients.remove(&client) else {
            return Vec::new();
        };
        held.into_iter().filter(|symbol| self.release(client, symbol)).collect()
    }

    /// Remove `client` from `symbol`'s holders; true when none remain.
    fn release(&mut self, client: ClientId, symbol: &str) -> bool {
        let Some(holders) = self.subscribers.get_mut(symbol) else {
            return false;
        };
        holders.remove(&client);
        if holders.is_empty() {
            self.subscribers.remove(symbol);
            true
        } else {
            false
        }
    }

    /// Forget `symbol` entirely (it no longer exists upstream). Returns the
    /// clients that held it, sorted.
    pub fn purge_symbol(&mut self, symbol: &str) -> Vec<ClientId> {
        let Some(holders) = self.subscribers.remove(symbol) else {
            return Vec::new();
        };
        for client in &holders {
            if let Some(held) = self.clients.get_mut(client) {
                held.remove(symbol);
            }
        }
        holders.into_iter().collect()
    }

    /// Clients currently holding `symbol`, sorted.
    pub fn interested_clients(&self, symbol: &str) -> Vec<ClientId> {
        self.subscribers
            .get(symbol)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every symbol with a positive count, sorted.
    pub fn all_active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.subscribers.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    /// Symbols held by `client`, sorted.
    pub fn symbols_of(&self, client: ClientId) -> Vec<String> {
        self.clients
            .get(&client)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ref_count(&self, symbol: &str) -> usize {
        self.subscribers.get(symbol).map_or(0, BTreeSet::len)
    }

    pub fn contains_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }
}
