//! # spot-relay
//!
//! Fans one upstream price stream out to many WebSocket clients.
//!
//! ## Architecture
//!
//! A single actor ([`server::RelayServer`]) owns all mutable state: the
//! [`registry::SubscriptionRegistry`], the client table, the
//! [`spot_upstream::UpstreamSession`] and the
//! [`supervisor::ReconnectSupervisor`]. Connection tasks in [`transport`]
//! talk to it only through a [`server::RelayHandle`].
//!
//! - [`registry`] — per-client interest, reference counts, 0↔1 transitions
//! - [`protocol`] — client-facing JSON messages
//! - [`server`] — the actor: requests, fan-out, status broadcasts
//! - [`supervisor`] — reconnect backoff and subscription restoration
//! - [`transport`] — tokio-tungstenite listener and per-connection tasks

pub mod protocol;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use registry::{Action, ClientId, SubscriptionRegistry};
pub use server::{RelayHandle, RelayServer};
