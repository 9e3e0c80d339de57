//! # spot-core
//!
//! Core crate for the spot price relay, providing:
//!
//! - **Types** (`types`) — symbol metadata, price updates, status enums
//! - **Configuration** (`config`) — JSON config deserialization
//! - **Error types** (`error`) — the `UpstreamError` taxonomy via thiserror
//! - **Time utilities** (`time_util`) — wall-clock timestamps
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
