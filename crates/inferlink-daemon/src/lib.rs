//! `InferLink` Daemon Library
//!
//! Reverse-tunnel client for the inference backend:
//! - Outbound WebSocket tunnel to a relay with automatic reconnection
//! - JSON envelope codec for relayed HTTP requests and responses
//! - Local Service boundary the relayed requests are dispatched into

pub mod local;
pub mod tunnel;

/// Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider,
/// tokio-tungstenite uses rustls for `wss://`).
///
/// The `Err` case just means it was already installed.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
