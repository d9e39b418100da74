//! Reverse-tunnel client connecting the local service to a relay server.
//!
//! Dials the relay over WebSocket, answers every relayed request frame with
//! a response frame carrying the same `id`, and reconnects with exponential
//! backoff whenever the connection drops.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod session;

pub use auth::{Authenticator, Credentials};
pub use client::{TunnelClient, TunnelEvent};
pub use config::{ReconnectPolicy, TunnelConfig};
pub use error::TunnelClientError;
pub use handler::TunnelRequestHandler;
pub use session::{SessionEnd, TunnelSession};
