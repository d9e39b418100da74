//! Tunnel client error types.

use super::auth::AuthError;

/// Errors that can occur in the tunnel client.
#[derive(Debug, thiserror::Error)]
pub enum TunnelClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    /// The relay refused the WebSocket upgrade with 401/403.
    #[error("Relay rejected the tunnel token (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}
