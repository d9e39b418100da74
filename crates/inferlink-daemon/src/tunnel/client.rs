//! Tunnel client with reconnection.
//!
//! Keeps one session to the relay alive until cancelled. Failed attempts
//! back off exponentially; reaching Connected resets the delay to the floor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::local::LocalService;

use super::auth::{AuthError, Authenticator, redacted, with_token};
use super::config::{Backoff, TunnelConfig};
use super::error::TunnelClientError;
use super::handler::TunnelRequestHandler;
use super::session::{SessionEnd, TunnelSession};

/// Lifecycle notifications, for supervisors and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
}

/// Tunnel client that maintains a persistent connection to the relay.
pub struct TunnelClient {
    config: TunnelConfig,
    auth: Authenticator,
    handler: Arc<TunnelRequestHandler>,
    events: Option<mpsc::Sender<TunnelEvent>>,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig, auth: Authenticator, service: Arc<dyn LocalService>) -> Self {
        let handler =
            Arc::new(TunnelRequestHandler::new(service).with_timeout(config.request_timeout));
        Self {
            config,
            auth,
            handler,
            events: None,
        }
    }

    /// Report lifecycle events on `tx`. Events are dropped when it is full.
    #[must_use]
    pub fn with_event_channel(mut self, tx: mpsc::Sender<TunnelEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Run until `cancel` fires.
    ///
    /// Returns `Ok(())` on shutdown. Errors only when continuing is pointless:
    /// the credentials were refused at login, or `max_attempts` ran out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TunnelClientError> {
        let mut token = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            token = self.auth.obtain_token() => token?,
        };

        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut needs_login = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if needs_login {
                match self.login_again(&cancel).await {
                    Ok(Some(fresh)) => {
                        token = fresh;
                        needs_login = false;
                    }
                    Ok(None) => return Ok(()),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        warn!(error = %e, "Re-login failed");
                        if !self.wait_before_retry(&mut backoff, &cancel).await? {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            let reason = match self.connect_and_serve(&token, &mut backoff, &cancel).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Tunnel shut down");
                    return Ok(());
                }
                Ok(SessionEnd::ClosedByPeer { reason }) => {
                    info!(%reason, "Relay closed the tunnel");
                    reason
                }
                Err(e) if cancel.is_cancelled() => {
                    debug!(error = %e, "Tunnel error during shutdown");
                    return Ok(());
                }
                Err(TunnelClientError::Rejected { status }) => {
                    if self.auth.can_refresh() {
                        warn!(status, "Relay rejected the token, logging in again");
                        needs_login = true;
                    } else {
                        error!(status, "Relay rejected the tunnel token");
                    }
                    format!("token rejected (HTTP {status})")
                }
                Err(e) => {
                    warn!(error = %e, "Tunnel connection failed");
                    e.to_string()
                }
            };
            self.emit(TunnelEvent::Disconnected { reason });

            if !self.wait_before_retry(&mut backoff, &cancel).await? {
                return Ok(());
            }
        }
    }

    async fn connect_and_serve(
        &self,
        token: &str,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, TunnelClientError> {
        let url = with_token(&self.config.tunnel_url, token);
        info!(url = %redacted(&url), "Connecting to relay");

        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            session = TunnelSession::connect(&url) => session?,
        };

        info!("Tunnel connected");
        backoff.reset();
        self.emit(TunnelEvent::Connected);

        session
            .serve(Arc::clone(&self.handler), &self.config, cancel)
            .await
    }

    /// Exchange credentials for a fresh token. `None` when cancelled.
    async fn login_again(&self, cancel: &CancellationToken) -> Result<Option<String>, AuthError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            token = self.auth.obtain_token() => token.map(Some),
        }
    }

    /// Sleep out the next backoff delay. `Ok(false)` when cancelled meanwhile.
    async fn wait_before_retry(
        &self,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Result<bool, TunnelClientError> {
        if !backoff.should_retry() {
            let attempts = backoff.attempts();
            error!(attempts, "Giving up on the relay");
            return Err(TunnelClientError::RetriesExhausted { attempts });
        }

        let delay = backoff.next_delay();
        let attempt = backoff.attempts();
        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );
        self.emit(TunnelEvent::Reconnecting { attempt, delay });

        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(false),
            () = tokio::time::sleep(delay) => Ok(true),
        }
    }

    fn emit(&self, event: TunnelEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                debug!("Tunnel event dropped");
            }
        }
    }
}
