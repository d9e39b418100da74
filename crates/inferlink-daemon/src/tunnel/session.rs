//! One WebSocket connection to the relay.
//!
//! A session owns the socket from a successful upgrade until it is closed.
//! Frames are read in arrival order; each request is dispatched on its own
//! task, bounded by a semaphore, and responses funnel through a single
//! writer task so frames never interleave on the wire.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt as _, StreamExt as _};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TunnelConfig;
use super::error::TunnelClientError;
use super::handler::TunnelRequestHandler;
use super::protocol::{
    ControlKind, CorrelationId, InboundFrame, RequestEnvelope, ResponseEnvelope, decode,
};

/// Outbound frames buffered ahead of the writer.
const OUTBOUND_BUFFER: usize = 64;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a session stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested locally.
    Shutdown,
    /// The relay closed the connection.
    ClosedByPeer { reason: String },
}

enum Job {
    Dispatch(RequestEnvelope),
    Reject { id: CorrelationId, reason: String },
}

pub struct TunnelSession {
    stream: WsStream,
}

impl TunnelSession {
    /// Open the WebSocket. `url` already carries the token.
    pub async fn connect(url: &Url) -> Result<Self, TunnelClientError> {
        let (stream, _response) = connect_async(url.as_str()).await.map_err(connect_error)?;
        Ok(Self { stream })
    }

    /// Serve frames until the peer closes, the stream fails or `cancel` fires.
    #[allow(clippy::too_many_lines)]
    pub async fn serve(
        self,
        handler: Arc<TunnelRequestHandler>,
        config: &TunnelConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, TunnelClientError> {
        let (sink, mut stream) = self.stream.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);
        let mut writer = tokio::spawn(write_loop(sink, rx));

        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        let mut in_flight = JoinSet::new();

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // Skip first immediate tick

        let outcome = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break Ok(SessionEnd::Shutdown),

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(close))) => {
                            let reason = close
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                                .unwrap_or_else(|| "no close frame".to_string());
                            break Ok(SessionEnd::ClosedByPeer { reason });
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            debug!(len = data.len(), "Ignoring binary tunnel frame");
                            continue;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(TunnelClientError::Stream(e.to_string())),
                        None => {
                            break Ok(SessionEnd::ClosedByPeer {
                                reason: "stream ended".to_string(),
                            });
                        }
                    };

                    let job = match decode(text.as_str()) {
                        InboundFrame::Control(control) => {
                            match control.kind {
                                ControlKind::Connected => {
                                    let user_id = control.user_id();
                                    info!(
                                        user_id = user_id.as_deref().unwrap_or("unknown"),
                                        "Tunnel authenticated for user"
                                    );
                                }
                            }
                            continue;
                        }
                        InboundFrame::Malformed { reason } => {
                            warn!(%reason, "Dropping malformed tunnel frame");
                            continue;
                        }
                        InboundFrame::Request(request) => Job::Dispatch(request),
                        InboundFrame::Rejected { id, reason } => Job::Reject { id, reason },
                    };

                    let Some(permit) = acquire(&permits, cancel).await else {
                        break Ok(SessionEnd::Shutdown);
                    };
                    while let Some(joined) = in_flight.try_join_next() {
                        log_task_failure(joined);
                    }
                    in_flight.spawn(run_job(job, Arc::clone(&handler), tx.clone(), permit));
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = queue_ping(&tx) {
                        break Err(e);
                    }
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_task_failure(joined);
                }
            }
        };

        match &outcome {
            Ok(SessionEnd::Shutdown) => {
                drain(&mut in_flight, config.shutdown_grace).await;
                // The writer sends a Close frame once every sender is gone.
                drop(tx);
                if tokio::time::timeout(config.shutdown_grace, &mut writer)
                    .await
                    .is_err()
                {
                    writer.abort();
                }
            }
            _ => {
                in_flight.shutdown().await;
                writer.abort();
            }
        }

        outcome
    }
}

fn connect_error(e: WsError) -> TunnelClientError {
    match e {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TunnelClientError::Rejected {
                status: response.status().as_u16(),
            }
        }
        WsError::Http(response) => TunnelClientError::Connection(format!(
            "relay refused the upgrade: HTTP {}",
            response.status()
        )),
        other => TunnelClientError::Connection(other.to_string()),
    }
}

/// Queue a keepalive without waiting. A full queue skips this ping.
fn queue_ping(tx: &mpsc::Sender<WsMessage>) -> Result<(), TunnelClientError> {
    match tx.try_send(WsMessage::Ping(Vec::new().into())) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            debug!("Outbound queue full, skipping ping");
            Ok(())
        }
        Err(TrySendError::Closed(_)) => {
            Err(TunnelClientError::Stream("tunnel writer stopped".into()))
        }
    }
}

fn log_task_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!(error = %e, "Request task panicked");
        }
    }
}

/// Wait for a dispatch slot. `None` when shutdown wins the race.
async fn acquire(
    permits: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        permit = Arc::clone(permits).acquire_owned() => permit.ok(),
    }
}

async fn run_job(
    job: Job,
    handler: Arc<TunnelRequestHandler>,
    tx: mpsc::Sender<WsMessage>,
    _permit: OwnedSemaphorePermit,
) {
    let response = match job {
        Job::Dispatch(request) => handler.dispatch(request).await,
        Job::Reject { id, reason } => TunnelRequestHandler::reject(id, &reason),
    };
    send_response(&tx, &response).await;
}

async fn send_response(tx: &mpsc::Sender<WsMessage>, response: &ResponseEnvelope) {
    let text = match response.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(request_id = %response.id, error = %e, "Failed to encode response");
            return;
        }
    };
    if tx.send(WsMessage::Text(text.into())).await.is_err() {
        debug!(request_id = %response.id, "Connection gone, response dropped");
    }
}

/// Let in-flight requests finish within `grace`, then abort the rest.
async fn drain(in_flight: &mut JoinSet<()>, grace: Duration) {
    if in_flight.is_empty() {
        return;
    }
    let pending = in_flight.len();
    debug!(pending, "Waiting for in-flight requests");
    let finished = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        warn!(
            remaining = in_flight.len(),
            grace_secs = grace.as_secs(),
            "Aborting requests still running after shutdown grace"
        );
        in_flight.shutdown().await;
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Tunnel write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ping_skipped_when_writer_backed_up() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(WsMessage::Text("queued".into())).unwrap();

        assert!(queue_ping(&tx).is_ok());
        assert!(matches!(rx.try_recv().unwrap(), WsMessage::Text(_)));
        assert!(rx.try_recv().is_err(), "ping must not be queued behind a full buffer");
    }

    #[test]
    fn ping_queued_when_room() {
        let (tx, mut rx) = mpsc::channel(1);
        queue_ping(&tx).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), WsMessage::Ping(_)));
    }

    #[test]
    fn ping_fails_once_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(matches!(queue_ping(&tx), Err(TunnelClientError::Stream(_))));
    }

    #[test]
    fn upgrade_refusals_map_to_rejected() {
        use tokio_tungstenite::tungstenite::http::Response;

        for (status, rejected) in [(401, true), (403, true), (404, false), (502, false)] {
            let response = Response::builder().status(status).body(None).unwrap();
            let err = connect_error(WsError::Http(response.into()));
            assert_eq!(
                matches!(err, TunnelClientError::Rejected { status: s } if s == status),
                rejected,
                "HTTP {status}"
            );
        }
    }
}
