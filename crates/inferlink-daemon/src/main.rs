//! `InferLink` Daemon
//!
//! Connects the local inference service to a relay through an outbound
//! WebSocket tunnel, so clients can reach it without an inbound port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use inferlink_core::config::load_config;
use inferlink_core::tracing_init::{default_filter, init_tracing};
use inferlink_daemon::local::HttpForwarder;
use inferlink_daemon::tunnel::auth::{login_url, parse_tunnel_url, redacted, tunnel_url_from_server};
use inferlink_daemon::tunnel::{Authenticator, Credentials, TunnelClient, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "inferlink-daemon")]
#[command(version, about = "InferLink daemon - reverse tunnel for a local inference service")]
struct Args {
    /// Relay server URL; the tunnel URL is derived from it (e.g. "https://relay.example.com")
    #[arg(long, env = "INFERLINK_SERVER_URL", conflicts_with = "tunnel_url")]
    server_url: Option<String>,

    /// Explicit tunnel URL, used verbatim (e.g. "wss://relay.example.com/tunnel")
    #[arg(long, env = "INFERLINK_TUNNEL_URL")]
    tunnel_url: Option<String>,

    /// Pre-issued bearer token for the tunnel
    #[arg(long, env = "INFERLINK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Username for relay login (instead of --token)
    #[arg(long, env = "INFERLINK_USERNAME")]
    username: Option<String>,

    /// Password for relay login
    #[arg(long, env = "INFERLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Tunnel path appended to --server-url
    #[arg(long, env = "INFERLINK_TUNNEL_PATH")]
    tunnel_path: Option<String>,

    /// Login path relative to the server URL
    #[arg(long, env = "INFERLINK_LOGIN_PATH")]
    login_path: Option<String>,

    /// Base URL of the local inference service
    #[arg(long, env = "INFERLINK_LOCAL_URL")]
    local_url: Option<String>,

    /// Maximum relayed requests served at once (1 = strictly sequential)
    #[arg(long, env = "INFERLINK_MAX_CONCURRENT_REQUESTS")]
    max_concurrent_requests: Option<usize>,

    /// Per-request timeout for the local service in seconds (0 disables it)
    #[arg(long, env = "INFERLINK_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// Seconds between WebSocket keepalive pings
    #[arg(long, env = "INFERLINK_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Additional settings file (JSON), layered over the global one
    #[arg(long, env = "INFERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "INFERLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "INFERLINK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_config(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        settings.logging.level.clone_from(level);
    }
    settings.logging.json |= args.log_json;
    init_tracing(
        &default_filter(env!("CARGO_PKG_NAME"), &settings.logging.level),
        settings.logging.json,
    );
    inferlink_daemon::install_crypto_provider();

    let tunnel = &mut settings.tunnel;
    if args.server_url.is_some() || args.tunnel_url.is_some() {
        tunnel.server_url.clone_from(&args.server_url);
        tunnel.tunnel_url.clone_from(&args.tunnel_url);
    }
    if let Some(path) = args.tunnel_path {
        tunnel.tunnel_path = path;
    }
    if let Some(path) = args.login_path {
        tunnel.login_path = path;
    }
    if let Some(n) = args.max_concurrent_requests {
        tunnel.max_concurrent_requests = n;
    }
    if let Some(secs) = args.heartbeat_secs {
        tunnel.heartbeat_secs = secs;
    }
    if let Some(url) = args.local_url {
        settings.local.url = url;
    }
    if let Some(secs) = args.request_timeout_secs {
        settings.local.request_timeout_secs = secs;
    }

    let (tunnel_url, auth_base) = match (
        settings.tunnel.server_url.as_deref(),
        settings.tunnel.tunnel_url.as_deref(),
    ) {
        (Some(server), None) => (
            tunnel_url_from_server(server, &settings.tunnel.tunnel_path)?,
            Url::parse(server).with_context(|| format!("invalid server URL {server:?}"))?,
        ),
        (None, Some(explicit)) => {
            let url = parse_tunnel_url(explicit)?;
            let mut base = url.clone();
            base.set_path("/");
            base.set_query(None);
            (url, base)
        }
        (Some(_), Some(_)) => {
            anyhow::bail!("set either a server URL or a tunnel URL, not both")
        }
        (None, None) => {
            anyhow::bail!("a server URL (--server-url) or tunnel URL (--tunnel-url) is required")
        }
    };

    let credentials = Credentials::from_parts(args.token, args.username, args.password)?;
    let login = if credentials.can_refresh() {
        Some(login_url(&auth_base, &settings.tunnel.login_path)?)
    } else {
        None
    };
    let auth = Authenticator::new(credentials, login)?;
    let service = Arc::new(HttpForwarder::new(&settings.local.url)?);
    let config = TunnelConfig::from_settings(tunnel_url, &settings.tunnel, &settings.local);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnel_url = %redacted(&config.tunnel_url),
        local_url = %settings.local.url,
        max_concurrent_requests = config.max_concurrent_requests,
        "Starting inferlink-daemon"
    );

    let cancel = CancellationToken::new();
    let client = TunnelClient::new(config, auth, service);
    let mut tunnel_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { client.run(cancel).await }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
        joined = &mut tunnel_handle => {
            let result = joined.context("tunnel task failed")?;
            if let Err(e) = &result {
                error!(error = %e, "Tunnel client stopped");
            }
            result?;
            info!("Daemon stopped");
            return Ok(());
        }
    }

    cancel.cancel();
    tunnel_handle.await.context("tunnel task failed")??;

    info!("Daemon stopped");
    Ok(())
}
