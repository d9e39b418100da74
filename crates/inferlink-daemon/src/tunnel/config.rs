//! Tunnel client configuration.

use std::time::Duration;

use inferlink_core::config::{LocalSettings, TunnelSettings};
use reqwest::Url;

/// Configuration for the daemon's tunnel connection to the relay.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Tunnel endpoint without the token query parameter
    /// (e.g., "wss://relay.example.com/tunnel").
    pub tunnel_url: Url,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Interval between WebSocket keepalive pings.
    pub heartbeat_interval: Duration,

    /// Upper bound on requests dispatched concurrently on one connection.
    /// `1` processes frames strictly one after another.
    pub max_concurrent_requests: usize,

    /// Time in-flight requests get to finish once shutdown is requested.
    pub shutdown_grace: Duration,

    /// Per-request timeout for the Local Service (None = unbounded).
    pub request_timeout: Option<Duration>,
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Backoff state across consecutive failed attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to wait now; grows the delay for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the floor delay. Called whenever a session reaches Connected.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failed attempts since the last reset.
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn should_retry(&self) -> bool {
        self.policy.should_retry(self.attempt)
    }
}

impl TunnelConfig {
    /// Create a new tunnel config with defaults.
    pub fn new(tunnel_url: Url) -> Self {
        Self {
            tunnel_url,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_requests: 4,
            shutdown_grace: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(300)),
        }
    }

    /// Build from resolved settings.
    pub fn from_settings(tunnel_url: Url, tunnel: &TunnelSettings, local: &LocalSettings) -> Self {
        Self {
            tunnel_url,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(tunnel.initial_reconnect_delay_ms),
                max_delay: Duration::from_millis(tunnel.max_reconnect_delay_ms),
                multiplier: 2.0,
                max_attempts: tunnel.max_reconnect_attempts,
            },
            heartbeat_interval: Duration::from_secs(tunnel.heartbeat_secs.max(1)),
            max_concurrent_requests: tunnel.max_concurrent_requests.max(1),
            shutdown_grace: Duration::from_secs(tunnel.shutdown_grace_secs),
            request_timeout: (local.request_timeout_secs > 0)
                .then(|| Duration::from_secs(local.request_timeout_secs)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(policy.max_attempts.is_none());
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = ReconnectPolicy::default();

        // 1s, 2s, 4s, 8s, 16s, 30s (capped), 30s
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn backoff_grows_across_consecutive_failures() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[test]
    fn backoff_reset_returns_to_floor() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn retry_with_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let mut backoff = Backoff::new(policy);
        for _ in 0..3 {
            assert!(backoff.should_retry());
            backoff.next_delay();
        }
        assert!(!backoff.should_retry());
    }

    #[test]
    fn retry_unlimited() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(u32::MAX));
    }

    #[test]
    fn tunnel_config_new() {
        let config = TunnelConfig::new(Url::parse("wss://relay.example.com/tunnel").unwrap());
        assert_eq!(config.tunnel_url.as_str(), "wss://relay.example.com/tunnel");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn from_settings_clamps_and_disables_timeout() {
        let tunnel = TunnelSettings {
            max_concurrent_requests: 0,
            heartbeat_secs: 0,
            max_reconnect_attempts: Some(5),
            ..Default::default()
        };
        let local = LocalSettings {
            request_timeout_secs: 0,
            ..Default::default()
        };
        let config = TunnelConfig::from_settings(
            Url::parse("ws://127.0.0.1:9000/tunnel").unwrap(),
            &tunnel,
            &local,
        );
        assert_eq!(config.max_concurrent_requests, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
        assert!(config.request_timeout.is_none());
    }
}
