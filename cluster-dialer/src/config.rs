use std::time::Duration;

use rand::Rng;
use tunnel_core::{paths, websocket_url, SessionConfig};

use crate::error::DialerError;

/// Environment variable holding the dialer base address.
pub const ENDPOINT_ENV: &str = "CLUSTER_DIALER_ADDR";

#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Base address of the dialer server, e.g. `http://cluster-dialer:80`.
    pub endpoint: String,
    /// WebSocket handshake timeout.
    pub connect_timeout: Duration,
    /// How long a dial waits for the shared session to come up.
    pub session_wait: Duration,
    /// How long a dial waits for the remote side to accept.
    pub dial_timeout: Duration,
    /// Reconnect delays are drawn uniformly from this range.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub ping_interval: Duration,
    pub stale_timeout: Duration,
}

impl DialerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
            session_wait: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(5),
            ping_interval: Duration::from_secs(15),
            stale_timeout: Duration::from_secs(45),
        }
    }

    /// Read the endpoint from `CLUSTER_DIALER_ADDR`.
    pub fn from_env() -> Result<Self, DialerError> {
        Self::from_endpoint_var(std::env::var(ENDPOINT_ENV).ok())
    }

    fn from_endpoint_var(value: Option<String>) -> Result<Self, DialerError> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Self::new)
            .ok_or(DialerError::MissingEndpoint)
    }

    /// WebSocket URL of the peer dialer endpoint.
    pub fn url(&self) -> String {
        websocket_url(&self.endpoint, paths::DIALER)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: self.ping_interval,
            stale_timeout: self.stale_timeout,
            connect_timeout: self.dial_timeout,
            ..SessionConfig::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        let min = self.reconnect_min.as_millis() as u64;
        let max = (self.reconnect_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
