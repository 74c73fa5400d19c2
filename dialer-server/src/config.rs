use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tunnel_core::{ClusterKey, SessionConfig};

/// Cluster dialer server.
///
/// Accepts tunnels from cluster agents, lets internal callers dial into a
/// cluster by key and proxies plain HTTP into clusters by header.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "DIALER_SERVER_LISTEN", default_value = "0.0.0.0:80")]
    pub listen: String,

    /// Default netportal request timeout in seconds
    #[arg(long, env = "DIALER_SERVER_TIMEOUT", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Reject cluster agents that do not report cluster info
    #[arg(long, env = "DIALER_SERVER_NEED_CLUSTER_INFO", default_value_t = false)]
    pub need_cluster_info: bool,

    /// Static agent credentials as `clusterKey=secret` (comma separated).
    /// When empty any non-empty credential is accepted.
    #[arg(long = "access-key", env = "DIALER_SERVER_ACCESS_KEYS", value_delimiter = ',')]
    pub access_keys: Vec<String>,

    /// How long a netportal request waits for a cluster session, in seconds
    #[arg(long, env = "DIALER_SERVER_SESSION_WAIT", default_value_t = 5)]
    pub session_wait_secs: u64,

    /// Timeout for a dial-through to be acknowledged, in seconds
    #[arg(long, env = "DIALER_SERVER_DIAL_TIMEOUT", default_value_t = 10)]
    pub dial_timeout_secs: u64,

    /// Tunnel ping interval in seconds
    #[arg(long, env = "DIALER_SERVER_PING_INTERVAL", default_value_t = 15)]
    pub ping_interval_secs: u64,

    /// Tunnel staleness timeout in seconds
    #[arg(long, env = "DIALER_SERVER_STALE_TIMEOUT", default_value_t = 45)]
    pub stale_timeout_secs: u64,

    /// Maximum concurrent streams per tunnel
    #[arg(long, env = "DIALER_SERVER_MAX_STREAMS", default_value_t = 1024)]
    pub max_streams: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DIALER_SERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "DIALER_SERVER_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Force debug logging regardless of --log-level
    #[arg(long, env = "DIALER_SERVER_DEBUG", default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {0:?}")]
    InvalidListen(String),
    #[error("access key must look like clusterKey=secret, got {0:?}")]
    InvalidAccessKey(String),
    #[error("timeout must be at least one second")]
    ZeroTimeout,
    #[error("stale timeout must be longer than the ping interval")]
    StaleTimeout,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.stale_timeout_secs <= self.ping_interval_secs {
            return Err(ConfigError::StaleTimeout);
        }
        self.access_key_map()?;
        Ok(())
    }

    /// Static credentials by cluster key, `None` when none are configured.
    pub fn access_key_map(&self) -> Result<Option<HashMap<ClusterKey, String>>, ConfigError> {
        if self.access_keys.is_empty() {
            return Ok(None);
        }
        let mut keys = HashMap::with_capacity(self.access_keys.len());
        for entry in &self.access_keys {
            let (key, secret) = entry
                .split_once('=')
                .map(|(k, s)| (k.trim(), s.trim()))
                .filter(|(k, s)| !k.is_empty() && !s.is_empty())
                .ok_or_else(|| ConfigError::InvalidAccessKey(entry.clone()))?;
            keys.insert(ClusterKey::from(key), secret.to_string());
        }
        Ok(Some(keys))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_secs(self.session_wait_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            stale_timeout: Duration::from_secs(self.stale_timeout_secs),
            connect_timeout: Duration::from_secs(self.dial_timeout_secs),
            max_streams: self.max_streams,
        }
    }

    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}
