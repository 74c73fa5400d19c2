use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tunnel_core::SessionConfig;

/// Cluster tunnel agent.
///
/// Runs inside a remote cluster, keeps one outbound WebSocket tunnel to the
/// cluster dialer and serves dial-throughs to in-cluster addresses.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Cluster dialer URL (e.g. https://cluster-dialer.example.com)
    #[arg(long, env = "CLUSTER_AGENT_SERVER_URL")]
    pub server_url: String,

    /// Cluster key this agent registers under
    #[arg(long, env = "CLUSTER_AGENT_CLUSTER_KEY")]
    pub cluster_key: String,

    /// Access credential sent as `Authorization` (may start empty)
    #[arg(long, env = "CLUSTER_AGENT_ACCESS_KEY", default_value = "")]
    pub access_key: String,

    /// File holding the access credential; re-read for rotation
    #[arg(long, env = "CLUSTER_AGENT_ACCESS_KEY_FILE")]
    pub access_key_file: Option<PathBuf>,

    /// Credential file poll interval in seconds
    #[arg(long, env = "CLUSTER_AGENT_CREDENTIAL_POLL_SECS", default_value_t = 10)]
    pub credential_poll_secs: u64,

    /// Client type; anything other than `cluster` registers a non-cluster client
    #[arg(long, env = "CLUSTER_AGENT_CLIENT_TYPE")]
    pub client_type: Option<String>,

    /// Client detail JSON object reported by non-cluster clients
    #[arg(long, env = "CLUSTER_AGENT_CLIENT_DETAIL")]
    pub client_detail: Option<String>,

    /// Cluster API address reported in the cluster info header
    #[arg(long, env = "CLUSTER_AGENT_CLUSTER_ADDRESS")]
    pub cluster_address: Option<String>,

    /// Cluster API bearer token reported in the cluster info header
    #[arg(long, env = "CLUSTER_AGENT_CLUSTER_TOKEN")]
    pub cluster_token: Option<String>,

    /// Cluster CA certificate file reported in the cluster info header
    #[arg(long, env = "CLUSTER_AGENT_CLUSTER_CA_CERT_FILE")]
    pub cluster_ca_cert_file: Option<PathBuf>,

    /// Honor dial-throughs to TCP addresses
    #[arg(long, env = "CLUSTER_AGENT_ALLOW_TCP", default_value_t = true)]
    pub allow_tcp: bool,

    /// Unix socket paths dial-throughs may reach
    #[arg(
        long,
        env = "CLUSTER_AGENT_ALLOWED_UNIX_SOCKETS",
        value_delimiter = ',',
        default_values_t = vec!["/var/run/docker.sock".to_string()]
    )]
    pub allowed_unix_sockets: Vec<String>,

    /// Local target connect timeout in seconds
    #[arg(long, env = "CLUSTER_AGENT_DIAL_TIMEOUT", default_value_t = 10)]
    pub dial_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CLUSTER_AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "CLUSTER_AGENT_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Force debug logging regardless of --log-level
    #[arg(long, env = "CLUSTER_AGENT_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// WebSocket reconnect base delay in milliseconds
    #[arg(long, env = "CLUSTER_AGENT_RECONNECT_BASE_MS", default_value_t = 500)]
    pub reconnect_base_ms: u64,

    /// WebSocket reconnect max delay in milliseconds
    #[arg(long, env = "CLUSTER_AGENT_RECONNECT_MAX_MS", default_value_t = 10000)]
    pub reconnect_max_ms: u64,

    /// WebSocket handshake timeout in seconds
    #[arg(long, env = "CLUSTER_AGENT_CONNECT_TIMEOUT", default_value_t = 15)]
    pub connect_timeout_secs: u64,

    /// Tunnel ping interval in seconds
    #[arg(long, env = "CLUSTER_AGENT_PING_INTERVAL", default_value_t = 15)]
    pub ping_interval_secs: u64,

    /// Tunnel staleness timeout in seconds (reconnect if no data received)
    #[arg(long, env = "CLUSTER_AGENT_STALE_TIMEOUT", default_value_t = 45)]
    pub stale_timeout_secs: u64,

    /// Maximum concurrent streams over the tunnel
    #[arg(long, env = "CLUSTER_AGENT_MAX_STREAMS", default_value_t = 1024)]
    pub max_streams: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server url must be http(s):// or ws(s)://, got {0:?}")]
    InvalidServerUrl(String),
    #[error("cluster key must not be empty")]
    EmptyClusterKey,
    #[error("cluster address, token and CA cert file must be set together")]
    PartialClusterInfo,
    #[error("failed to read CA cert {path}: {source}")]
    CaCert {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("client detail must be a JSON object: {0}")]
    ClientDetail(String),
    #[error("reconnect base delay {base}ms exceeds max {max}ms")]
    Backoff { base: u64, max: u64 },
    #[error("stale timeout must be longer than the ping interval")]
    StaleTimeout,
}

/// Cluster metadata self-reported to the dialer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub address: String,
    pub token: String,
    #[serde(rename = "caCert")]
    pub ca_cert: String,
}

impl ClusterInfo {
    /// Header form: base64 (standard alphabet) of the JSON document.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(json)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server_url.as_str();
        if !["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            return Err(ConfigError::InvalidServerUrl(self.server_url.clone()));
        }
        if self.cluster_key.trim().is_empty() {
            return Err(ConfigError::EmptyClusterKey);
        }

        let info_fields = [
            self.cluster_address.is_some(),
            self.cluster_token.is_some(),
            self.cluster_ca_cert_file.is_some(),
        ];
        if info_fields.iter().any(|set| *set) && !info_fields.iter().all(|set| *set) {
            return Err(ConfigError::PartialClusterInfo);
        }

        if let Some(detail) = &self.client_detail {
            match serde_json::from_str::<serde_json::Value>(detail) {
                Ok(serde_json::Value::Object(_)) => {}
                Ok(_) => return Err(ConfigError::ClientDetail("not an object".into())),
                Err(e) => return Err(ConfigError::ClientDetail(e.to_string())),
            }
        }

        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConfigError::Backoff {
                base: self.reconnect_base_ms,
                max: self.reconnect_max_ms,
            });
        }
        if self.stale_timeout_secs <= self.ping_interval_secs {
            return Err(ConfigError::StaleTimeout);
        }
        Ok(())
    }

    /// Load the cluster info header payload, if configured.
    pub fn cluster_info(&self) -> Result<Option<ClusterInfo>, ConfigError> {
        let (Some(address), Some(token), Some(ca_path)) = (
            &self.cluster_address,
            &self.cluster_token,
            &self.cluster_ca_cert_file,
        ) else {
            return Ok(None);
        };
        let ca_cert = std::fs::read_to_string(ca_path).map_err(|source| ConfigError::CaCert {
            path: ca_path.clone(),
            source,
        })?;
        Ok(Some(ClusterInfo {
            address: address.clone(),
            token: token.clone(),
            ca_cert,
        }))
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

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Optional TOML config; values become env-var defaults for clap.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server_url: Option<String>,
    pub cluster_key: Option<String>,
    pub access_key: Option<String>,
    pub access_key_file: Option<String>,
    pub credential_poll_secs: Option<u64>,
    pub client_type: Option<String>,
    pub client_detail: Option<String>,
    pub cluster_address: Option<String>,
    pub cluster_token: Option<String>,
    pub cluster_ca_cert_file: Option<String>,
    pub allow_tcp: Option<bool>,
    pub allowed_unix_sockets: Option<Vec<String>>,
    pub dial_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
    pub debug: Option<bool>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub ping_interval_secs: Option<u64>,
    pub stale_timeout_secs: Option<u64>,
    pub max_streams: Option<usize>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }

        set!("CLUSTER_AGENT_SERVER_URL", self.server_url);
        set!("CLUSTER_AGENT_CLUSTER_KEY", self.cluster_key);
        set!("CLUSTER_AGENT_ACCESS_KEY", self.access_key);
        set!("CLUSTER_AGENT_ACCESS_KEY_FILE", self.access_key_file);
        set!("CLUSTER_AGENT_CREDENTIAL_POLL_SECS", self.credential_poll_secs);
        set!("CLUSTER_AGENT_CLIENT_TYPE", self.client_type);
        set!("CLUSTER_AGENT_CLIENT_DETAIL", self.client_detail);
        set!("CLUSTER_AGENT_CLUSTER_ADDRESS", self.cluster_address);
        set!("CLUSTER_AGENT_CLUSTER_TOKEN", self.cluster_token);
        set!("CLUSTER_AGENT_CLUSTER_CA_CERT_FILE", self.cluster_ca_cert_file);
        set!("CLUSTER_AGENT_ALLOW_TCP", self.allow_tcp);
        set!(
            "CLUSTER_AGENT_ALLOWED_UNIX_SOCKETS",
            self.allowed_unix_sockets.as_ref().map(|v| v.join(","))
        );
        set!("CLUSTER_AGENT_DIAL_TIMEOUT", self.dial_timeout_secs);
        set!("CLUSTER_AGENT_LOG_LEVEL", self.log_level);
        set!("CLUSTER_AGENT_LOG_JSON", self.log_json);
        set!("CLUSTER_AGENT_DEBUG", self.debug);
        set!("CLUSTER_AGENT_RECONNECT_BASE_MS", self.reconnect_base_ms);
        set!("CLUSTER_AGENT_RECONNECT_MAX_MS", self.reconnect_max_ms);
        set!("CLUSTER_AGENT_CONNECT_TIMEOUT", self.connect_timeout_secs);
        set!("CLUSTER_AGENT_PING_INTERVAL", self.ping_interval_secs);
        set!("CLUSTER_AGENT_STALE_TIMEOUT", self.stale_timeout_secs);
        set!("CLUSTER_AGENT_MAX_STREAMS", self.max_streams);
    }
}
