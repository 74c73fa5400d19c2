//! Dial into any connected cluster by key.
//!
//! A process keeps one WebSocket session to the dialer server's
//! `/clusterdialer` endpoint. Dials name a cluster key and are forwarded by
//! the server into that cluster's agent tunnel, so callers get an ordinary
//! byte stream without seeing any tunnel machinery.
//!
//! ```no_run
//! # async fn demo() -> std::io::Result<()> {
//! use tokio::io::AsyncWriteExt;
//!
//! cluster_dialer::init(cluster_dialer::DialerConfig::new("http://cluster-dialer:80"));
//! let mut conn = cluster_dialer::dial_context("cluster-A")
//!     .dial("tcp", "10.0.0.5:3306")
//!     .await?;
//! conn.write_all(b"ping").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod dialer;
pub mod error;

use std::sync::OnceLock;

use tracing::debug;
use tunnel_core::ClusterKey;

pub use config::{DialerConfig, ENDPOINT_ENV};
pub use connector::ClusterConnector;
pub use dialer::{ClusterDial, ClusterDialer, ContextDial, ProtoDial};
pub use error::DialerError;

static GLOBAL: OnceLock<ClusterDialer> = OnceLock::new();

/// Install the process-wide dialer and start its reconnect loop. Later calls
/// return the existing instance and ignore `config`.
pub fn init(config: DialerConfig) -> ClusterDialer {
    if let Some(existing) = GLOBAL.get() {
        debug!("cluster dialer already initialized");
        return existing.clone();
    }
    GLOBAL.get_or_init(|| ClusterDialer::start(config)).clone()
}

/// Like [`init`], with the endpoint taken from `CLUSTER_DIALER_ADDR`.
pub fn init_from_env() -> Result<ClusterDialer, DialerError> {
    Ok(init(DialerConfig::from_env()?))
}

pub fn global() -> Option<ClusterDialer> {
    GLOBAL.get().cloned()
}

/// Dialer for `cluster_key` on the process-wide instance. Dials fail with
/// `NotConnected` until [`init`] has run.
pub fn dial_context(cluster_key: impl Into<ClusterKey>) -> ContextDial {
    ContextDial::global(cluster_key.into())
}

/// [`dial_context`] with the network fixed to `proto`.
pub fn dial_context_proto(cluster_key: impl Into<ClusterKey>, proto: impl Into<String>) -> ProtoDial {
    ProtoDial::new(dial_context(cluster_key), proto.into())
}
