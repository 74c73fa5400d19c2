//! Which dial-throughs this agent honors, and how it reaches them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use tokio::net::TcpStream;
use tracing::debug;
use tunnel_core::{BoxIo, ConnectHandler, ConnectMeta, DialError};

use crate::config::Config;

/// Allow-predicate over `(network, address)` pairs.
#[derive(Debug, Clone)]
pub struct AllowPolicy {
    allow_tcp: bool,
    unix_sockets: HashSet<String>,
}

impl AllowPolicy {
    pub fn new(allow_tcp: bool, unix_sockets: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow_tcp,
            unix_sockets: unix_sockets.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.allow_tcp, config.allowed_unix_sockets.iter().cloned())
    }

    pub fn allows(&self, network: &str, address: &str) -> bool {
        match network {
            "tcp" => self.allow_tcp && !address.is_empty(),
            "unix" => self.unix_sockets.contains(address),
            _ => false,
        }
    }
}

/// Serves the dialer's `Connect` requests by dialing inside the cluster.
pub struct LocalConnector {
    policy: Arc<AllowPolicy>,
    dial_timeout: Duration,
}

impl LocalConnector {
    pub fn new(policy: Arc<AllowPolicy>, dial_timeout: Duration) -> Self {
        Self {
            policy,
            dial_timeout,
        }
    }
}

impl ConnectHandler for LocalConnector {
    fn connect(&self, meta: ConnectMeta) -> BoxFuture<'static, Result<BoxIo, DialError>> {
        if meta.via.is_some() || !self.policy.allows(&meta.network, &meta.address) {
            debug!(network = %meta.network, address = %meta.address, "dial-through rejected by policy");
            return Box::pin(future::ready(Err(DialError::not_allowed(
                &meta.network,
                &meta.address,
            ))));
        }
        let timeout = self.dial_timeout;
        Box::pin(async move { dial_local(&meta.network, &meta.address, timeout).await })
    }
}

async fn dial_local(network: &str, address: &str, timeout: Duration) -> Result<BoxIo, DialError> {
    match network {
        "tcp" => {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
                .await
                .map_err(|_| DialError::Timeout(timeout))??;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(address))
                .await
                .map_err(|_| DialError::Timeout(timeout))??;
            Ok(Box::new(stream))
        }
        _ => Err(DialError::not_allowed(network, address)),
    }
}
