//! Serves `Connect` requests arriving on `/clusterdialer` sessions by
//! forwarding them into the registered cluster session.

use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use tracing::debug;
use tunnel_core::{BoxIo, ConnectHandler, ConnectMeta, DialError};

use crate::registry::SessionRegistry;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DOCKER_PIPE: &str = "//./pipe/docker_engine";

/// What a peer may reach inside a cluster.
pub fn peer_allows(network: &str, address: &str) -> bool {
    match network {
        "tcp" => !address.is_empty(),
        "unix" => address == DOCKER_SOCKET,
        "npipe" => address == DOCKER_PIPE,
        _ => false,
    }
}

pub struct RegistryConnector {
    registry: Arc<SessionRegistry>,
}

impl RegistryConnector {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

impl ConnectHandler for RegistryConnector {
    fn connect(&self, meta: ConnectMeta) -> BoxFuture<'static, Result<BoxIo, DialError>> {
        let Some(cluster_key) = meta.via.clone() else {
            debug!(network = %meta.network, address = %meta.address, "peer dial without cluster key");
            return Box::pin(future::ready(Err(DialError::not_allowed(
                &meta.network,
                &meta.address,
            ))));
        };
        if !peer_allows(&meta.network, &meta.address) {
            debug!(cluster_key = %cluster_key, network = %meta.network, address = %meta.address, "peer dial rejected");
            return Box::pin(future::ready(Err(DialError::not_allowed(
                &meta.network,
                &meta.address,
            ))));
        }
        let Some(session) = self.registry.get(&cluster_key) else {
            return Box::pin(future::ready(Err(DialError::NoSession(cluster_key))));
        };

        Box::pin(async move {
            let conn = session.dial(&meta.network, &meta.address).await?;
            debug!(
                cluster_key = %cluster_key,
                stream_id = conn.stream_id(),
                address = %meta.address,
                "peer dial forwarded"
            );
            Ok(Box::new(conn) as BoxIo)
        })
    }
}
