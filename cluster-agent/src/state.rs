//! Shared agent state passed to the tunnel tasks.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::sync::watch;
use tunnel_core::{AccessCredential, ClusterKey, SessionConfig};

use crate::config::Config;
use crate::dial_policy::AllowPolicy;

pub struct AgentState {
    pub config: Arc<Config>,
    pub cluster_key: ClusterKey,
    pub policy: Arc<AllowPolicy>,
    pub session_config: SessionConfig,
    /// Pre-encoded `X-Erda-Cluster-Info` header value.
    pub cluster_info: Option<String>,
    pub credentials: watch::Receiver<AccessCredential>,
    pub connected: ConnectedSignal,
    pub reconnect_attempts: AtomicU32,
}

impl AgentState {
    pub fn new(
        config: Config,
        credentials: watch::Receiver<AccessCredential>,
    ) -> anyhow::Result<Self> {
        let cluster_info = config.cluster_info()?.map(|info| info.encode());
        Ok(Self {
            cluster_key: ClusterKey::new(config.cluster_key.clone()),
            policy: Arc::new(AllowPolicy::from_config(&config)),
            session_config: config.session_config(),
            cluster_info,
            credentials,
            connected: ConnectedSignal::new(),
            reconnect_attempts: AtomicU32::new(0),
            config: Arc::new(config),
        })
    }
}

/// Broadcast of the tunnel's connected state, for readiness waiters.
#[derive(Clone)]
pub struct ConnectedSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectedSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the tunnel is connected.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }
}

impl Default for ConnectedSignal {
    fn default() -> Self {
        Self::new()
    }
}
