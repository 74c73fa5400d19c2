//! One shared `/clusterdialer` session per process, re-established forever,
//! and the dial handles built on it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunnel_core::{ClusterKey, DialError, RejectConnects, Role, Session, TunnelConn};

use crate::config::DialerConfig;
use crate::error::DialerError;

const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

struct Shared {
    config: DialerConfig,
    session: watch::Sender<Option<Session>>,
    shutdown: watch::Sender<bool>,
}

/// Owner of the shared session. Cheap to clone; the session itself is never
/// exposed, only dial handles bound to it.
#[derive(Clone)]
pub struct ClusterDialer {
    shared: Arc<Shared>,
}

impl ClusterDialer {
    /// Start the reconnect loop. Must be called inside a tokio runtime.
    pub fn start(config: DialerConfig) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let (session, _) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            session,
            shutdown,
        });
        tokio::spawn(reconnect_loop(Arc::clone(&shared), shutdown_rx));
        Self { shared }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .session
            .borrow()
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Wait up to `deadline` for a live session and return a dial handle for
    /// `cluster_key` bound to it. `None` when no session came up in time.
    pub async fn get_dialer(&self, cluster_key: &ClusterKey, deadline: Duration) -> Option<ClusterDial> {
        let session = self.live_session(deadline).await?;
        Some(ClusterDial {
            session,
            cluster_key: cluster_key.clone(),
            dial_timeout: self.shared.config.dial_timeout,
        })
    }

    async fn live_session(&self, deadline: Duration) -> Option<Session> {
        let mut rx = self.shared.session.subscribe();
        let ready = tokio::time::timeout(
            deadline,
            rx.wait_for(|s| s.as_ref().is_some_and(|s| !s.is_closed())),
        )
        .await;
        match ready {
            Ok(Ok(session)) => session.as_ref().cloned(),
            _ => None,
        }
    }

    /// Dialer for `cluster_key` that resolves the session on every dial.
    pub fn dial_context(&self, cluster_key: impl Into<ClusterKey>) -> ContextDial {
        ContextDial {
            dialer: Some(self.clone()),
            cluster_key: cluster_key.into(),
        }
    }

    pub fn dial_context_proto(
        &self,
        cluster_key: impl Into<ClusterKey>,
        proto: impl Into<String>,
    ) -> ProtoDial {
        ProtoDial::new(self.dial_context(cluster_key), proto.into())
    }

    /// Stop reconnecting and close the current session.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        if let Some(session) = self.shared.session.send_replace(None) {
            session.close();
        }
    }
}

async fn reconnect_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let url = shared.config.url();
    info!(%url, "starting cluster dialer");
    loop {
        match connect_once(&shared, &url, &mut shutdown).await {
            Ok(true) => return,
            Ok(false) => info!(%url, "dialer session closed"),
            Err(e) => warn!(%url, error = %e, "dialer connect failed"),
        }
        if *shutdown.borrow() {
            return;
        }

        let delay = shared.config.reconnect_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting dialer session");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Run one session to completion. `Ok(true)` when stopped by shutdown.
async fn connect_once(
    shared: &Shared,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, ConnectError> {
    let timeout = shared.config.connect_timeout;
    let (ws, _response) = tokio::select! {
        result = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)) => {
            result.map_err(|_| ConnectError::Timeout(timeout))??
        }
        _ = shutdown.changed() => return Ok(true),
    };

    let (frame_tx, mut writer, read) = tunnel_core::split_client(ws);
    let session = Session::new(
        "cluster-dialer",
        Role::Client,
        frame_tx,
        Arc::new(RejectConnects),
        shared.config.session_config(),
    );
    shared.session.send_replace(Some(session.clone()));
    info!(session_id = session.id(), %url, "dialer session established");

    let stopped = tokio::select! {
        result = session.run(read) => {
            if let Err(e) = result {
                warn!(session_id = session.id(), error = %e, "dialer session failed");
            }
            false
        }
        _ = shutdown.changed() => true,
    };

    shared.session.send_replace(None);
    session.close();
    drop(session);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    Ok(stopped)
}

/// Dial handle bound to one live session and one cluster key.
#[derive(Clone)]
pub struct ClusterDial {
    session: Session,
    cluster_key: ClusterKey,
    dial_timeout: Duration,
}

impl ClusterDial {
    pub fn cluster_key(&self) -> &ClusterKey {
        &self.cluster_key
    }

    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TunnelConn> {
        self.dial_timeout(network, address, self.dial_timeout).await
    }

    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> io::Result<TunnelConn> {
        let dial = self.session.dial_via(&self.cluster_key, network, address);
        match tokio::time::timeout(timeout, dial).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DialError::Timeout(timeout).into()),
        }
    }
}

/// Dialer parameterized only by cluster key. Each dial waits, bounded, for
/// the shared session and then dials through it.
#[derive(Clone)]
pub struct ContextDial {
    dialer: Option<ClusterDialer>,
    cluster_key: ClusterKey,
}

impl ContextDial {
    pub(crate) fn global(cluster_key: ClusterKey) -> Self {
        Self {
            dialer: None,
            cluster_key,
        }
    }

    pub fn cluster_key(&self) -> &ClusterKey {
        &self.cluster_key
    }

    fn resolve(&self) -> io::Result<ClusterDialer> {
        self.dialer
            .clone()
            .or_else(crate::global)
            .ok_or_else(|| DialerError::NotInitialized.into())
    }

    /// Dial with the configured session wait and dial timeout.
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TunnelConn> {
        let dialer = self.resolve()?;
        let config = dialer.config();
        let deadline = config.session_wait + config.dial_timeout;
        self.dial_with(&dialer, network, address, deadline).await
    }

    /// Dial with `deadline` covering both the session wait and the dial.
    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        deadline: Duration,
    ) -> io::Result<TunnelConn> {
        let dialer = self.resolve()?;
        self.dial_with(&dialer, network, address, deadline).await
    }

    async fn dial_with(
        &self,
        dialer: &ClusterDialer,
        network: &str,
        address: &str,
        deadline: Duration,
    ) -> io::Result<TunnelConn> {
        let started = Instant::now();
        let wait = deadline.min(dialer.config().session_wait);
        let dial = dialer
            .get_dialer(&self.cluster_key, wait)
            .await
            .ok_or_else(|| DialerError::Unavailable {
                cluster_key: self.cluster_key.clone(),
                waited: wait,
            })?;
        let remaining = deadline.saturating_sub(started.elapsed());
        dial.dial_timeout(network, address, remaining).await
    }
}

/// [`ContextDial`] with the network fixed.
#[derive(Clone)]
pub struct ProtoDial {
    inner: ContextDial,
    proto: String,
}

impl ProtoDial {
    pub(crate) fn new(inner: ContextDial, proto: String) -> Self {
        Self { inner, proto }
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    pub async fn dial(&self, address: &str) -> io::Result<TunnelConn> {
        self.inner.dial(&self.proto, address).await
    }

    pub async fn dial_timeout(&self, address: &str, deadline: Duration) -> io::Result<TunnelConn> {
        self.inner.dial_timeout(&self.proto, address, deadline).await
    }
}
