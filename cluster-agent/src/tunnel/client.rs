//! WebSocket tunnel client: connect, authenticate, and serve dial-throughs.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{self, HeaderValue};
use tracing::{debug, info};
use tunnel_core::{headers, paths, websocket_url, AccessCredential, Role, Session};

use crate::dial_policy::LocalConnector;
use crate::state::AgentState;

/// Upper bound for the writer to flush GOAWAY after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Outcome of a tunnel session.
#[derive(Debug, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// Graceful shutdown requested by the local process.
    Shutdown,
    /// Remote side disconnected or connection lost, should reconnect.
    Disconnected,
    /// The access credential changed; reconnect right away with the new one.
    CredentialRotated,
}

/// Connect to the tunnel server and run until disconnected, rotated or shut
/// down.
pub async fn connect_and_run(
    state: &Arc<AgentState>,
    credentials: &mut watch::Receiver<AccessCredential>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TunnelOutcome, anyhow::Error> {
    // Mark the current value as seen; only later rotations interrupt us.
    let credential = credentials.borrow_and_update().clone();
    let request = build_request(state, &credential)?;
    info!(url = %request.uri(), cluster_key = %state.cluster_key, "connecting tunnel");

    let connect_timeout = Duration::from_secs(state.config.connect_timeout_secs);
    let (ws_stream, _response) = tokio::select! {
        result = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request)) => {
            result.map_err(|_| anyhow::anyhow!("tunnel handshake timed out after {connect_timeout:?}"))??
        }
        _ = shutdown.changed() => return Ok(TunnelOutcome::Shutdown),
        _ = credential_changed(credentials) => return Ok(TunnelOutcome::CredentialRotated),
    };
    info!(cluster_key = %state.cluster_key, "tunnel connected");

    // Reset reconnect counter on success
    state.reconnect_attempts.store(0, Ordering::Relaxed);

    let (frame_tx, mut writer_handle, ws_read) = tunnel_core::split_client(ws_stream);
    let connector = LocalConnector::new(
        Arc::clone(&state.policy),
        Duration::from_secs(state.config.dial_timeout_secs),
    );
    let session = Session::new(
        state.cluster_key.as_str(),
        Role::Client,
        frame_tx,
        Arc::new(connector),
        state.session_config.clone(),
    );
    state.connected.set(true);

    let result = tokio::select! {
        result = session.run(ws_read) => result.map(|()| TunnelOutcome::Disconnected),
        _ = shutdown.changed() => {
            debug!("shutdown during tunnel session");
            Ok(TunnelOutcome::Shutdown)
        }
        _ = credential_changed(credentials) => {
            info!(cluster_key = %state.cluster_key, "access credential rotated, dropping tunnel");
            Ok(TunnelOutcome::CredentialRotated)
        }
    };

    state.connected.set(false);
    session.close();
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN, &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    info!(cluster_key = %state.cluster_key, "tunnel disconnected");
    Ok(result?)
}

/// Resolves on the next credential change. Never resolves once the
/// credential source is gone.
pub(crate) async fn credential_changed(credentials: &mut watch::Receiver<AccessCredential>) {
    if credentials.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn build_request(
    state: &AgentState,
    credential: &AccessCredential,
) -> anyhow::Result<http::Request<()>> {
    let url = websocket_url(&state.config.server_url, paths::AGENT_CONNECT);
    let mut request = url.into_client_request()?;
    let h = request.headers_mut();
    h.insert(
        headers::CLUSTER_KEY,
        HeaderValue::from_str(state.cluster_key.as_str())?,
    );
    h.insert(
        headers::AUTHORIZATION,
        HeaderValue::from_str(credential.expose())?,
    );
    if let Some(info) = &state.cluster_info {
        h.insert(headers::CLUSTER_INFO, HeaderValue::from_str(info)?);
    }
    if let Some(client_type) = &state.config.client_type {
        h.insert(headers::CLIENT_TYPE, HeaderValue::from_str(client_type)?);
    }
    if let Some(detail) = &state.config.client_detail {
        h.insert(headers::CLIENT_DETAIL, HeaderValue::from_str(detail)?);
    }
    Ok(request)
}

/// Calculate next reconnect delay with exponential backoff + jitter, capped
/// at the configured maximum.
pub fn next_reconnect_delay(state: &AgentState) -> Duration {
    let attempt = state.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    let base_ms = state.config.reconnect_base_ms;
    let max_ms = state.config.reconnect_max_ms;

    let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(10)).min(max_ms);

    let jitter = (delay_ms / 4).max(1);
    let jitter_ms = rand::thread_rng().gen_range(0..jitter);

    Duration::from_millis((delay_ms + jitter_ms).min(max_ms.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn state(extra: &[&str]) -> AgentState {
        let mut args = vec![
            "cluster-agent",
            "--server-url",
            "https://dialer.example.com/",
            "--cluster-key",
            "cluster-A",
        ];
        args.extend_from_slice(extra);
        let config = Config::try_parse_from(args).unwrap();
        let (_tx, rx) = watch::channel(AccessCredential::new("secret"));
        AgentState::new(config, rx).unwrap()
    }

    #[test]
    fn request_carries_identity_headers() {
        let state = state(&["--client-type", "pipeline"]);
        let request = build_request(&state, &AccessCredential::new("secret")).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://dialer.example.com/clusteragent/connect"
        );
        let h = request.headers();
        assert_eq!(h["x-erda-cluster-key"], "cluster-A");
        assert_eq!(h["authorization"], "secret");
        assert_eq!(h["x-erda-client-type"], "pipeline");
        assert!(h.get("x-erda-cluster-info").is_none());
    }

    #[test]
    fn reconnect_delay_grows_and_stays_bounded() {
        let state = state(&["--reconnect-base-ms", "100", "--reconnect-max-ms", "1000"]);
        let first = next_reconnect_delay(&state);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(126));

        for _ in 0..20 {
            let delay = next_reconnect_delay(&state);
            assert!(delay <= Duration::from_millis(1000), "{delay:?}");
        }

        state.reconnect_attempts.store(0, Ordering::Relaxed);
        assert!(next_reconnect_delay(&state) < Duration::from_millis(126));
    }
}
