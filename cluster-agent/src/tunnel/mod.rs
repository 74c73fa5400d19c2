pub mod client;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tunnel_core::AccessCredential;

use crate::state::AgentState;

use client::TunnelOutcome;

/// Run the tunnel main loop (wait for credential, connect, serve, reconnect).
/// Every failure is retried; only `shutdown` ends the loop.
pub async fn run(state: Arc<AgentState>, mut shutdown: watch::Receiver<bool>) {
    let mut credentials = state.credentials.clone();
    info!(
        cluster_key = %state.cluster_key,
        server = %state.config.server_url,
        "starting tunnel"
    );

    loop {
        if credentials.borrow().is_empty() {
            info!(cluster_key = %state.cluster_key, "no access credential yet, waiting");
            tokio::select! {
                ready = wait_for_credential(&mut credentials) => {
                    if !ready {
                        warn!("credential source closed without a credential");
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }

        match client::connect_and_run(&state, &mut credentials, &mut shutdown).await {
            Ok(TunnelOutcome::Shutdown) => {
                info!(cluster_key = %state.cluster_key, "tunnel shut down gracefully");
                return;
            }
            Ok(TunnelOutcome::CredentialRotated) => {
                state.reconnect_attempts.store(0, Ordering::Relaxed);
                continue;
            }
            Ok(TunnelOutcome::Disconnected) => {
                info!(cluster_key = %state.cluster_key, "tunnel disconnected, will reconnect");
            }
            Err(e) => {
                error!(cluster_key = %state.cluster_key, error = %e, "tunnel connection lost");
            }
        }

        if *shutdown.borrow() {
            info!("shutdown requested, not reconnecting");
            return;
        }

        let delay = client::next_reconnect_delay(&state);
        info!(
            cluster_key = %state.cluster_key,
            delay_ms = delay.as_millis() as u64,
            "reconnecting tunnel"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = client::credential_changed(&mut credentials) => {
                info!("access credential rotated during reconnect wait");
            }
            _ = shutdown.changed() => {
                info!("shutdown requested during reconnect wait");
                return;
            }
        }
    }
}

async fn wait_for_credential(credentials: &mut watch::Receiver<AccessCredential>) -> bool {
    credentials.wait_for(|c| !c.is_empty()).await.is_ok()
}
