//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tunnel_core::AccessCredential;

use crate::config::Config;
use crate::credential::{self, CredentialHandle};
use crate::state::AgentState;
use crate::tunnel;

/// Run the full application lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cluster_key = %config.cluster_key,
        server_url = %config.server_url,
        "cluster-agent starting"
    );

    let credentials = CredentialHandle::new(AccessCredential::new(config.access_key.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = config.access_key_file.clone().map(|path| {
        info!(path = %path.display(), "watching access credential file");
        credential::spawn_file_watcher(
            path,
            Duration::from_secs(config.credential_poll_secs),
            credentials.clone(),
            shutdown_rx.clone(),
        )
    });

    let state = Arc::new(AgentState::new(config, credentials.subscribe())?);
    let tunnel_handle = tokio::spawn(tunnel::run(Arc::clone(&state), shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping tunnel");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(10), tunnel_handle)
        .await
        .is_err()
    {
        error!("tunnel did not stop within 10s");
    }
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }

    info!("cluster-agent stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(config.effective_log_level())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
