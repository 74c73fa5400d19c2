//! Access credential source and rotation signal.
//!
//! The tunnel client holds a `watch::Receiver` and reconnects whenever the
//! credential actually changes. Publishing an identical value is a no-op.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tunnel_core::AccessCredential;

#[derive(Clone)]
pub struct CredentialHandle {
    tx: Arc<watch::Sender<AccessCredential>>,
}

impl CredentialHandle {
    pub fn new(initial: AccessCredential) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<AccessCredential> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> AccessCredential {
        self.tx.borrow().clone()
    }

    /// Publish a new credential. Returns `true` if the value changed, which
    /// makes a connected tunnel reconnect with it.
    pub fn rotate(&self, credential: AccessCredential) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == credential {
                false
            } else {
                *current = credential;
                true
            }
        })
    }
}

/// Poll `path` and rotate the credential when its trimmed, non-empty content
/// changes. Stands in for a secret mounted from the cluster.
pub fn spawn_file_watcher(
    path: PathBuf,
    interval: Duration,
    handle: CredentialHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tokio::fs::read_to_string(&path).await {
                        Ok(content) => {
                            let secret = content.trim();
                            if secret.is_empty() {
                                continue;
                            }
                            if handle.rotate(AccessCredential::new(secret)) {
                                info!(path = %path.display(), "access credential rotated");
                            }
                        }
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "credential file not readable");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("credential watcher shutting down");
                    break;
                }
            }
        }
    })
}
