use std::io;
use std::time::Duration;

use tunnel_core::ClusterKey;

#[derive(Debug, thiserror::Error)]
pub enum DialerError {
    #[error("CLUSTER_DIALER_ADDR is not set")]
    MissingEndpoint,
    #[error("cluster dialer is not initialized")]
    NotInitialized,
    #[error("no dialer session for cluster {cluster_key} within {waited:?}")]
    Unavailable {
        cluster_key: ClusterKey,
        waited: Duration,
    },
}

impl From<DialerError> for io::Error {
    fn from(err: DialerError) -> Self {
        let kind = match err {
            DialerError::MissingEndpoint => io::ErrorKind::InvalidInput,
            DialerError::NotInitialized => io::ErrorKind::NotConnected,
            DialerError::Unavailable { .. } => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, err)
    }
}
