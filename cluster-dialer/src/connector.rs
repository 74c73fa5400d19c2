//! hyper-util connector that reaches every URI through a cluster tunnel.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::Uri;
use hyper_util::rt::TokioIo;
use tunnel_core::TunnelConn;

use crate::dialer::ContextDial;

/// Plug into `hyper_util::client::legacy::Client` to send plain HTTP to
/// in-cluster services of one cluster.
#[derive(Clone)]
pub struct ClusterConnector {
    dial: ContextDial,
}

impl ClusterConnector {
    pub fn new(dial: ContextDial) -> Self {
        Self { dial }
    }
}

impl tower_service::Service<Uri> for ClusterConnector {
    type Response = TokioIo<TunnelConn>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dial = self.dial.clone();
        Box::pin(async move {
            let address = target_address(&uri)?;
            let conn = dial.dial("tcp", &address).await?;
            Ok(TokioIo::new(conn))
        })
    }
}

/// `host:port` of `uri`, defaulting the port from the scheme.
fn target_address(uri: &Uri) -> io::Result<String> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {uri}")))?;
    let port = match uri.port_u16() {
        Some(port) => port,
        None if uri.scheme_str() == Some("https") => 443,
        None => 80,
    };
    Ok(format!("{host}:{port}"))
}
