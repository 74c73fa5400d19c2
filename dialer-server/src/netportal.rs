//! HTTP reverse proxy whose destination is chosen per request by the
//! `X-Portal-*` headers and reached through the cluster's tunnel session.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, BodyDataStream};
use axum::http::{header, HeaderMap, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};
use tunnel_core::{headers, ClusterKey, DialError, TunnelConn};

use crate::registry::SessionRegistry;

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("missing header:X-Portal-Host")]
    MissingHost,
    #[error("missing header:X-Portal-Dest")]
    MissingDest,
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("invalid destination url: {0}")]
    InvalidUrl(String),
}

/// Routing fields resolved from one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRoute {
    pub cluster_key: ClusterKey,
    pub dest: String,
    pub scheme: Scheme,
    pub timeout: Duration,
}

impl PortalRoute {
    /// Destination URL for `uri`: scheme, dest host:port, original path and
    /// raw query.
    pub fn destination(&self, uri: &Uri) -> Result<Uri, PortalError> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = format!("{}://{}{}", self.scheme, self.dest, path_and_query);
        url.parse::<Uri>()
            .map_err(|e| PortalError::InvalidUrl(format!("{url}: {e}")))
    }
}

/// Read the routing headers and strip them, together with `Host`, from
/// `headers`. The headers are removed even when resolution fails.
pub fn resolve_route(
    headers: &mut HeaderMap,
    default_timeout: Duration,
) -> Result<PortalRoute, PortalError> {
    let host = take_header(headers, headers::PORTAL_HOST);
    let dest = take_header(headers, headers::PORTAL_DEST);
    let scheme = take_header(headers, headers::PORTAL_SCHEME);
    let timeout = take_header(headers, headers::PORTAL_TIMEOUT);
    headers.remove(header::HOST);

    let cluster_key = ClusterKey::from(host.ok_or(PortalError::MissingHost)?);
    let dest = dest.ok_or(PortalError::MissingDest)?;
    let scheme = match scheme.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("http") => Scheme::Http,
        Some("https") => Scheme::Https,
        Some(other) => return Err(PortalError::UnsupportedScheme(other.to_string())),
    };
    let timeout = timeout
        .and_then(|t| t.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    Ok(PortalRoute {
        cluster_key,
        dest,
        scheme,
        timeout,
    })
}

fn take_header(headers: &mut HeaderMap, name: &'static str) -> Option<String> {
    let value = headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    headers.remove(name);
    value
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

type PortalClient = Client<PortalConnector, Body>;

pub struct NetPortal {
    registry: Arc<SessionRegistry>,
    clients: DashMap<(ClusterKey, Duration), PortalClient>,
    seq: AtomicU64,
    default_timeout: Duration,
    session_wait: Duration,
    tls: TlsConnector,
}

impl NetPortal {
    pub fn new(
        registry: Arc<SessionRegistry>,
        default_timeout: Duration,
        session_wait: Duration,
    ) -> Result<Self, rustls::Error> {
        Ok(Self {
            registry,
            clients: DashMap::new(),
            seq: AtomicU64::new(0),
            default_timeout,
            session_wait,
            tls: insecure_tls()?,
        })
    }

    /// Proxy one request. Never fails: every problem becomes a status code.
    pub async fn forward(&self, req: Request<Body>) -> Response<Body> {
        let (mut parts, body) = req.into_parts();
        let route = match resolve_route(&mut parts.headers, self.default_timeout) {
            Ok(route) => route,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
        let destination = match route.destination(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
        strip_hop_by_hop(&mut parts.headers);

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            seq,
            cluster_key = %route.cluster_key,
            method = %parts.method,
            url = %destination,
            timeout_secs = route.timeout.as_secs(),
            "REQ"
        );

        parts.uri = destination.clone();
        let request = Request::from_parts(parts, body);
        let client = self.client(&route);
        let started = Instant::now();

        let result = tokio::time::timeout(route.timeout, client.request(request)).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(resp)) => {
                info!(
                    seq,
                    cluster_key = %route.cluster_key,
                    code = resp.status().as_u16(),
                    latency_ms,
                    url = %destination,
                    "REQ OK"
                );
                let (mut parts, body) = resp.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                let relay = RelayBody {
                    inner: Body::new(body).into_data_stream(),
                    deadline: Box::pin(tokio::time::sleep_until(
                        tokio::time::Instant::from_std(started + route.timeout),
                    )),
                    seq,
                    cluster_key: route.cluster_key.clone(),
                    started,
                    bytes: 0,
                    finished: false,
                };
                Response::from_parts(parts, Body::from_stream(relay))
            }
            Ok(Err(e)) => {
                let message = error_chain(&e);
                error!(
                    seq,
                    cluster_key = %route.cluster_key,
                    latency_ms,
                    url = %destination,
                    error = %message,
                    "REQ ERR"
                );
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
            Err(_) => {
                let message = format!("request timed out after {:?}", route.timeout);
                error!(
                    seq,
                    cluster_key = %route.cluster_key,
                    latency_ms,
                    url = %destination,
                    error = %message,
                    "REQ ERR"
                );
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }

    /// Drop the cached clients of a cluster whose session went away.
    pub fn forget(&self, cluster_key: &ClusterKey) {
        self.clients.retain(|(key, _), _| key != cluster_key);
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    fn client(&self, route: &PortalRoute) -> PortalClient {
        self.clients
            .entry((route.cluster_key.clone(), route.timeout))
            .or_insert_with(|| {
                let connector = PortalConnector {
                    registry: Arc::clone(&self.registry),
                    cluster_key: route.cluster_key.clone(),
                    session_wait: self.session_wait.min(route.timeout),
                    tls: self.tls.clone(),
                };
                Client::builder(TokioExecutor::new())
                    .pool_idle_timeout(Duration::from_secs(90))
                    .build(connector)
            })
            .clone()
    }
}

/// Response body relayed to the caller, cut off at the request deadline.
/// Logs `REQ DONE` once it ends.
struct RelayBody {
    inner: BodyDataStream,
    deadline: Pin<Box<Sleep>>,
    seq: u64,
    cluster_key: ClusterKey,
    started: Instant,
    bytes: u64,
    finished: bool,
}

impl RelayBody {
    fn finish(&mut self, error: Option<&str>) {
        self.finished = true;
        let latency_ms = self.started.elapsed().as_millis() as u64;
        match error {
            None => info!(
                seq = self.seq,
                cluster_key = %self.cluster_key,
                bytes = self.bytes,
                latency_ms,
                "REQ DONE"
            ),
            Some(error) => warn!(
                seq = self.seq,
                cluster_key = %self.cluster_key,
                bytes = self.bytes,
                latency_ms,
                error,
                "REQ DONE"
            ),
        }
    }
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let message = e.to_string();
                self.finish(Some(&message));
                Poll::Ready(Some(Err(io::Error::other(message))))
            }
            Poll::Ready(None) => {
                self.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => {
                if self.deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                self.finish(Some("response body timed out"));
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "response body timed out",
                ))))
            }
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Some("caller went away"));
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Connects hyper to a destination by dialing through the cluster session.
#[derive(Clone)]
pub struct PortalConnector {
    registry: Arc<SessionRegistry>,
    cluster_key: ClusterKey,
    session_wait: Duration,
    tls: TlsConnector,
}

impl tower_service::Service<Uri> for PortalConnector {
    type Response = TokioIo<PortalStream>;
    type Error = DialError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let scheme = match uri.scheme_str() {
                Some("https") => Scheme::Https,
                _ => Scheme::Http,
            };
            let host = uri
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?;
            let port = uri.port_u16().unwrap_or(scheme.default_port());
            let address = format!("{host}:{port}");

            let session = this
                .registry
                .wait_for(&this.cluster_key, this.session_wait)
                .await
                .ok_or_else(|| DialError::NoSession(this.cluster_key.clone()))?;
            let conn = session.dial("tcp", &address).await?;

            match scheme {
                Scheme::Http => Ok(TokioIo::new(PortalStream::Plain(conn))),
                Scheme::Https => {
                    let name = host.trim_start_matches('[').trim_end_matches(']');
                    let server_name = ServerName::try_from(name.to_string())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                    let tls = this.tls.connect(server_name, conn).await?;
                    Ok(TokioIo::new(PortalStream::Tls(Box::new(tls))))
                }
            }
        })
    }
}

/// A dialed destination, plain or wrapped in TLS.
pub enum PortalStream {
    Plain(TunnelConn),
    Tls(Box<TlsStream<TunnelConn>>),
}

impl AsyncRead for PortalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PortalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for PortalStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

fn insecure_tls() -> Result<TlsConnector, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Destinations are in-cluster addresses, usually with self-signed certs.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const DEFAULT: Duration = Duration::from_secs(60);

    fn portal_headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::HOST, HeaderValue::from_static("dialer:80"));
        map.insert("x-trace", HeaderValue::from_static("keep-me"));
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn route_defaults_scheme_and_timeout() {
        let mut map = portal_headers(&[
            (headers::PORTAL_HOST, "cluster-A"),
            (headers::PORTAL_DEST, "10.0.0.5:8080"),
        ]);
        let route = resolve_route(&mut map, DEFAULT).unwrap();
        assert_eq!(route.cluster_key.as_str(), "cluster-A");
        assert_eq!(route.dest, "10.0.0.5:8080");
        assert_eq!(route.scheme, Scheme::Http);
        assert_eq!(route.timeout, DEFAULT);
    }

    #[test]
    fn timeout_and_scheme_overrides() {
        let mut map = portal_headers(&[
            (headers::PORTAL_HOST, "cluster-A"),
            (headers::PORTAL_DEST, "kube-apiserver:6443"),
            (headers::PORTAL_SCHEME, "HTTPS"),
            (headers::PORTAL_TIMEOUT, "7"),
        ]);
        let route = resolve_route(&mut map, DEFAULT).unwrap();
        assert_eq!(route.scheme, Scheme::Https);
        assert_eq!(route.timeout, Duration::from_secs(7));

        let mut map = portal_headers(&[
            (headers::PORTAL_HOST, "cluster-A"),
            (headers::PORTAL_DEST, "svc:80"),
            (headers::PORTAL_TIMEOUT, "soon"),
        ]);
        assert_eq!(resolve_route(&mut map, DEFAULT).unwrap().timeout, DEFAULT);
    }

    #[test]
    fn routing_headers_are_always_stripped() {
        let names = [
            headers::PORTAL_HOST,
            headers::PORTAL_DEST,
            headers::PORTAL_SCHEME,
            headers::PORTAL_TIMEOUT,
        ];
        // every subset of the four routing headers
        for mask in 0u8..16 {
            let pairs: Vec<(&'static str, &str)> = names
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, name)| (*name, "v"))
                .collect();
            let mut map = portal_headers(&pairs);
            let _ = resolve_route(&mut map, DEFAULT);
            for name in names {
                assert!(!map.contains_key(name), "{name} survived mask {mask:#06b}");
            }
            assert!(!map.contains_key(header::HOST));
            assert_eq!(map.get("x-trace").unwrap(), "keep-me");
        }
    }

    #[test]
    fn missing_headers_are_reported() {
        let mut map = portal_headers(&[(headers::PORTAL_DEST, "svc:80")]);
        let err = resolve_route(&mut map, DEFAULT).unwrap_err();
        assert_eq!(err.to_string(), "missing header:X-Portal-Host");

        let mut map = portal_headers(&[(headers::PORTAL_HOST, "cluster-A")]);
        let err = resolve_route(&mut map, DEFAULT).unwrap_err();
        assert_eq!(err.to_string(), "missing header:X-Portal-Dest");

        let mut map = portal_headers(&[
            (headers::PORTAL_HOST, "cluster-A"),
            (headers::PORTAL_DEST, "svc:80"),
            (headers::PORTAL_SCHEME, "ftp"),
        ]);
        assert!(matches!(
            resolve_route(&mut map, DEFAULT),
            Err(PortalError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn destination_keeps_path_and_raw_query() {
        let route = PortalRoute {
            cluster_key: ClusterKey::from("cluster-A"),
            dest: "10.0.0.5:8080".into(),
            scheme: Scheme::Http,
            timeout: DEFAULT,
        };
        let uri: Uri = "/api/v1/pods?labelSelector=app%3Dweb&limit=10".parse().unwrap();
        assert_eq!(
            route.destination(&uri).unwrap().to_string(),
            "http://10.0.0.5:8080/api/v1/pods?labelSelector=app%3Dweb&limit=10"
        );
    }

    #[tokio::test]
    async fn unknown_cluster_fails_within_the_session_wait() {
        let portal = NetPortal::new(
            Arc::new(SessionRegistry::new()),
            DEFAULT,
            Duration::from_millis(200),
        )
        .unwrap();
        let req = Request::builder()
            .uri("/hello")
            .header(headers::PORTAL_HOST, "nowhere")
            .header(headers::PORTAL_DEST, "10.0.0.5:80")
            .body(Body::empty())
            .unwrap();

        let started = Instant::now();
        let resp = portal.forward(req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(portal.cached_clients(), 1);

        portal.forget(&ClusterKey::from("nowhere"));
        assert_eq!(portal.cached_clients(), 0);
    }

    #[tokio::test]
    async fn clients_are_cached_per_key_and_timeout() {
        let portal = NetPortal::new(
            Arc::new(SessionRegistry::new()),
            DEFAULT,
            Duration::from_millis(10),
        )
        .unwrap();
        let route = |key: &str, secs: u64| PortalRoute {
            cluster_key: ClusterKey::from(key),
            dest: "svc:80".into(),
            scheme: Scheme::Http,
            timeout: Duration::from_secs(secs),
        };
        portal.client(&route("a", 60));
        portal.client(&route("a", 60));
        portal.client(&route("a", 5));
        portal.client(&route("b", 60));
        assert_eq!(portal.cached_clients(), 3);
    }
}
