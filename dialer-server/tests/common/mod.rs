#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use cluster_agent::credential::CredentialHandle;
use cluster_agent::state::AgentState;
use dialer_server::config::Config;
use dialer_server::{start_server, ServerHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tunnel_core::{AccessCredential, ClusterKey};

pub const ACCESS_KEY: &str = "secret";

pub async fn start(extra: &[&str]) -> ServerHandle {
    let mut args = vec![
        "dialer-server",
        "--listen",
        "127.0.0.1:0",
        "--session-wait-secs",
        "1",
    ];
    args.extend_from_slice(extra);
    let config = Config::try_parse_from(args).unwrap();
    start_server(config).await.unwrap()
}

/// Deterministic body of `size` bytes.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| b'a' + (i % 26) as u8).collect()
}

async fn status(Path(code): Path<u16>, Query(query): Query<HashMap<String, String>>) -> Response {
    let size = query
        .get("size")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (
        StatusCode::from_u16(code).unwrap(),
        [("x-stub", "yes")],
        payload(size),
    )
        .into_response()
}

async fn header_names(headers: HeaderMap) -> String {
    let mut names: Vec<String> = headers.keys().map(|k| k.as_str().to_string()).collect();
    names.sort();
    names.join("\n")
}

/// In-cluster HTTP service, reachable only through the agent in tests.
pub async fn start_stub() -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(|| async { "Hello, world!" }))
        .route("/status/{code}", get(status))
        .route("/headers", get(header_names))
        .route("/echo", post(|body: Bytes| async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub struct Agent {
    pub state: Arc<AgentState>,
    pub credentials: CredentialHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Agent {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Run a real agent against `server` and wait until the server has
/// registered its session.
pub async fn start_agent(server: &ServerHandle, cluster_key: &str) -> Agent {
    let url = format!("http://{}", server.local_addr());
    let config = cluster_agent::config::Config::try_parse_from([
        "cluster-agent",
        "--server-url",
        url.as_str(),
        "--cluster-key",
        cluster_key,
        "--access-key",
        ACCESS_KEY,
        "--reconnect-base-ms",
        "50",
        "--reconnect-max-ms",
        "200",
    ])
    .unwrap();
    let credentials = CredentialHandle::new(AccessCredential::new(ACCESS_KEY));
    let state = Arc::new(AgentState::new(config, credentials.subscribe()).unwrap());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(cluster_agent::tunnel::run(Arc::clone(&state), shutdown_rx));

    wait_registered(server, cluster_key).await;
    Agent {
        state,
        credentials,
        shutdown,
        task,
    }
}

pub async fn wait_registered(server: &ServerHandle, session_key: &str) {
    let key = ClusterKey::from(session_key);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.registry().contains(&key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{session_key} never registered"));
}

pub async fn wait_gone(server: &ServerHandle, session_key: &str) {
    let key = ClusterKey::from(session_key);
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.registry().contains(&key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{session_key} never deregistered"));
}
