mod common;

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cluster_dialer::{ClusterConnector, ClusterDialer, DialerConfig};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{start, start_agent, start_stub, wait_gone};

fn dialer_for(server: &dialer_server::ServerHandle) -> ClusterDialer {
    ClusterDialer::start(DialerConfig::new(format!("http://{}", server.local_addr())))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dial_context_reaches_service_behind_agent() {
    let server = start(&[]).await;
    let stub = start_stub().await;
    let agent = start_agent(&server, "cluster-A").await;
    let dialer = dialer_for(&server);

    let mut conn = dialer
        .dial_context("cluster-A")
        .dial("tcp", &stub.to_string())
        .await
        .expect("dial through tunnel");
    conn.write_all(b"GET /hello HTTP/1.1\r\nHost: stub\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    conn.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("Hello, world!"), "{response}");

    dialer.shutdown();
    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hyper_client_over_cluster_connector() {
    let server = start(&[]).await;
    let stub = start_stub().await;
    let agent = start_agent(&server, "cluster-A").await;
    let dialer = dialer_for(&server);

    let client = Client::builder(TokioExecutor::new())
        .build::<_, Empty<Bytes>>(ClusterConnector::new(dialer.dial_context("cluster-A")));
    let uri = format!("http://{stub}/hello").parse().unwrap();
    let resp = client.get(uri).await.expect("request through tunnel");
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Hello, world!");

    dialer.shutdown();
    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disallowed_dials_fail_like_network_errors() {
    let server = start(&[]).await;
    let agent = start_agent(&server, "cluster-A").await;
    let dialer = dialer_for(&server);

    // rejected by the server's peer rules
    let err = match dialer.dial_context("cluster-A").dial("udp", "10.0.0.5:53").await {
        Ok(_) => panic!("udp must be rejected"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

    // allowed by the server, rejected by the agent's policy
    let err = match dialer
        .dial_context("cluster-A")
        .dial("npipe", "//./pipe/docker_engine")
        .await
    {
        Ok(_) => panic!("agent must refuse"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

    dialer.shutdown();
    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_cluster_fails_within_deadline() {
    let server = start(&[]).await;
    let dialer = dialer_for(&server);

    let started = Instant::now();
    let result = dialer
        .dial_context("nowhere")
        .dial_timeout("tcp", "10.0.0.5:80", Duration::from_secs(2))
        .await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(3));

    dialer.shutdown();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_disconnect_deregisters_session() {
    let server = start(&[]).await;
    let agent = start_agent(&server, "cluster-A").await;
    tokio::time::timeout(Duration::from_secs(5), agent.state.connected.wait())
        .await
        .expect("agent reports connected");

    agent.stop().await;
    wait_gone(&server, "cluster-A").await;
    server.shutdown().await;
}
