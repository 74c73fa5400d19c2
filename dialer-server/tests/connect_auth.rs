mod common;

use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use common::{start, wait_gone, wait_registered};

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(
    server: &dialer_server::ServerHandle,
    headers: &[(&'static str, &str)],
) -> Result<Socket, tungstenite::Error> {
    let mut request = format!("ws://{}/clusteragent/connect", server.local_addr())
        .into_client_request()
        .unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, HeaderValue::from_str(value).unwrap());
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(ws, _)| ws)
}

/// Status and body of a refused upgrade.
fn refusal(result: Result<Socket, tungstenite::Error>) -> (u16, String) {
    match result {
        Err(tungstenite::Error::Http(resp)) => {
            let body = resp
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            (resp.status().as_u16(), body)
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("upgrade unexpectedly accepted"),
    }
}

fn cluster_info(json: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(json)
}

/// Read until the server ends the socket.
async fn wait_closed(ws: &mut Socket) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
    .await
    .expect("socket closed by server");
}

#[tokio::test]
async fn empty_authorization_is_unauthorized() {
    let server = start(&[]).await;
    let (status, _) = refusal(
        connect(
            &server,
            &[("x-erda-cluster-key", "cluster-A"), ("authorization", "")],
        )
        .await,
    );
    assert_eq!(status, 401);
    assert!(server.registry().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn missing_cluster_key_is_bad_request() {
    let server = start(&[]).await;
    let (status, body) = refusal(connect(&server, &[("authorization", "secret")]).await);
    assert_eq!(status, 400);
    assert_eq!(body, "missing header:X-Erda-Cluster-Key");
    server.shutdown().await;
}

#[tokio::test]
async fn static_access_key_mismatch_is_unauthorized() {
    let server = start(&["--access-key", "cluster-A=right"]).await;
    let (status, _) = refusal(
        connect(
            &server,
            &[("x-erda-cluster-key", "cluster-A"), ("authorization", "wrong")],
        )
        .await,
    );
    assert_eq!(status, 401);

    let _ws = connect(
        &server,
        &[("x-erda-cluster-key", "cluster-A"), ("authorization", "right")],
    )
    .await
    .expect("matching key accepted");
    wait_registered(&server, "cluster-A").await;
    server.shutdown().await;
}

#[tokio::test]
async fn cluster_info_is_validated() {
    let server = start(&["--need-cluster-info"]).await;
    let base = [("x-erda-cluster-key", "cluster-A"), ("authorization", "secret")];

    let (status, body) = refusal(connect(&server, &base).await);
    assert_eq!(status, 400);
    assert_eq!(body, "missing header:X-Erda-Cluster-Info");

    let partial = cluster_info(r#"{"address":"https://10.0.0.1:6443","caCert":"PEM"}"#);
    let mut headers = base.to_vec();
    headers.push(("x-erda-cluster-info", partial.as_str()));
    let (status, body) = refusal(connect(&server, &headers).await);
    assert_eq!(status, 400);
    assert_eq!(body, "invalid cluster info, token empty");

    let complete =
        cluster_info(r#"{"address":"https://10.0.0.1:6443","token":"t","caCert":"PEM"}"#);
    let mut headers = base.to_vec();
    headers.push(("x-erda-cluster-info", complete.as_str()));
    let _ws = connect(&server, &headers).await.expect("complete info accepted");
    wait_registered(&server, "cluster-A").await;

    server.shutdown().await;
}

#[tokio::test]
async fn reconnect_replaces_previous_session() {
    let server = start(&[]).await;
    let headers = [("x-erda-cluster-key", "cluster-A"), ("authorization", "secret")];

    let mut first = connect(&server, &headers).await.unwrap();
    wait_registered(&server, "cluster-A").await;
    let first_id = server
        .registry()
        .get(&"cluster-A".into())
        .unwrap()
        .id();

    let _second = connect(&server, &headers).await.unwrap();
    wait_closed(&mut first).await;

    let current = server.registry().get(&"cluster-A".into()).unwrap();
    assert_ne!(current.id(), first_id);
    assert_eq!(server.registry().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn check_endpoint_tracks_registration() {
    let server = start(&[]).await;
    let check = format!(
        "http://{}/clusteragent/check?clusterKey=cluster-A",
        server.local_addr()
    );
    let client = reqwest::Client::new();
    assert_eq!(client.get(&check).send().await.unwrap().text().await.unwrap(), "false");

    let ws = connect(
        &server,
        &[("x-erda-cluster-key", "cluster-A"), ("authorization", "secret")],
    )
    .await
    .unwrap();
    wait_registered(&server, "cluster-A").await;
    assert_eq!(client.get(&check).send().await.unwrap().text().await.unwrap(), "true");

    drop(ws);
    wait_gone(&server, "cluster-A").await;
    assert_eq!(client.get(&check).send().await.unwrap().text().await.unwrap(), "false");

    server.shutdown().await;
}

#[tokio::test]
async fn client_detail_is_served_while_connected() {
    let server = start(&[]).await;
    let base = format!("http://{}/clusteragent/client-detail", server.local_addr());
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/edge/cluster-B")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "cluster not found");

    let ws = connect(
        &server,
        &[
            ("x-erda-cluster-key", "cluster-B"),
            ("authorization", "secret"),
            ("x-erda-client-type", "edge"),
            ("x-erda-client-detail", r#"{"zone":"eu-1"}"#),
        ],
    )
    .await
    .unwrap();
    wait_registered(&server, "cluster-B@edge").await;

    let detail: serde_json::Value = client
        .get(format!("{base}/edge/cluster-B"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["zone"], "eu-1");
    assert_eq!(detail["clusterKey"], "cluster-B");

    let all: Vec<serde_json::Value> = client
        .get(format!("{base}/edge"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let check = client
        .get(format!(
            "http://{}/clusteragent/check?clusterKey=cluster-B&clientType=edge",
            server.local_addr()
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(check, "true");

    drop(ws);
    wait_gone(&server, "cluster-B@edge").await;
    let all: Vec<serde_json::Value> = client
        .get(format!("{base}/edge"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(all.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_agent_sockets() {
    let server = start(&[]).await;
    let mut ws = connect(
        &server,
        &[("x-erda-cluster-key", "cluster-A"), ("authorization", "secret")],
    )
    .await
    .unwrap();
    wait_registered(&server, "cluster-A").await;

    let registry = std::sync::Arc::clone(server.registry());
    server.shutdown().await;
    assert!(registry.is_empty());
    wait_closed(&mut ws).await;
}
