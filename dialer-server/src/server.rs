use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tunnel_core::{
    headers, paths, spawn_writer, ClusterKey, ConnectHandler, RejectConnects, Role, Session,
    WireMessage,
};

use crate::auth::{Authorizer, Decision, Identity};
use crate::client::{self, ClientDetail, ClientDetails, ClientType};
use crate::cluster_info;
use crate::config::Config;
use crate::netportal::NetPortal;
use crate::peer::RegistryConnector;
use crate::registry::SessionRegistry;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ServerState {
    pub config: Config,
    pub authorizer: Authorizer,
    pub registry: Arc<SessionRegistry>,
    pub clients: ClientDetails,
    pub portal: NetPortal,
    peer_connector: Arc<RegistryConnector>,
}

impl ServerState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let authorizer = match config.access_key_map()? {
            Some(keys) => Authorizer::with_access_keys(keys),
            None => Authorizer::new(),
        };
        let registry = Arc::new(SessionRegistry::new());
        let portal = NetPortal::new(
            Arc::clone(&registry),
            config.default_timeout(),
            config.session_wait(),
        )?;
        Ok(Self {
            authorizer,
            peer_connector: Arc::new(RegistryConnector::new(Arc::clone(&registry))),
            registry,
            clients: ClientDetails::new(),
            portal,
            config,
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Close every tunnel, then let in-flight HTTP requests drain.
    pub async fn shutdown(self) {
        self.registry.close_all();
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .is_err()
        {
            warn!("HTTP server did not drain within 10s");
        }
    }
}

/// Bind `config.listen` and serve until [`ServerHandle::shutdown`].
pub async fn start_server(config: Config) -> anyhow::Result<ServerHandle> {
    config.validate()?;
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let local_addr = listener.local_addr()?;

    let state = Arc::new(ServerState::new(config)?);
    let registry = Arc::clone(&state.registry);
    let app = router(state);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server error");
        }
    });

    info!(%local_addr, "dialer-server listening");
    Ok(ServerHandle {
        local_addr,
        registry,
        shutdown_tx,
        task,
    })
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(paths::AGENT_CONNECT, get(agent_connect))
        .route(paths::DIALER, get(dialer_connect))
        .route(paths::AGENT_CHECK, get(check_cluster))
        .route(
            "/clusteragent/client-detail/{client_type}/{cluster_key}",
            get(client_detail),
        )
        .route(
            "/clusteragent/client-detail/{client_type}",
            get(list_client_details),
        )
        .fallback(netportal)
        .with_state(state)
}

fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

async fn agent_connect(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (key, cluster_key, client_type) =
        match state.authorizer.authorize(paths::AGENT_CONNECT, &headers) {
            Ok(Decision::Allow(Identity::Cluster {
                key,
                cluster_key,
                client_type,
            })) => (key, cluster_key, client_type),
            Ok(Decision::Allow(Identity::InternalProxy)) => {
                return reject(StatusCode::BAD_REQUEST, "unexpected identity")
            }
            Ok(Decision::Deny(reason)) => {
                warn!(%reason, "tunnel connect rejected");
                return reject(reason.status(), reason.to_string());
            }
            Err(e) => {
                warn!(error = %e, "malformed tunnel connect request");
                return reject(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

    if client_type.is_cluster() {
        match headers.get(headers::CLUSTER_INFO) {
            None if state.config.need_cluster_info => {
                return reject(
                    StatusCode::BAD_REQUEST,
                    "missing header:X-Erda-Cluster-Info",
                )
            }
            None => {}
            Some(value) => {
                let parsed = value
                    .to_str()
                    .map_err(|e| e.to_string())
                    .and_then(|v| cluster_info::parse(v).map_err(|e| e.to_string()));
                match parsed {
                    Ok(info) => {
                        debug!(cluster_key = %key, address = %info.address, "cluster info validated")
                    }
                    Err(message) => {
                        warn!(cluster_key = %key, error = %message, "invalid cluster info");
                        return reject(StatusCode::BAD_REQUEST, message);
                    }
                }
            }
        }
    }

    let detail = if client_type.is_cluster() {
        None
    } else {
        headers
            .get(headers::CLIENT_DETAIL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| match client::parse_detail(v) {
                Ok(detail) => Some(detail),
                Err(e) => {
                    warn!(cluster_key = %key, error = %e, "ignoring client detail");
                    None
                }
            })
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| {
        serve_agent(state, key, cluster_key, client_type, detail, socket)
    })
}

fn binary_message(data: Bytes) -> Message {
    Message::Binary(data)
}

fn wire_message(msg: Message) -> WireMessage {
    match msg {
        Message::Binary(data) => WireMessage::Binary(data),
        Message::Ping(_) => WireMessage::Ping,
        Message::Pong(_) => WireMessage::Pong,
        Message::Close(_) => WireMessage::Close,
        Message::Text(_) => WireMessage::Other,
    }
}

async fn finish_writer(writer: JoinHandle<()>) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer)
        .await
        .is_err()
    {
        abort.abort();
    }
}

async fn serve_agent(
    state: Arc<ServerState>,
    key: ClusterKey,
    cluster_key: String,
    client_type: ClientType,
    detail: Option<ClientDetail>,
    socket: WebSocket,
) {
    let (sink, stream) = socket.split();
    let (frame_tx, writer) = spawn_writer(sink, binary_message);
    let session = Session::new(
        key.as_str(),
        Role::Server,
        frame_tx,
        Arc::new(RejectConnects),
        state.config.session_config(),
    );

    if let Some(old) = state.registry.register(key.clone(), session.clone()) {
        warn!(
            cluster_key = %key,
            old_session_id = old.id(),
            session_id = session.id(),
            "replacing existing tunnel session"
        );
        old.close();
    }
    if let Some(detail) = detail {
        state
            .clients
            .insert(key.clone(), &cluster_key, client_type.clone(), detail);
    }
    info!(cluster_key = %key, client_type = %client_type, session_id = session.id(), "agent connected");

    let result = session.run(stream.map(|msg| msg.map(wire_message))).await;
    session.close();

    if state.registry.remove(&key, session.id()) {
        state.portal.forget(&key);
        state.clients.remove(&key);
    }
    match result {
        Ok(()) => info!(cluster_key = %key, session_id = session.id(), "agent disconnected"),
        Err(e) => warn!(cluster_key = %key, session_id = session.id(), error = %e, "agent session ended"),
    }

    drop(session);
    finish_writer(writer).await;
}

async fn dialer_connect(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match state.authorizer.authorize(paths::DIALER, &headers) {
        Ok(Decision::Allow(Identity::InternalProxy)) => {}
        Ok(decision) => {
            warn!(?decision, "dialer connect rejected");
            return reject(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.to_string()),
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| serve_peer(state, socket))
}

async fn serve_peer(state: Arc<ServerState>, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let (frame_tx, writer) = spawn_writer(sink, binary_message);
    let handler: Arc<dyn ConnectHandler> = state.peer_connector.clone();
    let session = Session::new(
        "cluster-dialer",
        Role::Server,
        frame_tx,
        handler,
        state.config.session_config(),
    );
    info!(session_id = session.id(), "dialer peer connected");

    let result = session.run(stream.map(|msg| msg.map(wire_message))).await;
    session.close();
    match result {
        Ok(()) => info!(session_id = session.id(), "dialer peer disconnected"),
        Err(e) => warn!(session_id = session.id(), error = %e, "dialer peer session ended"),
    }

    drop(session);
    finish_writer(writer).await;
}

#[derive(Debug, Deserialize)]
struct CheckParams {
    #[serde(rename = "clusterKey", default)]
    cluster_key: String,
    #[serde(rename = "clientType", default)]
    client_type: String,
}

async fn check_cluster(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<CheckParams>,
) -> &'static str {
    let key = ClientType::parse(&params.client_type).session_key(params.cluster_key.trim());
    if state.registry.contains(&key) {
        "true"
    } else {
        "false"
    }
}

async fn client_detail(
    State(state): State<Arc<ServerState>>,
    Path((client_type, cluster_key)): Path<(String, String)>,
) -> Response {
    let key = ClientType::parse(&client_type).session_key(&cluster_key);
    if !state.registry.contains(&key) {
        return reject(StatusCode::NOT_FOUND, "cluster not found");
    }
    match state.clients.get(&key) {
        Some(detail) => Json(detail).into_response(),
        None => reject(StatusCode::NOT_FOUND, "client data not found"),
    }
}

async fn list_client_details(
    State(state): State<Arc<ServerState>>,
    Path(client_type): Path<String>,
) -> Json<Vec<ClientDetail>> {
    Json(state.clients.list(&ClientType::parse(&client_type)))
}

async fn netportal(State(state): State<Arc<ServerState>>, req: Request) -> Response<Body> {
    state.portal.forward(req).await
}
