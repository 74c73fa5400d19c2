//! A multiplexed tunnel session: one WebSocket carrying many independent
//! dial-through byte streams.
//!
//! Either side can open streams with [`Session::dial`]. Inbound `Connect`
//! frames are served by the session's [`ConnectHandler`], which decides
//! whether and how the requested `(network, address)` is reached.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::conn::{spawn_pump, Inbound, TunnelConn, Window};
use crate::error::{DialError, SessionError};
use crate::keepalive;
use crate::protocol::{ConnectMeta, Frame, MsgType};
use crate::transport::WireMessage;
use crate::types::ClusterKey;
use crate::writer::FrameSender;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream handed back by a [`ConnectHandler`].
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxIo = Box<dyn TunnelIo>;

/// Serves `Connect` requests arriving from the peer.
pub trait ConnectHandler: Send + Sync + 'static {
    fn connect(&self, meta: ConnectMeta) -> BoxFuture<'static, Result<BoxIo, DialError>>;
}

/// Refuses every inbound dial. Used where only the local side dials.
pub struct RejectConnects;

impl ConnectHandler for RejectConnects {
    fn connect(&self, meta: ConnectMeta) -> BoxFuture<'static, Result<BoxIo, DialError>> {
        Box::pin(future::ready(Err(DialError::not_allowed(
            &meta.network,
            &meta.address,
        ))))
    }
}

/// Which end of the WebSocket this session sits on. Decides stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the WebSocket; allocates odd stream ids.
    Client,
    /// Accepted the WebSocket; allocates even stream ids.
    Server,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub stale_timeout: Duration,
    /// How long a dial waits for the peer's `ConnectOk`.
    pub connect_timeout: Duration,
    pub max_streams: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            stale_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            max_streams: 1024,
        }
    }
}

type Ack = oneshot::Sender<Result<(), String>>;

struct Slot {
    inbound: mpsc::UnboundedSender<Inbound>,
    window: Arc<Window>,
    ack: Option<Ack>,
}

#[derive(Default)]
struct StreamTable {
    closed: bool,
    slots: HashMap<u32, Slot>,
}

struct Shared {
    id: u64,
    label: String,
    frame_tx: FrameSender,
    handler: Arc<dyn ConnectHandler>,
    config: SessionConfig,
    next_stream_id: AtomicU32,
    streams: Mutex<StreamTable>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn allocate_stream_id(&self) -> u32 {
        loop {
            let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn insert_slot(&self, stream_id: u32, slot: Slot) -> Result<(), DialError> {
        let mut table = self.streams.lock();
        if table.closed {
            return Err(DialError::SessionClosed);
        }
        if table.slots.len() >= self.config.max_streams {
            return Err(DialError::TooManyStreams);
        }
        if table.slots.contains_key(&stream_id) {
            return Err(DialError::Remote(format!("stream {stream_id} already open")));
        }
        table.slots.insert(stream_id, slot);
        Ok(())
    }

    fn remove_slot(&self, stream_id: u32) {
        self.streams.lock().slots.remove(&stream_id);
    }

    fn inbound(&self, stream_id: u32) -> Option<(mpsc::UnboundedSender<Inbound>, Arc<Window>)> {
        self.streams
            .lock()
            .slots
            .get(&stream_id)
            .map(|slot| (slot.inbound.clone(), Arc::clone(&slot.window)))
    }

    fn grant(&self, stream_id: u32, credit: u32) {
        if let Some(slot) = self.streams.lock().slots.get(&stream_id) {
            slot.window.grant(credit);
        }
    }

    fn acknowledge(&self, stream_id: u32) {
        let ack = self
            .streams
            .lock()
            .slots
            .get_mut(&stream_id)
            .and_then(|slot| slot.ack.take());
        if let Some(ack) = ack {
            let _ = ack.send(Ok(()));
        }
    }

    /// Tear down one stream. A pending dial sees the reason as its error.
    fn fail_stream(&self, stream_id: u32, reason: String) {
        let Some(mut slot) = self.streams.lock().slots.remove(&stream_id) else {
            return;
        };
        match slot.ack.take() {
            Some(ack) => {
                let _ = ack.send(Err(reason));
            }
            None => {
                let _ = slot.inbound.send(Inbound::Abort(reason));
            }
        }
    }
}

/// Cheaply cloneable handle to one tunnel session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(
        label: impl Into<String>,
        role: Role,
        frame_tx: FrameSender,
        handler: Arc<dyn ConnectHandler>,
        config: SessionConfig,
    ) -> Self {
        let first_stream_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                frame_tx,
                handler,
                config,
                next_stream_id: AtomicU32::new(first_stream_id),
                streams: Mutex::new(StreamTable::default()),
                closed,
            }),
        }
    }

    /// Process-unique id, used to tell a replaced session from its successor.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().slots.len()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the session: pending dials fail, open streams are aborted and
    /// the peer is told to go away. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut table = self.shared.streams.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.slots)
        };
        self.shared.closed.send_replace(true);
        let _ = self
            .shared
            .frame_tx
            .try_send(Frame::control(MsgType::GoAway, Bytes::new()));
        debug!(
            session_id = self.shared.id,
            session = %self.shared.label,
            aborted_streams = drained.len(),
            "session closed"
        );
    }

    /// Open a stream to `address` on the peer's side.
    pub async fn dial(&self, network: &str, address: &str) -> Result<TunnelConn, DialError> {
        self.open(ConnectMeta::new(network, address)).await
    }

    /// Ask the peer to dial `address` through the session it holds for
    /// `cluster_key`.
    pub async fn dial_via(
        &self,
        cluster_key: &ClusterKey,
        network: &str,
        address: &str,
    ) -> Result<TunnelConn, DialError> {
        self.open(ConnectMeta::via(cluster_key.clone(), network, address))
            .await
    }

    async fn open(&self, meta: ConnectMeta) -> Result<TunnelConn, DialError> {
        let stream_id = self.shared.allocate_stream_id();
        let connect = meta.to_frame(stream_id)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let window = Window::new();
        self.shared.insert_slot(
            stream_id,
            Slot {
                inbound: inbound_tx,
                window: Arc::clone(&window),
                ack: Some(ack_tx),
            },
        )?;

        if self.shared.frame_tx.send(connect).await.is_err() {
            self.shared.remove_slot(stream_id);
            return Err(DialError::SessionClosed);
        }

        let timeout = self.shared.config.connect_timeout;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(
                    session = %self.shared.label,
                    stream_id,
                    network = %meta.network,
                    address = %meta.address,
                    "stream opened"
                );
                Ok(self.attach(stream_id, meta, inbound_rx, window))
            }
            Ok(Ok(Err(reason))) => Err(DialError::Remote(reason)),
            Ok(Err(_)) => Err(DialError::SessionClosed),
            Err(_) => {
                self.shared.remove_slot(stream_id);
                let _ = self
                    .shared
                    .frame_tx
                    .try_send(Frame::error(stream_id, "dial timed out"));
                Err(DialError::Timeout(timeout))
            }
        }
    }

    fn attach(
        &self,
        stream_id: u32,
        meta: ConnectMeta,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        window: Arc<Window>,
    ) -> TunnelConn {
        let shared = Arc::clone(&self.shared);
        spawn_pump(
            stream_id,
            meta,
            self.shared.frame_tx.clone(),
            inbound,
            window,
            move || shared.remove_slot(stream_id),
        )
    }

    fn accept(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        let meta = match ConnectMeta::from_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(stream_id, error = %e, "invalid connect metadata");
                self.reply_error(stream_id, &e);
                return;
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let window = Window::new();
        if let Err(e) = self.shared.insert_slot(
            stream_id,
            Slot {
                inbound: inbound_tx,
                window: Arc::clone(&window),
                ack: None,
            },
        ) {
            warn!(stream_id, error = %e, "rejecting inbound stream");
            self.reply_error(stream_id, &e);
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            session
                .serve_stream(stream_id, meta, inbound_rx, window)
                .await
        });
    }

    async fn serve_stream(
        self,
        stream_id: u32,
        meta: ConnectMeta,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        window: Arc<Window>,
    ) {
        let handler = Arc::clone(&self.shared.handler);
        let mut target = match handler.connect(meta.clone()).await {
            Ok(t) => t,
            Err(e) => {
                debug!(
                    session = %self.shared.label,
                    stream_id,
                    network = %meta.network,
                    address = %meta.address,
                    error = %e,
                    "inbound dial failed"
                );
                self.shared.remove_slot(stream_id);
                let _ = self.shared.frame_tx.send(Frame::error(stream_id, &e)).await;
                return;
            }
        };

        let ok = Frame::new(stream_id, MsgType::ConnectOk, 0, Bytes::new());
        if self.shared.frame_tx.send(ok).await.is_err() {
            self.shared.remove_slot(stream_id);
            return;
        }

        let mut conn = self.attach(stream_id, meta, inbound, window);
        match tokio::io::copy_bidirectional(&mut conn, &mut target).await {
            Ok((to_target, from_target)) => {
                debug!(stream_id, to_target, from_target, "inbound stream finished");
            }
            Err(e) => {
                debug!(stream_id, error = %e, "inbound stream closed with error");
            }
        }
    }

    fn reply_error(&self, stream_id: u32, reason: &dyn Display) {
        if self
            .shared
            .frame_tx
            .try_send(Frame::error(stream_id, reason))
            .is_err()
        {
            warn!(stream_id, "writer channel full, StreamError dropped");
        }
    }

    /// Run the read loop until the peer goes away, the transport fails, the
    /// connection goes stale or [`Session::close`] is called. The session is
    /// closed when this returns.
    pub async fn run<S, E>(&self, mut ws_stream: S) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<WireMessage, E>> + Unpin,
        E: Display,
    {
        let keepalive = keepalive::spawn(
            self.shared.frame_tx.clone(),
            self.shared.config.ping_interval,
        );
        let stale_timeout = self.shared.config.stale_timeout;
        let mut last_data_at = Instant::now();

        let result = loop {
            let msg = tokio::select! {
                msg = ws_stream.next() => match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        error!(session = %self.shared.label, error = %e, "WebSocket read error");
                        break Err(SessionError::Transport(e.to_string()));
                    }
                    None => break Ok(()),
                },
                _ = tokio::time::sleep_until(last_data_at + stale_timeout) => {
                    warn!(
                        session = %self.shared.label,
                        stale_secs = stale_timeout.as_secs(),
                        "tunnel connection stale, no data received"
                    );
                    break Err(SessionError::Stale(stale_timeout));
                }
                _ = self.closed() => break Ok(()),
            };

            // Any successfully received message proves the connection is alive
            last_data_at = Instant::now();

            let data = match msg {
                WireMessage::Binary(data) => data,
                WireMessage::Close => {
                    info!(session = %self.shared.label, "received WebSocket close");
                    break Ok(());
                }
                _ => continue,
            };

            let frame = match Frame::decode(data) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "failed to decode frame");
                    continue;
                }
            };

            match frame.msg_type {
                MsgType::Connect => self.accept(frame),
                MsgType::ConnectOk => self.shared.acknowledge(frame.stream_id),
                MsgType::Data => self.deliver(frame.stream_id, Inbound::Data(frame.payload)),
                MsgType::StreamEnd => self.deliver(frame.stream_id, Inbound::End),
                MsgType::WindowUpdate => match frame.credit() {
                    Some(credit) => self.shared.grant(frame.stream_id, credit),
                    None => warn!(stream_id = frame.stream_id, "malformed window update"),
                },
                MsgType::StreamError => {
                    let reason = frame.reason();
                    self.shared.fail_stream(frame.stream_id, reason);
                }
                MsgType::Ping => {
                    // Use try_send to avoid blocking the read loop when writer is congested
                    if self
                        .shared
                        .frame_tx
                        .try_send(Frame::control(MsgType::Pong, frame.payload))
                        .is_err()
                    {
                        warn!("writer channel full, Pong dropped");
                    }
                }
                MsgType::Pong => {}
                MsgType::GoAway => {
                    info!(session = %self.shared.label, "received GOAWAY");
                    break Ok(());
                }
            }
        };

        if let Some(handle) = keepalive {
            handle.abort();
        }
        self.close();
        result
    }

    /// Hand an event to a stream without waiting on its consumer. A peer
    /// that sends past the stream's window gets only that stream aborted.
    fn deliver(&self, stream_id: u32, event: Inbound) {
        let Some((tx, window)) = self.shared.inbound(stream_id) else {
            return;
        };
        if let Inbound::Data(data) = &event {
            if !window.consume(data.len()) {
                warn!(stream_id, "peer overran stream window, aborting stream");
                self.shared
                    .fail_stream(stream_id, "flow control window exceeded".to_string());
                self.reply_error(stream_id, &"flow control window exceeded");
                return;
            }
        }
        let _ = tx.send(event);
    }
}
