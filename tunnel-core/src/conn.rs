//! Per-stream byte pipe between a `TunnelConn` and the session's frames.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper_util::client::legacy::connect::{Connected, Connection};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::protocol::{ConnectMeta, Frame, MAX_CHUNK_SIZE};
use crate::writer::FrameSender;

const STREAM_BUFFER: usize = 64 * 1024;

/// Bytes either side may send on a fresh stream before the first credit.
pub(crate) const INITIAL_WINDOW: usize = 256 * 1024;

/// Consumed bytes are credited back once this many have accumulated.
/// Must leave room for a full chunk in the peer's remaining window.
const CREDIT_THRESHOLD: usize = INITIAL_WINDOW / 4;

/// Upper bound on granted but unspent send window.
const MAX_WINDOW: usize = 16 * 1024 * 1024;

/// Per-stream flow control shared by the session read loop and the pump.
///
/// The peer may only have `recv` bytes in flight towards us, so the read
/// loop can queue a stream's data without ever waiting on its consumer.
pub(crate) struct Window {
    send: Semaphore,
    recv: AtomicI64,
}

impl Window {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            send: Semaphore::new(INITIAL_WINDOW),
            recv: AtomicI64::new(INITIAL_WINDOW as i64),
        })
    }

    /// Account for `len` received bytes. `false` when the peer overran the
    /// window it was granted.
    pub(crate) fn consume(&self, len: usize) -> bool {
        let len = len as i64;
        self.recv.fetch_sub(len, Ordering::AcqRel) >= len
    }

    /// Credit from the peer.
    pub(crate) fn grant(&self, credit: u32) {
        let room = MAX_WINDOW.saturating_sub(self.send.available_permits());
        self.send.add_permits((credit as usize).min(room));
    }

    fn replenish(&self, len: usize) {
        self.recv.fetch_add(len as i64, Ordering::AcqRel);
    }

    /// Fail pending sends once the stream is torn down.
    pub(crate) fn close(&self) {
        self.send.close();
    }
}

/// Events delivered to a stream by the session read loop.
pub(crate) enum Inbound {
    Data(Bytes),
    End,
    Abort(String),
}

/// One dial-through stream. Reads and writes are relayed over the tunnel.
#[derive(Debug)]
pub struct TunnelConn {
    io: DuplexStream,
    stream_id: u32,
    meta: ConnectMeta,
}

impl TunnelConn {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn network(&self) -> &str {
        &self.meta.network
    }

    pub fn address(&self) -> &str {
        &self.meta.address
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Connection for TunnelConn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

enum Flow {
    Done,
    Abort,
}

/// Start relaying one stream; `on_exit` runs once both directions finished
/// or the stream was aborted.
pub(crate) fn spawn_pump<F>(
    stream_id: u32,
    meta: ConnectMeta,
    frame_tx: FrameSender,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    window: Arc<Window>,
    on_exit: F,
) -> TunnelConn
where
    F: FnOnce() + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
    tokio::spawn(async move {
        pump(stream_id, remote, frame_tx, inbound, &window).await;
        window.close();
        on_exit();
    });
    TunnelConn {
        io: local,
        stream_id,
        meta,
    }
}

async fn pump(
    stream_id: u32,
    io: DuplexStream,
    frame_tx: FrameSender,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    window: &Window,
) {
    let (mut rd, mut wr) = tokio::io::split(io);

    let out_tx = frame_tx.clone();
    let outbound = async move {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) => {
                    let _ = out_tx.send(Frame::end(stream_id)).await;
                    return Flow::Done;
                }
                Ok(n) => {
                    match window.send.acquire_many(n as u32).await {
                        Ok(permit) => permit.forget(),
                        Err(_) => return Flow::Abort,
                    }
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if out_tx.send(Frame::data(stream_id, chunk)).await.is_err() {
                        return Flow::Abort;
                    }
                }
                Err(e) => {
                    let _ = out_tx.send(Frame::error(stream_id, &e)).await;
                    return Flow::Abort;
                }
            }
        }
    };

    let incoming = async move {
        let mut consumed = 0usize;
        while let Some(event) = inbound.recv().await {
            match event {
                Inbound::Data(data) => {
                    if let Err(e) = wr.write_all(&data).await {
                        debug!(stream_id, error = %e, "local side of stream gone");
                        let _ = frame_tx.send(Frame::error(stream_id, "connection closed")).await;
                        return Flow::Abort;
                    }
                    consumed += data.len();
                    if consumed >= CREDIT_THRESHOLD {
                        // Raise the budget before the peer can see the credit.
                        window.replenish(consumed);
                        if frame_tx
                            .send(Frame::window_update(stream_id, consumed as u32))
                            .await
                            .is_err()
                        {
                            return Flow::Abort;
                        }
                        consumed = 0;
                    }
                }
                Inbound::End => {
                    let _ = wr.shutdown().await;
                    return Flow::Done;
                }
                Inbound::Abort(reason) => {
                    debug!(stream_id, reason = %reason, "stream aborted by peer");
                    return Flow::Abort;
                }
            }
        }
        // Sender dropped: the session closed underneath us.
        Flow::Abort
    };

    tokio::pin!(outbound);
    tokio::pin!(incoming);
    let (mut out_done, mut in_done) = (false, false);
    while !(out_done && in_done) {
        tokio::select! {
            flow = &mut outbound, if !out_done => match flow {
                Flow::Done => out_done = true,
                Flow::Abort => break,
            },
            flow = &mut incoming, if !in_done => match flow {
                Flow::Done => in_done = true,
                Flow::Abort => break,
            },
        }
    }
}
