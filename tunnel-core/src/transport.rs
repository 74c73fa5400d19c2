//! Transport-neutral view of WebSocket messages, plus the tungstenite
//! adapter used by the client side of a tunnel.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::writer::{spawn_writer, FrameSender};

/// What the session read loop cares about in a WebSocket message.
#[derive(Debug)]
pub enum WireMessage {
    Binary(Bytes),
    Ping,
    Pong,
    Close,
    Other,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Binary(data) => WireMessage::Binary(Bytes::from(data)),
            Message::Ping(_) => WireMessage::Ping,
            Message::Pong(_) => WireMessage::Pong,
            Message::Close(_) => WireMessage::Close,
            _ => WireMessage::Other,
        }
    }
}

/// Turn an `http(s)://` or `ws(s)://` base address into the WebSocket URL
/// of `path` on that server. A bare `host:port` is treated as plain `ws`.
pub fn websocket_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{ws_base}{path}")
}

pub type ClientWebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn binary_message(data: Bytes) -> Message {
    Message::Binary(data.into())
}

/// Split a client WebSocket into a frame writer and the inbound message
/// stream a `Session` runs on.
pub fn split_client(
    ws: ClientWebSocket,
) -> (
    FrameSender,
    JoinHandle<()>,
    impl Stream<Item = Result<WireMessage, tungstenite::Error>> + Unpin + Send,
) {
    let (sink, read) = ws.split();
    let (frame_tx, writer) = spawn_writer(sink, binary_message);
    (frame_tx, writer, read.map(|msg| msg.map(WireMessage::from)))
}
