//! Multiplexed dial-through tunnels over a single WebSocket.
//!
//! A [`Session`] wraps one WebSocket connection and carries any number of
//! independent byte streams, each opened with a `(network, address)` pair.
//! The dialing side gets a [`TunnelConn`]; the accepting side decides what
//! to do with the request through its [`ConnectHandler`].

pub mod conn;
pub mod error;
pub mod keepalive;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;
pub mod writer;

pub use conn::TunnelConn;
pub use error::{DialError, SessionError};
pub use protocol::ConnectMeta;
pub use session::{BoxIo, ConnectHandler, RejectConnects, Role, Session, SessionConfig, TunnelIo};
pub use transport::{split_client, websocket_url, ClientWebSocket, WireMessage};
pub use types::{headers, paths, AccessCredential, ClusterKey};
pub use writer::{spawn_writer, FrameSender};
