//! Dedicated WebSocket writer task.
//!
//! All frame writes go through an mpsc channel to a single writer task,
//! avoiding contention on the WebSocket sink.

use std::fmt::Display;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::protocol::Frame;

/// Sender half, cloned by stream pumps and keepalive.
pub type FrameSender = mpsc::Sender<Frame>;

/// Spawn the writer task. `wrap` turns an encoded frame into the sink's
/// binary message type. Returns the sender and a JoinHandle for cleanup.
pub fn spawn_writer<S, M>(mut sink: S, wrap: fn(Bytes) -> M) -> (FrameSender, JoinHandle<()>)
where
    S: Sink<M> + Unpin + Send + 'static,
    S::Error: Display,
    M: Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(wrap(frame.encode())).await {
                error!(error = %e, "failed to write frame to WebSocket");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::protocol::MsgType;

    #[tokio::test]
    async fn writes_frames_in_order() {
        let written = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let sink = Box::pin(futures_util::sink::unfold(
            Arc::clone(&written),
            |acc, data: Bytes| async move {
                acc.lock().push(data);
                Ok::<_, std::io::Error>(acc)
            },
        ));
        let (frame_tx, handle) = spawn_writer(sink, |b| b);

        frame_tx.send(Frame::data(1, "a")).await.unwrap();
        frame_tx.send(Frame::end(1)).await.unwrap();
        drop(frame_tx);
        handle.await.unwrap();

        let frames: Vec<Frame> = written
            .lock()
            .iter()
            .map(|b| Frame::decode(b.clone()).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_type, MsgType::Data);
        assert_eq!(&frames[0].payload[..], b"a");
        assert_eq!(frames[1].msg_type, MsgType::StreamEnd);
    }
}
