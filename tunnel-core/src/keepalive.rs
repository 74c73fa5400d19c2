//! Periodic control-plane pings so idle tunnels are not reaped by proxies
//! and the peer's stale timer keeps getting refreshed.

use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::protocol::{Frame, MsgType};
use crate::writer::FrameSender;

/// Spawn the ping task. It stops on its own once the writer is gone.
pub fn spawn(frame_tx: FrameSender, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        // Skip the immediate first tick.
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if frame_tx
                .send(Frame::control(MsgType::Ping, Bytes::new()))
                .await
                .is_err()
            {
                break;
            }
            debug!("sent ping");
        }
    }))
}
