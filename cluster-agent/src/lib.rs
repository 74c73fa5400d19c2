//! Cluster-side tunnel agent.
//!
//! Keeps one outbound WebSocket to the cluster dialer, authenticated by the
//! cluster key and an access credential, and serves dial-throughs that pass
//! the [`dial_policy::AllowPolicy`].

pub mod app;
pub mod config;
pub mod credential;
pub mod dial_policy;
pub mod state;
pub mod tunnel;
