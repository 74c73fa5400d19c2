//! Cluster dialer server.
//!
//! Accepts tunnels from cluster agents on `/clusteragent/connect`, lets
//! internal dialers reach a cluster by key over `/clusterdialer`, and
//! proxies any other HTTP request into a cluster chosen by the
//! `X-Portal-*` headers.

pub mod app;
pub mod auth;
pub mod client;
pub mod cluster_info;
pub mod config;
pub mod netportal;
pub mod peer;
pub mod registry;
pub mod server;

pub use server::{start_server, ServerHandle};
