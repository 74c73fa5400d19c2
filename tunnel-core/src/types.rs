//! Identifiers shared by the agent, the tunnel server and the dial library.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Routing key of one remote cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterKey(String);

impl ClusterKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClusterKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Secret an agent presents in the `Authorization` header.
///
/// May be empty until the credential source has produced a value. `Debug`
/// never prints the secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccessCredential(String);

impl AccessCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("AccessCredential(<empty>)")
        } else {
            f.write_str("AccessCredential(<redacted>)")
        }
    }
}

/// Header names on the tunnel-connect and netportal surfaces, lowercase so
/// they can be used as static `HeaderName`s.
pub mod headers {
    pub const CLUSTER_KEY: &str = "x-erda-cluster-key";
    pub const CLUSTER_INFO: &str = "x-erda-cluster-info";
    pub const CLIENT_TYPE: &str = "x-erda-client-type";
    pub const CLIENT_DETAIL: &str = "x-erda-client-detail";
    pub const AUTHORIZATION: &str = "authorization";

    pub const PORTAL_HOST: &str = "x-portal-host";
    pub const PORTAL_DEST: &str = "x-portal-dest";
    pub const PORTAL_SCHEME: &str = "x-portal-scheme";
    pub const PORTAL_TIMEOUT: &str = "x-portal-timeout";
}

/// Fixed paths served by the tunnel server.
pub mod paths {
    pub const AGENT_CONNECT: &str = "/clusteragent/connect";
    pub const AGENT_CHECK: &str = "/clusteragent/check";
    pub const CLIENT_DETAIL: &str = "/clusteragent/client-detail";
    pub const DIALER: &str = "/clusterdialer";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_is_redacted() {
        assert_eq!(
            format!("{:?}", AccessCredential::new("s3cret")),
            "AccessCredential(<redacted>)"
        );
        assert_eq!(
            format!("{:?}", AccessCredential::default()),
            "AccessCredential(<empty>)"
        );
    }
}
