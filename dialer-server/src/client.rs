//! Non-cluster clients: the key they register under and the detail they
//! report on connect.

use std::fmt;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tunnel_core::ClusterKey;

pub type ClientDetail = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientType {
    Cluster,
    Other(String),
}

impl ClientType {
    /// Empty and `cluster` both mean a cluster agent.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "cluster" => Self::Cluster,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster)
    }

    /// Registry key for `cluster_key` under this client type.
    pub fn session_key(&self, cluster_key: &str) -> ClusterKey {
        match self {
            Self::Cluster => ClusterKey::from(cluster_key),
            Self::Other(kind) => ClusterKey::from(format!("{cluster_key}@{kind}")),
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => f.write_str("cluster"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid client detail: {0}")]
pub struct ClientDetailError(String);

/// Parse the `X-Erda-Client-Detail` header: a JSON object of strings.
pub fn parse_detail(value: &str) -> Result<ClientDetail, ClientDetailError> {
    let detail: Map<String, Value> =
        serde_json::from_str(value).map_err(|e| ClientDetailError(e.to_string()))?;
    if let Some((field, _)) = detail.iter().find(|(_, v)| !v.is_string()) {
        return Err(ClientDetailError(format!("field {field:?} is not a string")));
    }
    Ok(detail)
}

struct Entry {
    client_type: ClientType,
    detail: ClientDetail,
}

/// In-memory detail store, keyed like the session registry.
#[derive(Default)]
pub struct ClientDetails {
    entries: DashMap<ClusterKey, Entry>,
}

impl ClientDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        session_key: ClusterKey,
        cluster_key: &str,
        client_type: ClientType,
        mut detail: ClientDetail,
    ) {
        detail.insert("clusterKey".into(), Value::String(cluster_key.to_string()));
        self.entries.insert(
            session_key,
            Entry {
                client_type,
                detail,
            },
        );
    }

    pub fn get(&self, session_key: &ClusterKey) -> Option<ClientDetail> {
        self.entries.get(session_key).map(|e| e.detail.clone())
    }

    pub fn remove(&self, session_key: &ClusterKey) {
        self.entries.remove(session_key);
    }

    pub fn list(&self, client_type: &ClientType) -> Vec<ClientDetail> {
        let mut details: Vec<(ClusterKey, ClientDetail)> = self
            .entries
            .iter()
            .filter(|e| &e.client_type == client_type)
            .map(|e| (e.key().clone(), e.detail.clone()))
            .collect();
        details.sort_by(|a, b| a.0.cmp(&b.0));
        details.into_iter().map(|(_, d)| d).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_type_keys() {
        assert!(ClientType::parse("").is_cluster());
        assert!(ClientType::parse("cluster").is_cluster());
        assert_eq!(ClientType::parse("").session_key("c1").as_str(), "c1");

        let edge = ClientType::parse("edge");
        assert!(!edge.is_cluster());
        assert_eq!(edge.session_key("c1").as_str(), "c1@edge");
        assert_eq!(edge.to_string(), "edge");
    }

    #[test]
    fn detail_must_hold_strings() {
        let detail = parse_detail(r#"{"version":"1.2","zone":"a"}"#).unwrap();
        assert_eq!(detail["zone"], "a");
        assert!(parse_detail(r#"{"version":1}"#).is_err());
        assert!(parse_detail("[]").is_err());
    }

    #[test]
    fn store_tags_cluster_key_and_lists_by_type() {
        let store = ClientDetails::new();
        let edge = ClientType::parse("edge");
        let detail = parse_detail(r#"{"zone":"a"}"#).unwrap();
        store.insert(edge.session_key("c2"), "c2", edge.clone(), detail.clone());
        store.insert(edge.session_key("c1"), "c1", edge.clone(), detail.clone());
        store.insert(
            ClientType::parse("other").session_key("c3"),
            "c3",
            ClientType::parse("other"),
            detail,
        );

        let stored = store.get(&edge.session_key("c1")).unwrap();
        assert_eq!(stored["clusterKey"], "c1");
        assert_eq!(stored["zone"], "a");

        let listed = store.list(&edge);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["clusterKey"], "c1");

        store.remove(&edge.session_key("c1"));
        assert!(store.get(&edge.session_key("c1")).is_none());
        assert_eq!(store.list(&edge).len(), 1);
    }
}
