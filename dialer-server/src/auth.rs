use std::collections::HashMap;

use axum::http::{HeaderMap, StatusCode};
use subtle::ConstantTimeEq;
use tunnel_core::{headers, paths, ClusterKey};

use crate::client::ClientType;

/// Who a tunnel-connect request was authorized as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A cluster agent (or other client type) registering under `key`.
    Cluster {
        key: ClusterKey,
        cluster_key: String,
        client_type: ClientType,
    },
    /// The internal proxy-to-proxy dialer path.
    InternalProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MissingClusterKey,
    MissingAuthorization,
    InvalidCredential,
}

impl DenyReason {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingClusterKey => StatusCode::BAD_REQUEST,
            Self::MissingAuthorization | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingClusterKey => write!(f, "missing header:X-Erda-Cluster-Key"),
            Self::MissingAuthorization => write!(f, "missing header:Authorization"),
            Self::InvalidCredential => write!(f, "invalid access credential"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Identity),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

/// Malformed input, as opposed to a well-formed but unauthenticated request.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("header {0} is not valid UTF-8")]
    InvalidHeader(&'static str),
}

/// Decides whether a tunnel-connect request may register a session.
#[derive(Debug, Default)]
pub struct Authorizer {
    access_keys: Option<HashMap<ClusterKey, String>>,
}

impl Authorizer {
    /// Accept any non-empty credential.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept only the configured credential of each cluster key.
    pub fn with_access_keys(access_keys: HashMap<ClusterKey, String>) -> Self {
        Self {
            access_keys: Some(access_keys),
        }
    }

    /// Pure check of one request. `Ok(Deny)` for a valid request that fails
    /// authentication, `Err` only when the headers themselves are malformed.
    pub fn authorize(&self, path: &str, headers: &HeaderMap) -> Result<Decision, AuthError> {
        if path == paths::DIALER {
            return Ok(Decision::Allow(Identity::InternalProxy));
        }

        let cluster_key = header_str(headers, headers::CLUSTER_KEY)?.unwrap_or_default();
        if cluster_key.is_empty() {
            return Ok(Decision::Deny(DenyReason::MissingClusterKey));
        }
        let credential = header_str(headers, headers::AUTHORIZATION)?.unwrap_or_default();
        if credential.is_empty() {
            return Ok(Decision::Deny(DenyReason::MissingAuthorization));
        }

        if let Some(keys) = &self.access_keys {
            let expected = keys
                .get(&ClusterKey::from(cluster_key))
                .map(String::as_bytes)
                .unwrap_or_default();
            if !bool::from(credential.as_bytes().ct_eq(expected)) || expected.is_empty() {
                return Ok(Decision::Deny(DenyReason::InvalidCredential));
            }
        }

        let client_type =
            ClientType::parse(header_str(headers, headers::CLIENT_TYPE)?.unwrap_or_default());
        Ok(Decision::Allow(Identity::Cluster {
            key: client_type.session_key(cluster_key),
            cluster_key: cluster_key.to_string(),
            client_type,
        }))
    }
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, AuthError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map(str::trim)
                .map_err(|_| AuthError::InvalidHeader(name))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn request(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn empty_authorization_is_denied_without_error() {
        let auth = Authorizer::new();
        let headers = request(&[
            (headers::CLUSTER_KEY, "cluster-A"),
            (headers::AUTHORIZATION, ""),
        ]);
        let decision = auth.authorize(paths::AGENT_CONNECT, &headers).unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::MissingAuthorization));
        assert_eq!(DenyReason::MissingAuthorization.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn key_and_credential_are_accepted() {
        let auth = Authorizer::new();
        let headers = request(&[
            (headers::CLUSTER_KEY, "cluster-A"),
            (headers::AUTHORIZATION, "token"),
        ]);
        let decision = auth.authorize(paths::AGENT_CONNECT, &headers).unwrap();
        assert!(decision.is_allowed());
        assert_eq!(
            decision,
            Decision::Allow(Identity::Cluster {
                key: ClusterKey::from("cluster-A"),
                cluster_key: "cluster-A".into(),
                client_type: ClientType::Cluster,
            })
        );
    }

    #[test]
    fn missing_cluster_key_is_a_bad_request() {
        let auth = Authorizer::new();
        let headers = request(&[(headers::AUTHORIZATION, "token")]);
        let decision = auth.authorize(paths::AGENT_CONNECT, &headers).unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::MissingClusterKey));
        assert_eq!(DenyReason::MissingClusterKey.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            DenyReason::MissingClusterKey.to_string(),
            "missing header:X-Erda-Cluster-Key"
        );
    }

    #[test]
    fn dialer_path_is_trusted() {
        let auth = Authorizer::with_access_keys(HashMap::new());
        let decision = auth.authorize(paths::DIALER, &HeaderMap::new()).unwrap();
        assert_eq!(decision, Decision::Allow(Identity::InternalProxy));
    }

    #[test]
    fn client_type_changes_the_session_key() {
        let auth = Authorizer::new();
        let headers = request(&[
            (headers::CLUSTER_KEY, "cluster-A"),
            (headers::AUTHORIZATION, "token"),
            (headers::CLIENT_TYPE, "edge"),
        ]);
        match auth.authorize(paths::AGENT_CONNECT, &headers).unwrap() {
            Decision::Allow(Identity::Cluster { key, .. }) => {
                assert_eq!(key.as_str(), "cluster-A@edge")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn static_access_keys_must_match() {
        let auth = Authorizer::with_access_keys(HashMap::from([(
            ClusterKey::from("cluster-A"),
            "s3cret".to_string(),
        )]));
        let with = |key: &str, secret: &str| {
            let headers = request(&[
                (headers::CLUSTER_KEY, key),
                (headers::AUTHORIZATION, secret),
            ]);
            auth.authorize(paths::AGENT_CONNECT, &headers).unwrap()
        };

        assert!(with("cluster-A", "s3cret").is_allowed());
        assert_eq!(
            with("cluster-A", "wrong"),
            Decision::Deny(DenyReason::InvalidCredential)
        );
        assert_eq!(
            with("cluster-B", "s3cret"),
            Decision::Deny(DenyReason::InvalidCredential)
        );
    }

    #[test]
    fn non_utf8_header_is_an_error() {
        let mut map = HeaderMap::new();
        map.insert(
            headers::CLUSTER_KEY,
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        assert!(matches!(
            Authorizer::new().authorize(paths::AGENT_CONNECT, &map),
            Err(AuthError::InvalidHeader(_))
        ));
    }
}
