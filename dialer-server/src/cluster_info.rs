//! Cluster metadata self-reported by agents in `X-Erda-Cluster-Info`.
//!
//! The payload is validated on connect and then dropped; nothing downstream
//! consumes it yet.

use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "caCert")]
    pub ca_cert: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterInfoError {
    #[error("invalid cluster info, {0}")]
    Decode(String),
    #[error("invalid cluster info, address empty")]
    AddressEmpty,
    #[error("invalid cluster info, token empty")]
    TokenEmpty,
    #[error("invalid cluster info, caCert empty")]
    CaCertEmpty,
}

/// Decode the header value (standard base64 of a JSON object) and check
/// that every field is present.
pub fn parse(value: &str) -> Result<ClusterInfo, ClusterInfoError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| ClusterInfoError::Decode(e.to_string()))?;
    let info: ClusterInfo =
        serde_json::from_slice(&raw).map_err(|e| ClusterInfoError::Decode(e.to_string()))?;

    if info.address.is_empty() {
        return Err(ClusterInfoError::AddressEmpty);
    }
    if info.token.is_empty() {
        return Err(ClusterInfoError::TokenEmpty);
    }
    if info.ca_cert.is_empty() {
        return Err(ClusterInfoError::CaCertEmpty);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(json: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    #[test]
    fn complete_payload_parses() {
        let info = parse(&encode(
            r#"{"address":"https://10.0.0.1:6443","token":"t","caCert":"PEM"}"#,
        ))
        .unwrap();
        assert_eq!(info.address, "https://10.0.0.1:6443");
        assert_eq!(info.ca_cert, "PEM");
    }

    #[test]
    fn empty_fields_are_named_in_order() {
        let err = parse(&encode(r#"{"token":"t","caCert":"c"}"#)).unwrap_err();
        assert_eq!(err.to_string(), "invalid cluster info, address empty");

        let err = parse(&encode(r#"{"address":"a","caCert":"c"}"#)).unwrap_err();
        assert_eq!(err.to_string(), "invalid cluster info, token empty");

        let err = parse(&encode(r#"{"address":"a","token":"t","caCert":""}"#)).unwrap_err();
        assert_eq!(err.to_string(), "invalid cluster info, caCert empty");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            parse("not base64!!"),
            Err(ClusterInfoError::Decode(_))
        ));
        assert!(matches!(
            parse(&encode("[1,2]")),
            Err(ClusterInfoError::Decode(_))
        ));
    }
}
