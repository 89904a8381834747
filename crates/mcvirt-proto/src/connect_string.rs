//! Connection strings used to bootstrap cluster membership.
//!
//! A connection string is base64 of a JSON object carrying the issuing
//! node's hostname and IP, a freshly-created connection user, and the
//! node's CA certificate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{McvError, McvResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionString {
    pub hostname: String,
    pub ip_address: String,
    pub username: String,
    pub password: String,
    /// PEM-encoded CA certificate of the issuing node.
    pub ca_cert: String,
}

/// Same shape as [`ConnectionString`] but tolerant of missing keys, so that
/// an absent field reports which one rather than a generic parse error.
#[derive(Deserialize)]
struct RawConnectionString {
    hostname: Option<String>,
    ip_address: Option<String>,
    username: Option<String>,
    password: Option<String>,
    ca_cert: Option<String>,
}

fn required(field: &str, value: Option<String>) -> McvResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(McvError::InvalidConnectionString(format!(
            "missing or empty field '{}'",
            field
        ))),
    }
}

impl ConnectionString {
    pub fn encode(&self) -> McvResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> McvResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| McvError::InvalidConnectionString(format!("not base64: {}", e)))?;
        let raw: RawConnectionString = serde_json::from_slice(&bytes)
            .map_err(|e| McvError::InvalidConnectionString(format!("not JSON: {}", e)))?;
        Ok(Self {
            hostname: required("hostname", raw.hostname)?,
            ip_address: required("ip_address", raw.ip_address)?,
            username: required("username", raw.username)?,
            password: required("password", raw.password)?,
            ca_cert: required("ca_cert", raw.ca_cert)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionString {
        ConnectionString {
            hostname: "n2".into(),
            ip_address: "10.0.0.2".into(),
            username: "mcv-connection-abc".into(),
            password: "secret".into(),
            ca_cert: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".into(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let cs = sample();
        let encoded = cs.encode().unwrap();
        assert_eq!(ConnectionString::decode(&encoded).unwrap(), cs);
    }

    #[test]
    fn test_missing_field_rejected() {
        let json = r#"{"hostname":"n2","ip_address":"10.0.0.2","username":"u","password":"p"}"#;
        let encoded = STANDARD.encode(json);
        match ConnectionString::decode(&encoded) {
            Err(McvError::InvalidConnectionString(msg)) => assert!(msg.contains("ca_cert")),
            other => panic!("expected InvalidConnectionString, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_field_rejected() {
        let mut cs = sample();
        cs.password = String::new();
        let encoded = STANDARD.encode(serde_json::to_vec(&cs).unwrap());
        assert!(matches!(
            ConnectionString::decode(&encoded),
            Err(McvError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ConnectionString::decode("!!!").is_err());
        assert!(ConnectionString::decode(&STANDARD.encode("[1,2]")).is_err());
    }
}
