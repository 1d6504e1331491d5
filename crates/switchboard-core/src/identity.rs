//! Peer identities and certificate fingerprints.
//!
//! Every device on the network describes itself with an identity object
//! during the handshake: `{type, name, language, os, ...}`. Services also
//! advertise an attribute table (`name → signature`) and an optional
//! client cap.

use crate::error::{SwitchboardError, SwitchboardResult};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A service may serve this many clients at once; -1 means unbounded.
pub const UNBOUNDED_CLIENTS: i64 = -1;

/// The self-description a peer exchanges during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Identity {
    Manager {
        hostname: String,
        port: u16,
        language: String,
        os: String,
        attributes: BTreeMap<String, String>,
    },
    Client {
        name: String,
        language: String,
        os: String,
    },
    Service {
        name: String,
        language: String,
        os: String,
        attributes: BTreeMap<String, String>,
        max_clients: i64,
    },
}

impl Identity {
    /// Parse an identity object received from a peer.
    ///
    /// The `type` field is matched case-insensitively; `language`, `os`,
    /// `attributes` and `max_clients` are optional.
    pub fn from_value(value: &Value) -> SwitchboardResult<Identity> {
        let map = value.as_object().ok_or_else(|| {
            SwitchboardError::Identity(format!("identity must be a JSON object, got {value}"))
        })?;
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SwitchboardError::Identity("identity is missing a type".into()))?
            .to_ascii_lowercase();

        let name = |default: &str| -> String {
            map.get("name")
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let text = |key: &str| -> String {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };

        match kind.as_str() {
            "client" => Ok(Identity::Client {
                name: name("Client"),
                language: text("language"),
                os: text("os"),
            }),
            "service" => {
                let name = map
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        SwitchboardError::Identity("a service identity must have a name".into())
                    })?
                    .to_string();
                let attributes = map
                    .get("attributes")
                    .and_then(Value::as_object)
                    .map(|attrs| {
                        attrs
                            .iter()
                            .map(|(k, v)| {
                                let signature = match v {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                (k.clone(), signature)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let max_clients = match map.get("max_clients") {
                    None | Some(Value::Null) => UNBOUNDED_CLIENTS,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        SwitchboardError::Identity(format!("max_clients must be an integer, got {v}"))
                    })?,
                };
                Ok(Identity::Service {
                    name,
                    language: text("language"),
                    os: text("os"),
                    attributes,
                    max_clients,
                })
            }
            "manager" => Err(SwitchboardError::Identity(
                "a manager cannot connect to another manager".into(),
            )),
            other => Err(SwitchboardError::Identity(format!(
                "unknown connection type {other:?}, must be \"client\" or \"service\""
            ))),
        }
    }

    /// The display name of this peer.
    pub fn name(&self) -> &str {
        match self {
            Identity::Manager { hostname, .. } => hostname,
            Identity::Client { name, .. } | Identity::Service { name, .. } => name,
        }
    }

    /// Serialize to the wire identity object.
    pub fn to_value(&self) -> Value {
        json!(self)
    }
}

/// Hex-encoded SHA-256 fingerprint of a DER-encoded certificate.
pub fn fingerprint(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    hex::encode(hash)
}

/// The language string this implementation advertises.
pub fn language() -> String {
    format!("Rust (switchboard {})", env!("CARGO_PKG_VERSION"))
}

/// The operating-system string this implementation advertises.
pub fn os() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Build the identity for a service peer, filling in language and OS.
pub fn service_identity(
    name: &str,
    attributes: BTreeMap<String, String>,
    max_clients: i64,
) -> Identity {
    Identity::Service {
        name: name.to_string(),
        language: language(),
        os: os(),
        attributes,
        max_clients,
    }
}

/// Build the identity for a client peer, filling in language and OS.
pub fn client_identity(name: &str) -> Identity {
    Identity::Client {
        name: name.to_string(),
        language: language(),
        os: os(),
    }
}
