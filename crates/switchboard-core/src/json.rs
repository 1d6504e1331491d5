//! Pluggable JSON (de)serialization backend.
//!
//! The backend is selected at startup from the `MSL_NETWORK_JSON`
//! environment variable. The selector accepts the backend names understood
//! by other implementations of this protocol (`BUILTIN`, `UJSON`, `ORJSON`,
//! `RAPIDJSON`, `SIMPLEJSON` and their aliases); this implementation ships
//! a single backend built on serde_json and maps every recognized name onto
//! it. Unrecognized names are a startup error rather than a silent default.

use crate::constants::JSON_BACKEND_ENV;
use crate::error::{SwitchboardError, SwitchboardResult};
use serde_json::Value;

/// A JSON encoder/decoder usable on any session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonBackend {
    /// serde_json, the ecosystem standard.
    #[default]
    Builtin,
}

impl JsonBackend {
    /// Resolve a backend from its name (case-insensitive).
    pub fn from_name(name: &str) -> SwitchboardResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BUILTIN" | "JSON" | "UJSON" | "ULTRA" | "ORJSON" | "OR" | "RAPIDJSON" | "RAPID"
            | "SIMPLEJSON" | "SIMPLE" => Ok(JsonBackend::Builtin),
            other => Err(SwitchboardError::Config(format!(
                "unknown JSON backend {other:?} (set {JSON_BACKEND_ENV} to BUILTIN, \
                 UJSON, ORJSON, RAPIDJSON or SIMPLEJSON)"
            ))),
        }
    }

    /// Resolve the backend from the environment, defaulting to the builtin.
    pub fn from_env() -> SwitchboardResult<Self> {
        match std::env::var(JSON_BACKEND_ENV) {
            Ok(name) => Self::from_name(&name),
            Err(_) => Ok(JsonBackend::Builtin),
        }
    }

    /// Serialize a value to UTF-8 JSON bytes (no terminator).
    pub fn encode(&self, value: &Value) -> SwitchboardResult<Vec<u8>> {
        match self {
            JsonBackend::Builtin => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserialize UTF-8 JSON bytes into a value.
    pub fn decode(&self, bytes: &[u8]) -> SwitchboardResult<Value> {
        match self {
            JsonBackend::Builtin => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognized_names_resolve() {
        for name in [
            "builtin",
            "JSON",
            "ujson",
            "Ultra",
            "orjson",
            "OR",
            "rapidjson",
            "RAPID",
            "simplejson",
            "simple",
        ] {
            assert_eq!(JsonBackend::from_name(name).unwrap(), JsonBackend::Builtin);
        }
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(JsonBackend::from_name("yajl").is_err());
    }

    #[test]
    fn round_trip() {
        let backend = JsonBackend::Builtin;
        let value = json!({"service": "Echo", "args": [1, 2.5, "three", null, true]});
        let bytes = backend.encode(&value).unwrap();
        assert_eq!(backend.decode(&bytes).unwrap(), value);
    }
}
