//! The five wire message shapes.
//!
//! Messages are plain JSON objects distinguished by shape, not by an
//! envelope tag:
//!
//! - request: `{error:false, service, attribute, args, kwargs, uid}`
//! - reply: `{error:false, result, requester, uid}`
//! - error: `{error:true, message, traceback, result:null, requester, uid}`
//! - notification: `{error:false, service, result, uid:"notification"}`
//! - handshake reply: `{result:<identity>}` (only seen while identifying)

use crate::constants::NOTIFICATION_UID;
use crate::error::{SwitchboardError, SwitchboardResult};
use serde_json::{json, Map, Value};

/// A request from a client (or the manager, during the handshake).
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub service: String,
    pub attribute: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub uid: String,
    /// Address of the originating client; empty until the manager stamps
    /// it while forwarding.
    pub requester: String,
}

/// A successful result travelling back to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub result: Value,
    pub requester: String,
    pub uid: String,
}

/// An error travelling back to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub message: String,
    pub traceback: Vec<String>,
    pub requester: String,
    pub uid: String,
}

/// A broadcast from a service to every client linked with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub service: String,
    pub result: Value,
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Reply(Reply),
    Error(ErrorFrame),
    Notification(Notification),
}

impl Frame {
    /// Classify a decoded JSON value by its shape.
    ///
    /// Precedence: error flag, then the reserved notification uid, then
    /// reply (`result` + `requester`), then request (`service` +
    /// `attribute`). Anything else is a protocol error.
    pub fn classify(value: Value) -> SwitchboardResult<Frame> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(SwitchboardError::Protocol(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };

        let is_error = map.get("error").and_then(Value::as_bool).unwrap_or(false);
        if is_error {
            return Ok(Frame::Error(ErrorFrame {
                message: str_field(&map, "message").unwrap_or_default(),
                traceback: map
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                requester: str_field(&map, "requester").unwrap_or_default(),
                uid: str_field(&map, "uid").unwrap_or_default(),
            }));
        }

        let uid = str_field(&map, "uid");
        if uid.as_deref() == Some(NOTIFICATION_UID) {
            if let Some(service) = str_field(&map, "service") {
                return Ok(Frame::Notification(Notification {
                    service,
                    result: map.get("result").cloned().unwrap_or(Value::Null),
                }));
            }
            return Err(SwitchboardError::Protocol(
                "notification frame is missing the service field".into(),
            ));
        }

        if map.contains_key("result") && map.contains_key("requester") {
            return Ok(Frame::Reply(Reply {
                result: map.get("result").cloned().unwrap_or(Value::Null),
                requester: str_field(&map, "requester").unwrap_or_default(),
                uid: uid.unwrap_or_default(),
            }));
        }

        // The service field may be absent on the prompts a manager sends
        // while handshaking (identity / username / password).
        if map.contains_key("attribute") {
            return Ok(Frame::Request(Request {
                service: str_field(&map, "service").unwrap_or_default(),
                attribute: str_field(&map, "attribute").unwrap_or_default(),
                args: map
                    .get("args")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                kwargs: map
                    .get("kwargs")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                uid: uid.unwrap_or_default(),
                requester: str_field(&map, "requester").unwrap_or_default(),
            }));
        }

        Err(SwitchboardError::Protocol(format!(
            "unrecognized message shape with keys [{}]",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        )))
    }

    /// Serialize this frame back to its wire shape.
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Request(r) => request(&r.service, &r.attribute, &r.args, &r.kwargs, &r.uid),
            Frame::Reply(r) => reply(r.result.clone(), &r.requester, &r.uid),
            Frame::Error(e) => json!({
                "error": true,
                "message": e.message,
                "traceback": e.traceback,
                "result": Value::Null,
                "requester": e.requester,
                "uid": e.uid,
            }),
            Frame::Notification(n) => notification(&n.service, n.result.clone()),
        }
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Build a request frame.
pub fn request(
    service: &str,
    attribute: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    uid: &str,
) -> Value {
    json!({
        "error": false,
        "service": service,
        "attribute": attribute,
        "args": args,
        "kwargs": kwargs,
        "uid": uid,
    })
}

/// Build the request the manager sends while handshaking: it carries no
/// target service, only the attribute being prompted for.
pub fn handshake_request(attribute: &str, requester: &str) -> Value {
    json!({
        "error": false,
        "attribute": attribute,
        "args": [],
        "kwargs": {},
        "requester": requester,
        "uid": "",
    })
}

/// Build a reply frame.
pub fn reply(result: Value, requester: &str, uid: &str) -> Value {
    json!({
        "error": false,
        "result": result,
        "requester": requester,
        "uid": uid,
    })
}

/// Build a notification frame.
pub fn notification(service: &str, result: Value) -> Value {
    json!({
        "error": false,
        "service": service,
        "result": result,
        "uid": NOTIFICATION_UID,
    })
}

/// Build an error frame from an error value.
pub fn error_frame(error: &SwitchboardError, requester: &str, uid: &str) -> Value {
    error_frame_with_traceback(&error.to_string(), Vec::new(), requester, uid)
}

/// Build an error frame with an explicit message and traceback lines.
pub fn error_frame_with_traceback(
    message: &str,
    traceback: Vec<String>,
    requester: &str,
    uid: &str,
) -> Value {
    json!({
        "error": true,
        "message": message,
        "traceback": traceback,
        "result": Value::Null,
        "requester": requester,
        "uid": uid,
    })
}
