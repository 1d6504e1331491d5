//! The service side: a registry of named handlers behind a manager.
//!
//! A service advertises an attribute table (`name → signature`) in its
//! identity and answers forwarded requests by running the matching
//! handler. The manager never introspects the service; it only forwards
//! JSON and routes the correlated reply back.

use crate::connect::{self, ConnectOptions};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use switchboard_core::identity::{service_identity, UNBOUNDED_CLIENTS};
use switchboard_core::message::Request;
use switchboard_core::{message, Frame, JsonBackend, SwitchboardError, SwitchboardResult};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

/// A request handler: positional args + keyword args in, result out.
///
/// A returned `Err` travels back to the requester as an error frame.
pub type Handler =
    Arc<dyn Fn(&[Value], &Map<String, Value>) -> Result<Value, String> + Send + Sync>;

/// Builds a service: a name, an optional client cap, and named handlers.
pub struct ServiceBuilder {
    name: String,
    max_clients: i64,
    attributes: BTreeMap<String, (String, Handler)>,
}

impl ServiceBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_clients: UNBOUNDED_CLIENTS,
            attributes: BTreeMap::new(),
        }
    }

    /// Cap how many clients may be linked at once (-1 for unbounded).
    pub fn max_clients(mut self, max_clients: i64) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Register a handler under `name`, advertised with `signature`.
    pub fn attribute<F>(mut self, name: &str, signature: &str, handler: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.attributes
            .insert(name.to_string(), (signature.to_string(), Arc::new(handler)));
        self
    }

    /// Connect to the manager, register, and start serving requests.
    pub async fn serve(self, options: ConnectOptions) -> SwitchboardResult<RunningService> {
        let signatures: BTreeMap<String, String> = self
            .attributes
            .iter()
            .map(|(name, (signature, _))| (name.clone(), signature.clone()))
            .collect();
        let identity = service_identity(&self.name, signatures, self.max_clients).to_value();
        let wire = connect::establish(&options, identity.clone()).await?;

        let shutdown = Arc::new(Notify::new());
        let name = self.name.clone();
        let task = tokio::spawn(serve_loop(
            wire.reader,
            wire.tx.clone(),
            wire.backend,
            identity,
            self.attributes,
            name.clone(),
            shutdown.clone(),
        ));
        info!(service = %name, "service registered with the manager");

        Ok(RunningService {
            name,
            tx: wire.tx,
            backend: wire.backend,
            shutdown,
            task,
        })
    }
}

/// A service that is connected and serving.
pub struct RunningService {
    name: String,
    tx: mpsc::Sender<Vec<u8>>,
    backend: JsonBackend,
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl RunningService {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broadcast a notification to every client linked with this service.
    pub async fn emit(&self, result: Value) -> SwitchboardResult<()> {
        let frame = message::notification(&self.name, result);
        let encoded = switchboard_core::encode_frame(self.backend, &frame)?;
        self.tx
            .send(encoded)
            .await
            .map_err(|_| SwitchboardError::ConnectionClosed)
    }

    /// Stop serving and drop the connection.
    ///
    /// In-flight work is abandoned; the manager resolves anything still
    /// pending toward this service with service-gone errors.
    pub async fn shutdown(self) {
        let RunningService {
            tx,
            shutdown,
            mut task,
            ..
        } = self;
        shutdown.notify_one();
        if tokio::time::timeout(std::time::Duration::from_millis(500), &mut task)
            .await
            .is_err()
        {
            // A handler may be mid-request; don't wait it out.
            task.abort();
            let _ = tokio::time::timeout(std::time::Duration::from_millis(500), task).await;
        }
        drop(tx);
    }
}

async fn serve_loop(
    mut reader: connect::FrameReader,
    tx: mpsc::Sender<Vec<u8>>,
    backend: JsonBackend,
    identity: Value,
    attributes: BTreeMap<String, (String, Handler)>,
    name: String,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!(service = %name, "shutdown requested");
                return;
            }
            next = reader.next_payload() => {
                let payload = match next {
                    Ok(Some(payload)) => payload,
                    _ => {
                        debug!(service = %name, "connection to the manager ended");
                        return;
                    }
                };
                let Ok(value) = backend.decode(&payload) else { continue };
                let Ok(frame) = Frame::classify(value) else { continue };
                if let Frame::Request(request) = frame {
                    let reply = answer(&identity, &attributes, &name, &request);
                    let Ok(encoded) = switchboard_core::encode_frame(backend, &reply) else {
                        continue;
                    };
                    if tx.send(encoded).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Run the handler for one forwarded request and build the reply frame.
fn answer(
    identity: &Value,
    attributes: &BTreeMap<String, (String, Handler)>,
    name: &str,
    request: &Request,
) -> Value {
    if request.attribute == "identity" {
        return message::reply(identity.clone(), &request.requester, &request.uid);
    }
    match attributes.get(&request.attribute) {
        Some((_, handler)) => match handler(&request.args, &request.kwargs) {
            Ok(result) => message::reply(result, &request.requester, &request.uid),
            Err(e) => message::error_frame_with_traceback(
                &e,
                vec![format!("in {}.{}", name, request.attribute)],
                &request.requester,
                &request.uid,
            ),
        },
        None => message::error_frame_with_traceback(
            &format!(
                "the {name:?} service does not have a {:?} attribute",
                request.attribute
            ),
            Vec::new(),
            &request.requester,
            &request.uid,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(attribute: &str, args: Vec<Value>) -> Request {
        Request {
            service: "Echo".into(),
            attribute: attribute.into(),
            args,
            kwargs: Map::new(),
            uid: "u1".into(),
            requester: "10.0.0.1:5000".into(),
        }
    }

    fn echo_attributes() -> BTreeMap<String, (String, Handler)> {
        let mut attributes: BTreeMap<String, (String, Handler)> = BTreeMap::new();
        attributes.insert(
            "echo".into(),
            (
                "(*args, **kwargs) -> [args, kwargs]".into(),
                Arc::new(|args: &[Value], kwargs: &Map<String, Value>| {
                    Ok(json!([args, kwargs]))
                }),
            ),
        );
        attributes
    }

    #[test]
    fn answer_runs_the_handler() {
        let identity = json!({"type": "service", "name": "Echo"});
        let reply = answer(
            &identity,
            &echo_attributes(),
            "Echo",
            &request("echo", vec![json!("hello")]),
        );
        assert_eq!(reply["error"], false);
        assert_eq!(reply["result"], json!([["hello"], {}]));
        assert_eq!(reply["requester"], "10.0.0.1:5000");
        assert_eq!(reply["uid"], "u1");
    }

    #[test]
    fn answer_reports_unknown_attributes() {
        let identity = json!({"type": "service", "name": "Echo"});
        let reply = answer(
            &identity,
            &echo_attributes(),
            "Echo",
            &request("missing", vec![]),
        );
        assert_eq!(reply["error"], true);
        assert!(reply["message"].as_str().unwrap().contains("missing"));
        assert_eq!(reply["uid"], "u1");
    }

    #[test]
    fn answer_converts_handler_errors() {
        let mut attributes = echo_attributes();
        attributes.insert(
            "fail".into(),
            (
                "() -> never".into(),
                Arc::new(|_: &[Value], _: &Map<String, Value>| Err("arithmetic overflow".into())),
            ),
        );
        let identity = json!({"type": "service", "name": "Echo"});
        let reply = answer(&identity, &attributes, "Echo", &request("fail", vec![]));
        assert_eq!(reply["error"], true);
        assert_eq!(reply["message"], "arithmetic overflow");
        assert_eq!(reply["result"], Value::Null);
        assert!(reply["traceback"][0].as_str().unwrap().contains("Echo.fail"));
    }
}
