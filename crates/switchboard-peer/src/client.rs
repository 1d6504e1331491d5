//! The client side: correlated requests and a notification stream.

use crate::connect::{self, ConnectOptions};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::constants::{DISCONNECT_ATTRIBUTE, MANAGER_SERVICE, SELF_SERVICE};
use switchboard_core::identity::client_identity;
use switchboard_core::message::Notification;
use switchboard_core::{message, Frame, JsonBackend, SwitchboardError, SwitchboardResult};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<SwitchboardResult<Value>>>>>;

/// A connected client.
///
/// Requests are correlated by uid; each call gets a fresh one. Service
/// notifications arrive on the channel returned by [`Client::notifications`].
pub struct Client {
    tx: mpsc::Sender<Vec<u8>>,
    backend: JsonBackend,
    local_addr: String,
    manager_identity: Value,
    pending: PendingMap,
    notifications: Option<mpsc::Receiver<Notification>>,
    uid_counter: AtomicU64,
    request_timeout: Option<Duration>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Connect and register with a manager under the default name.
    pub async fn connect(options: ConnectOptions) -> SwitchboardResult<Client> {
        Self::connect_as("Client", options).await
    }

    /// Connect and register with a manager under a display name.
    pub async fn connect_as(name: &str, options: ConnectOptions) -> SwitchboardResult<Client> {
        let identity = client_identity(name).to_value();
        let wire = connect::establish(&options, identity).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notif_tx, notif_rx) = mpsc::channel(64);

        let mut reader = wire.reader;
        let reader_pending = pending.clone();
        let backend = wire.backend;
        let reader_task = tokio::spawn(async move {
            loop {
                let payload = match reader.next_payload().await {
                    Ok(Some(payload)) => payload,
                    _ => break,
                };
                let Ok(value) = backend.decode(&payload) else {
                    debug!("undecodable frame from manager, dropped");
                    continue;
                };
                let Ok(frame) = Frame::classify(value) else {
                    debug!("unclassifiable frame from manager, dropped");
                    continue;
                };
                match frame {
                    Frame::Reply(reply) => {
                        if let Some(waiter) = reader_pending.lock().await.remove(&reply.uid) {
                            let _ = waiter.send(Ok(reply.result));
                        } else {
                            debug!(uid = %reply.uid, "reply with no waiter, dropped");
                        }
                    }
                    Frame::Error(error) => {
                        if let Some(waiter) = reader_pending.lock().await.remove(&error.uid) {
                            let _ = waiter.send(Err(SwitchboardError::Remote(error.message)));
                        } else {
                            debug!(uid = %error.uid, message = %error.message, "unsolicited error frame");
                        }
                    }
                    Frame::Notification(notification) => {
                        // Dropped only if the receiver is gone or far behind.
                        let _ = notif_tx.try_send(notification);
                    }
                    Frame::Request(request) => {
                        debug!(attribute = %request.attribute, "unexpected request from manager");
                    }
                }
            }
            // Connection gone: fail everything still waiting.
            for (_, waiter) in reader_pending.lock().await.drain() {
                let _ = waiter.send(Err(SwitchboardError::ConnectionClosed));
            }
        });

        Ok(Client {
            tx: wire.tx,
            backend,
            local_addr: wire.local_addr,
            manager_identity: wire.manager_identity,
            pending,
            notifications: Some(notif_rx),
            uid_counter: AtomicU64::new(1),
            request_timeout: None,
            reader_task,
        })
    }

    /// Our address as the manager sees us (`host:port`).
    pub fn address(&self) -> &str {
        &self.local_addr
    }

    /// The manager identity captured during the handshake.
    pub fn manager_identity(&self) -> &Value {
        &self.manager_identity
    }

    /// Set a deadline applied to every subsequent request.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.request_timeout = timeout;
    }

    /// Take the notification stream. Yields every notification emitted by
    /// services this client is linked with.
    pub fn notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications.take()
    }

    /// Send a request to a linked service and await the correlated result.
    pub async fn request(
        &self,
        service: &str,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> SwitchboardResult<Value> {
        let uid = self.uid_counter.fetch_add(1, Ordering::Relaxed).to_string();
        self.request_with_uid(service, attribute, args, kwargs, &uid)
            .await
    }

    /// Send a request with a caller-chosen uid.
    pub async fn request_with_uid(
        &self,
        service: &str,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        uid: &str,
    ) -> SwitchboardResult<Value> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.lock().await.insert(uid.to_string(), waiter_tx);

        let frame = message::request(service, attribute, &args, &kwargs, uid);
        if let Err(e) = self.send(&frame).await {
            self.pending.lock().await.remove(uid);
            return Err(e);
        }

        let outcome = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, waiter_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().await.remove(uid);
                    // Tell the manager to forget the request; a late reply
                    // will be dropped.
                    let _ = self
                        .manager_request_fire("cancel", vec![Value::String(uid.to_string())])
                        .await;
                    return Err(SwitchboardError::Timeout);
                }
            },
            None => waiter_rx.await,
        };
        outcome.map_err(|_| SwitchboardError::ConnectionClosed)?
    }

    /// Call an attribute of the manager itself.
    pub async fn manager_request(
        &self,
        attribute: &str,
        args: Vec<Value>,
    ) -> SwitchboardResult<Value> {
        self.request(MANAGER_SERVICE, attribute, args, Map::new())
            .await
    }

    /// Link with a service; returns the service identity.
    pub async fn link(&self, service: &str) -> SwitchboardResult<Value> {
        self.manager_request("link", vec![Value::String(service.into())])
            .await
    }

    /// Unlink from a service.
    pub async fn unlink(&self, service: &str) -> SwitchboardResult<()> {
        self.manager_request("unlink", vec![Value::String(service.into())])
            .await
            .map(|_| ())
    }

    /// Acquire a lock (`"shared"` or `"exclusive"`) on a linked service.
    pub async fn lock(&self, service: &str, mode: &str) -> SwitchboardResult<()> {
        self.manager_request(
            "lock",
            vec![Value::String(service.into()), Value::String(mode.into())],
        )
        .await
        .map(|_| ())
    }

    /// Release a lock on a linked service.
    pub async fn unlock(&self, service: &str) -> SwitchboardResult<()> {
        self.manager_request("unlock", vec![Value::String(service.into())])
            .await
            .map(|_| ())
    }

    /// Ask the manager to shut down (requires an admin login).
    pub async fn shutdown_manager(&self) -> SwitchboardResult<()> {
        self.manager_request("shutdown_manager", vec![])
            .await
            .map(|_| ())
    }

    /// Forcibly disconnect another peer (requires an admin login).
    pub async fn kick(&self, address: &str) -> SwitchboardResult<()> {
        self.manager_request("kick", vec![Value::String(address.into())])
            .await
            .map(|_| ())
    }

    /// Close the session cleanly.
    pub async fn disconnect(self) {
        let frame = message::request(
            SELF_SERVICE,
            DISCONNECT_ATTRIBUTE,
            &[],
            &Map::new(),
            "",
        );
        let _ = self.send(&frame).await;
        self.reader_task.abort();
    }

    /// A manager call whose reply nobody waits for.
    async fn manager_request_fire(&self, attribute: &str, args: Vec<Value>) -> SwitchboardResult<()> {
        let uid = self.uid_counter.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = message::request(MANAGER_SERVICE, attribute, &args, &Map::new(), &uid);
        self.send(&frame).await
    }

    async fn send(&self, value: &Value) -> SwitchboardResult<()> {
        let frame = switchboard_core::encode_frame(self.backend, value)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| SwitchboardError::ConnectionClosed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
