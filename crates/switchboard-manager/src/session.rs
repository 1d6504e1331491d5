//! Per-connection peer sessions.
//!
//! Each accepted socket becomes one session: the handshake state machine
//! (TLS → identify → authenticate → register), a reader task that parses
//! frames and hands them to the router, and a writer task draining an
//! ordered outbound queue. FIFO in both directions per session follows
//! from this structure.

use crate::auth;
use crate::links::ServiceEntry;
use crate::manager::Shared;
use crate::router::{self, Disposition};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use switchboard_core::constants::MAX_LOGIN_ATTEMPTS;
use switchboard_core::identity::Identity;
use switchboard_core::terminal::parse_terminal_input;
use switchboard_core::{
    encode_frame, fingerprint, message, FrameDecoder, JsonBackend, SwitchboardError,
    SwitchboardResult,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// What a peer became after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A JSON client.
    Client,
    /// A client speaking the line-oriented terminal shortcut.
    Terminal,
    /// A registered service.
    Service,
}

/// A cheap, cloneable handle to a ready session.
///
/// Frames sent through the handle are queued on the session's writer task
/// in order; `close` asks the session to shut down.
#[derive(Clone)]
pub struct PeerHandle {
    pub address: String,
    pub name: String,
    pub role: Role,
    /// Escalated during handshake by logging in as an admin user.
    pub admin: bool,
    backend: JsonBackend,
    tx: mpsc::Sender<Vec<u8>>,
    closer: Arc<Notify>,
}

impl PeerHandle {
    /// Queue a frame for this peer. Returns false when the session is gone.
    pub async fn send(&self, value: &Value) -> bool {
        match encode_frame(self.backend, value) {
            Ok(frame) => self.tx.send(frame).await.is_ok(),
            Err(e) => {
                warn!(addr = %self.address, error = %e, "cannot encode outbound frame");
                false
            }
        }
    }

    /// Ask the owning session to close.
    pub fn close(&self) {
        self.closer.notify_one();
    }

    async fn closed(&self) {
        self.closer.notified().await
    }

    /// A handle with no live session behind it, for unit tests.
    pub fn detached(address: &str, name: &str, backend: JsonBackend) -> PeerHandle {
        let (tx, _rx) = mpsc::channel(1);
        PeerHandle {
            address: address.to_string(),
            name: name.to_string(),
            role: Role::Client,
            admin: false,
            backend,
            tx,
            closer: Arc::new(Notify::new()),
        }
    }
}

/// All ready peers, keyed by remote address.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, PeerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: PeerHandle) {
        self.inner.write().await.insert(handle.address.clone(), handle);
    }

    pub async fn remove(&self, address: &str) -> Option<PeerHandle> {
        self.inner.write().await.remove(address)
    }

    pub async fn get(&self, address: &str) -> Option<PeerHandle> {
        self.inner.read().await.get(address).cloned()
    }

    /// `address → name` of every connected client, for the identity object.
    pub async fn clients_snapshot(&self) -> Value {
        let inner = self.inner.read().await;
        let mut map = Map::new();
        for (address, handle) in inner.iter() {
            if handle.role != Role::Service {
                map.insert(address.clone(), Value::String(handle.name.clone()));
            }
        }
        Value::Object(map)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Ask every session to close.
    pub async fn close_all(&self) {
        for handle in self.inner.read().await.values() {
            handle.close();
        }
    }
}

/// Buffered frame reader over one half of a connection.
struct SessionIo {
    reader: BoxRead,
    decoder: FrameDecoder,
    queue: VecDeque<Vec<u8>>,
}

impl SessionIo {
    fn new(reader: BoxRead, read_limit: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::with_limit(read_limit),
            queue: VecDeque::new(),
        }
    }

    /// The next complete payload, or `None` at end of stream.
    async fn next_payload(&mut self) -> SwitchboardResult<Option<Vec<u8>>> {
        loop {
            if let Some(payload) = self.queue.pop_front() {
                return Ok(Some(payload));
            }
            let mut buf = [0u8; 8192];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            for payload in self.decoder.feed(&buf[..n])? {
                self.queue.push_back(payload);
            }
        }
    }
}

struct Registration {
    role: Role,
    name: String,
    identity: Value,
    max_clients: i64,
    admin: bool,
}

/// Drive one accepted connection from TLS handshake to close.
pub async fn run(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let address = peer.to_string();
    debug!(addr = %address, "new connection");
    let _ = stream.set_nodelay(true);

    let (reader, writer, peer_fingerprint) = match split_stream(stream, acceptor).await {
        Ok(parts) => parts,
        Err(e) => {
            info!(addr = %address, error = %e, "TLS handshake failed");
            shared.audit(&address, "", "rejected: tls handshake failed");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let mut io = SessionIo::new(reader, shared.config.read_limit);

    let registration = match tokio::time::timeout(
        shared.config.handshake_timeout,
        handshake(&shared, &mut io, &tx, &address, peer_fingerprint.as_deref()),
    )
    .await
    {
        Ok(Ok(registration)) => registration,
        Ok(Err(e)) => {
            info!(addr = %address, error = %e, "handshake failed");
            let _ = send_value(&shared, &tx, &message::error_frame(&e, &address, "")).await;
            shared.audit(&address, "", &format!("rejected: {e}"));
            drop(tx);
            let _ = writer_task.await;
            return;
        }
        Err(_) => {
            let e = SwitchboardError::Identity("the handshake did not complete in time".into());
            info!(addr = %address, "handshake timed out");
            let _ = send_value(&shared, &tx, &message::error_frame(&e, &address, "")).await;
            shared.audit(&address, "", "rejected: handshake timed out");
            drop(tx);
            let _ = writer_task.await;
            return;
        }
    };

    let handle = PeerHandle {
        address: address.clone(),
        name: registration.name.clone(),
        role: registration.role,
        admin: registration.admin,
        backend: shared.backend,
        tx: tx.clone(),
        closer: Arc::new(Notify::new()),
    };

    if registration.role == Role::Service {
        // The directory records where the service connected from so admins
        // can address it (e.g. for kick).
        let mut directory_identity = registration.identity.clone();
        if let Some(map) = directory_identity.as_object_mut() {
            map.insert("address".into(), Value::String(address.clone()));
        }
        let entry = ServiceEntry {
            name: registration.name.clone(),
            address: address.clone(),
            identity: directory_identity,
            max_clients: registration.max_clients,
            handle: handle.clone(),
        };
        if let Err(e) = shared.links.register_service(entry).await {
            info!(addr = %address, name = %registration.name, error = %e, "registration refused");
            let _ = send_value(&shared, &tx, &message::error_frame(&e, &address, "")).await;
            shared.audit(&address, &registration.name, "rejected: duplicate service name");
            drop(tx);
            let _ = writer_task.await;
            return;
        }
    }
    shared.registry.insert(handle.clone()).await;
    shared.audit(&address, &handle.name, "connected");
    info!(addr = %address, name = %handle.name, role = ?handle.role, "peer ready");

    if let Some(fatal) = ready_loop(&shared, &mut io, &handle).await {
        info!(addr = %address, error = %fatal, "session ended by protocol fault");
        let _ = handle
            .send(&message::error_frame(&fatal, &address, ""))
            .await;
    }

    cleanup(&shared, &handle).await;
    shared.audit(&address, &handle.name, "disconnected");
    info!(addr = %address, name = %handle.name, "peer disconnected");

    drop(handle);
    drop(tx);
    let _ = writer_task.await;
}

/// Complete the TLS handshake (when enabled) and split the stream.
///
/// Returns the reader, the writer, and the SHA-256 fingerprint of the peer
/// certificate when one was presented.
async fn split_stream(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
) -> SwitchboardResult<(BoxRead, BoxWrite, Option<String>)> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await?;
            let peer_fp = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| fingerprint(cert.as_ref()));
            let (reader, writer) = tokio::io::split(tls);
            Ok((Box::new(reader), Box::new(writer), peer_fp))
        }
        None => {
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer), None))
        }
    }
}

async fn write_loop(mut writer: BoxWrite, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn send_value(
    shared: &Shared,
    tx: &mpsc::Sender<Vec<u8>>,
    value: &Value,
) -> SwitchboardResult<()> {
    let frame = encode_frame(shared.backend, value)?;
    tx.send(frame)
        .await
        .map_err(|_| SwitchboardError::ConnectionClosed)
}

/// Identify and authenticate a connecting peer.
async fn handshake(
    shared: &Shared,
    io: &mut SessionIo,
    tx: &mpsc::Sender<Vec<u8>>,
    address: &str,
    peer_fingerprint: Option<&str>,
) -> SwitchboardResult<Registration> {
    send_value(
        shared,
        tx,
        &message::handshake_request("identity", &shared.network_id),
    )
    .await?;

    let payload = io
        .next_payload()
        .await?
        .ok_or(SwitchboardError::ConnectionClosed)?;

    let (identity_value, via_terminal) = match shared.backend.decode(&payload) {
        Ok(Value::Object(map)) => {
            let value = match map.get("result") {
                Some(result) => result.clone(),
                None => Value::Object(map),
            };
            (value, false)
        }
        Ok(other) => {
            return Err(SwitchboardError::Identity(format!(
                "invalid identity reply: {other}"
            )))
        }
        Err(_) => {
            let line = String::from_utf8_lossy(&payload);
            let parsed = parse_terminal_input(line.trim()).ok_or_else(|| {
                SwitchboardError::Identity(format!("cannot interpret {:?}", line.trim()))
            })?;
            (parsed, true)
        }
    };
    let identity = Identity::from_value(&identity_value)?;

    let mut admin = false;
    match shared.config.auth {
        crate::config::AuthPolicy::None => {}
        crate::config::AuthPolicy::Certificate => {
            auth::check_certificate(shared, peer_fingerprint).await?;
        }
        crate::config::AuthPolicy::Hostname => {
            auth::check_hostname(shared, address).await?;
        }
        crate::config::AuthPolicy::Login => {
            admin = login(shared, io, tx).await?;
        }
    }

    let registration = match &identity {
        Identity::Client { name, .. } => Registration {
            role: if via_terminal { Role::Terminal } else { Role::Client },
            name: name.clone(),
            identity: identity.to_value(),
            max_clients: -1,
            admin,
        },
        Identity::Service {
            name, max_clients, ..
        } => Registration {
            role: Role::Service,
            name: name.clone(),
            identity: identity.to_value(),
            max_clients: *max_clients,
            admin,
        },
        Identity::Manager { .. } => {
            return Err(SwitchboardError::Identity(
                "a manager cannot register with another manager".into(),
            ))
        }
    };
    Ok(registration)
}

/// The login exchange: prompt for username and password, up to three
/// attempts. Returns whether the authenticated user has admin rights.
async fn login(
    shared: &Shared,
    io: &mut SessionIo,
    tx: &mpsc::Sender<Vec<u8>>,
) -> SwitchboardResult<bool> {
    for attempt in 1..=MAX_LOGIN_ATTEMPTS {
        send_value(
            shared,
            tx,
            &message::handshake_request("username", &shared.network_id),
        )
        .await?;
        let username = read_result_string(shared, io).await?;

        send_value(
            shared,
            tx,
            &message::handshake_request("password", &shared.network_id),
        )
        .await?;
        let password = read_result_string(shared, io).await?;

        let store = shared.store.clone();
        let user = username.clone();
        let (valid, admin) = tokio::task::spawn_blocking(move || {
            let valid = store.is_password_valid(&user, &password)?;
            let admin = valid && store.is_admin(&user)?;
            Ok::<_, SwitchboardError>((valid, admin))
        })
        .await
        .map_err(|e| SwitchboardError::Database(e.to_string()))??;

        if valid {
            info!(username = %username, admin, "login accepted");
            return Ok(admin);
        }
        warn!(username = %username, attempt, "invalid credentials");
    }
    Err(SwitchboardError::Auth(
        "invalid username or password".into(),
    ))
}

/// Read a `{result: <string>}` handshake answer; raw terminal lines are
/// taken verbatim.
async fn read_result_string(shared: &Shared, io: &mut SessionIo) -> SwitchboardResult<String> {
    let payload = io
        .next_payload()
        .await?
        .ok_or(SwitchboardError::ConnectionClosed)?;
    match shared.backend.decode(&payload) {
        Ok(Value::Object(map)) => map
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SwitchboardError::Auth("expected a {result: string} reply".into())
            }),
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(SwitchboardError::Auth(format!(
            "expected a string reply, got {other}"
        ))),
        Err(_) => Ok(String::from_utf8_lossy(&payload).trim().to_string()),
    }
}

/// Normal operation: read, decode, route, until the peer leaves.
///
/// Returns the fault that ended the session, if it ended on one.
async fn ready_loop(
    shared: &Arc<Shared>,
    io: &mut SessionIo,
    handle: &PeerHandle,
) -> Option<SwitchboardError> {
    loop {
        tokio::select! {
            _ = handle.closed() => {
                debug!(addr = %handle.address, "close requested");
                return None;
            }
            next = io.next_payload() => {
                let payload = match next {
                    Ok(Some(payload)) => payload,
                    Ok(None) => return None,
                    Err(e) => return Some(e),
                };
                let value = match shared.backend.decode(&payload) {
                    Ok(value) => value,
                    Err(decode_err) => {
                        // Terminal sessions speak the line shortcut, so an
                        // undecodable line gets a parse attempt; for JSON
                        // peers it is a protocol fault.
                        let line = String::from_utf8_lossy(&payload);
                        let parsed = if handle.role == Role::Terminal {
                            parse_terminal_input(line.trim())
                        } else {
                            None
                        };
                        match parsed {
                            Some(value) => value,
                            None => {
                                let e = if handle.role == Role::Terminal {
                                    SwitchboardError::Remote(format!(
                                        "cannot interpret {:?}",
                                        line.trim()
                                    ))
                                } else {
                                    SwitchboardError::Protocol(format!(
                                        "invalid JSON: {decode_err}"
                                    ))
                                };
                                if e.is_fatal() {
                                    return Some(e);
                                }
                                handle
                                    .send(&message::error_frame(&e, &handle.address, ""))
                                    .await;
                                continue;
                            }
                        }
                    }
                };
                match router::route(shared, handle, value).await {
                    Ok(Disposition::Continue) => {}
                    Ok(Disposition::Disconnect) => return None,
                    Err(e) if e.is_fatal() => return Some(e),
                    Err(e) => {
                        handle
                            .send(&message::error_frame(&e, &handle.address, ""))
                            .await;
                    }
                }
            }
        }
    }
}

/// Purge every trace of a departed session before anything else routes.
async fn cleanup(shared: &Arc<Shared>, handle: &PeerHandle) {
    shared.registry.remove(&handle.address).await;
    shared.links.purge_client(&handle.address).await;

    // Requests this peer still had in flight settle with a synthetic
    // peer-disconnected error to the service that was processing them.
    let orphaned = shared.pending.purge_client(&handle.address).await;
    if !orphaned.is_empty() {
        debug!(
            addr = %handle.address,
            dropped = orphaned.len(),
            "dropped pending requests of departed client"
        );
    }
    for (uid, entry) in orphaned {
        if let Some(service) = shared.links.service_handle(&entry.service).await {
            let e = SwitchboardError::PeerDisconnected(handle.address.clone());
            service
                .send(&message::error_frame(&e, &handle.address, &uid))
                .await;
        }
    }

    if handle.role == Role::Service {
        if let Some((entry, linked)) = shared.links.unregister_service_at(&handle.address).await {
            let gone = message::notification(&entry.name, json!("service-gone"));
            for client_address in linked {
                if let Some(client) = shared.registry.get(&client_address).await {
                    client.send(&gone).await;
                }
            }
            for (uid, pending) in shared.pending.purge_service(&entry.name).await {
                let e = SwitchboardError::ServiceGone(entry.name.clone());
                pending
                    .client
                    .send(&message::error_frame(&e, &pending.client.address, &uid))
                    .await;
            }
        }
    }
}
