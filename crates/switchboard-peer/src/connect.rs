//! Connection establishment and the peer side of the handshake.
//!
//! Dials the manager (optionally through TLS), answers the identity
//! prompt and any login prompts, then probes the manager with an identity
//! request to confirm the session is registered before handing the wire
//! over to the client or service loop.

use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::constants::{DEFAULT_READ_LIMIT, HANDSHAKE_TIMEOUT, MANAGER_SERVICE, PORT};
use switchboard_core::{
    encode_frame, message, Frame, FrameDecoder, JsonBackend, SwitchboardError, SwitchboardResult,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::debug;

const HANDSHAKE_PROBE_UID: &str = "__handshake__";

/// How to reach and authenticate with a manager.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Connect over plain TCP (the manager must also have TLS disabled).
    pub disable_tls: bool,
    /// PEM file holding the manager certificate to trust (required for TLS).
    pub cert_file: Option<PathBuf>,
    /// Client certificate to present, for certificate authentication.
    pub client_cert_file: Option<PathBuf>,
    /// Private key matching `client_cert_file`.
    pub client_key_file: Option<PathBuf>,
    /// Credentials for managers running login authentication.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Handshake deadline.
    pub timeout: Duration,
    /// Per-connection frame size limit.
    pub read_limit: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: PORT,
            disable_tls: false,
            cert_file: None,
            client_cert_file: None,
            client_key_file: None,
            username: None,
            password: None,
            timeout: HANDSHAKE_TIMEOUT,
            read_limit: DEFAULT_READ_LIMIT,
        }
    }
}

impl ConnectOptions {
    /// Plain-TCP options for a manager started with TLS disabled.
    pub fn insecure(host: &str, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            disable_tls: true,
            ..Default::default()
        }
    }

    /// Attach login credentials.
    pub fn with_login(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Buffered frame reader over the receive half of a connection.
pub(crate) struct FrameReader {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    decoder: FrameDecoder,
    queue: VecDeque<Vec<u8>>,
}

impl FrameReader {
    fn new(reader: Box<dyn AsyncRead + Send + Unpin>, read_limit: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::with_limit(read_limit),
            queue: VecDeque::new(),
        }
    }

    pub(crate) async fn next_payload(&mut self) -> SwitchboardResult<Option<Vec<u8>>> {
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

/// An established, registered connection to a manager.
pub(crate) struct Wire {
    pub(crate) reader: FrameReader,
    pub(crate) tx: mpsc::Sender<Vec<u8>>,
    pub(crate) backend: JsonBackend,
    /// Our address as the manager sees it.
    pub(crate) local_addr: String,
    pub(crate) manager_identity: Value,
}

async fn send_on(
    tx: &mpsc::Sender<Vec<u8>>,
    backend: JsonBackend,
    value: &Value,
) -> SwitchboardResult<()> {
    let frame = encode_frame(backend, value)?;
    tx.send(frame)
        .await
        .map_err(|_| SwitchboardError::ConnectionClosed)
}

/// Dial the manager and complete the handshake with `identity`.
pub(crate) async fn establish(
    options: &ConnectOptions,
    identity: Value,
) -> SwitchboardResult<Wire> {
    let backend = JsonBackend::from_env()?;
    let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
    let _ = stream.set_nodelay(true);
    let local_addr = stream.local_addr()?.to_string();

    let (reader, writer): (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    ) = if options.disable_tls {
        let (r, w) = tokio::io::split(stream);
        (Box::new(r), Box::new(w))
    } else {
        let connector = tls_connector(options)?;
        let server_name = rustls::pki_types::ServerName::try_from(options.host.clone())
            .map_err(|e| SwitchboardError::Config(format!("invalid host name: {e}")))?;
        let tls = connector.connect(server_name, stream).await?;
        let (r, w) = tokio::io::split(tls);
        (Box::new(r), Box::new(w))
    };

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    tokio::spawn(write_loop(writer, rx));
    let mut reader = FrameReader::new(reader, options.read_limit);

    let manager_identity = tokio::time::timeout(
        options.timeout,
        handshake(&mut reader, &tx, backend, options, identity),
    )
    .await
    .map_err(|_| SwitchboardError::Timeout)??;

    Ok(Wire {
        reader,
        tx,
        backend,
        local_addr,
        manager_identity,
    })
}

async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
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

/// Answer the manager's prompts until the session is registered.
async fn handshake(
    reader: &mut FrameReader,
    tx: &mpsc::Sender<Vec<u8>>,
    backend: JsonBackend,
    options: &ConnectOptions,
    identity: Value,
) -> SwitchboardResult<Value> {
    let expecting_login = options.username.is_some();
    let mut identified = false;
    let mut probed = false;

    loop {
        // Once identified, a manager without login auth sends nothing more;
        // give its prompts a moment, then probe to confirm registration.
        let payload = if identified && !probed {
            match tokio::time::timeout(Duration::from_secs(1), reader.next_payload()).await {
                Ok(result) => result?.ok_or(SwitchboardError::ConnectionClosed)?,
                Err(_) => {
                    probe(tx, backend).await?;
                    probed = true;
                    continue;
                }
            }
        } else {
            reader
                .next_payload()
                .await?
                .ok_or(SwitchboardError::ConnectionClosed)?
        };

        let value = backend.decode(&payload)?;
        match Frame::classify(value)? {
            Frame::Request(request) => match request.attribute.as_str() {
                "identity" => {
                    send_on(tx, backend, &message::reply(identity.clone(), "", "")).await?;
                    identified = true;
                    if !expecting_login && !probed {
                        probe(tx, backend).await?;
                        probed = true;
                    }
                }
                "username" => {
                    let username = options.username.clone().ok_or_else(|| {
                        SwitchboardError::Auth(
                            "the manager requires a login but no username was configured".into(),
                        )
                    })?;
                    send_on(tx, backend, &message::reply(Value::String(username), "", "")).await?;
                }
                "password" => {
                    let password = options.password.clone().ok_or_else(|| {
                        SwitchboardError::Auth(
                            "the manager requires a login but no password was configured".into(),
                        )
                    })?;
                    send_on(tx, backend, &message::reply(Value::String(password), "", "")).await?;
                    if !probed {
                        probe(tx, backend).await?;
                        probed = true;
                    }
                }
                other => {
                    debug!(attribute = %other, "unexpected handshake prompt ignored");
                }
            },
            Frame::Reply(reply) if reply.uid == HANDSHAKE_PROBE_UID => {
                return Ok(reply.result);
            }
            Frame::Error(error) => {
                return Err(SwitchboardError::Auth(error.message));
            }
            other => {
                debug!(?other, "unexpected handshake frame ignored");
            }
        }
    }
}

/// The registration probe: a manager identity request that only a ready
/// session will have answered.
async fn probe(tx: &mpsc::Sender<Vec<u8>>, backend: JsonBackend) -> SwitchboardResult<()> {
    send_on(
        tx,
        backend,
        &message::request(
            MANAGER_SERVICE,
            "identity",
            &[],
            &serde_json::Map::new(),
            HANDSHAKE_PROBE_UID,
        ),
    )
    .await
}

fn tls_connector(options: &ConnectOptions) -> SwitchboardResult<TlsConnector> {
    let cert_file = options.cert_file.as_ref().ok_or_else(|| {
        SwitchboardError::Config(
            "connecting with TLS requires cert_file (the manager certificate to trust)".into(),
        )
    })?;
    let pem = std::fs::read(cert_file)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert
            .map_err(|e| SwitchboardError::Config(format!("cannot parse certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| SwitchboardError::Config(format!("cannot trust certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match (&options.client_cert_file, &options.client_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path)?;
            let certs = rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    SwitchboardError::Config(format!("cannot parse client certificate: {e}"))
                })?;
            let key_pem = std::fs::read(key_path)?;
            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .map_err(|e| SwitchboardError::Config(format!("cannot parse client key: {e}")))?
                .ok_or_else(|| {
                    SwitchboardError::Config(format!("no key found in {}", key_path.display()))
                })?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| SwitchboardError::Config(format!("client auth setup failed: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}
