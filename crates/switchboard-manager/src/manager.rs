//! The manager lifecycle: bind, accept, drain, stop.
//!
//! `starting` binds the socket, loads or creates the TLS credentials and
//! opens the credential store. `running` accepts connections, one session
//! task per socket. A signal or an admin `shutdown_manager` call moves the
//! manager to `draining`: no new connections, in-flight requests get a
//! bounded grace period to settle, then every session is closed.

use crate::config::{local_hostname, AuthPolicy, ManagerConfig};
use crate::links::LinkTable;
use crate::pending::PendingTable;
use crate::router::manager_attribute_table;
use crate::session::{self, Registry};
use crate::store::Store;
use crate::tls;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_core::identity::{language, os, Identity};
use switchboard_core::{JsonBackend, SwitchboardResult};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Lifecycle states of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// State shared by every session task.
pub struct Shared {
    pub config: ManagerConfig,
    /// `hostname:port` identity of this manager on the network.
    pub network_id: String,
    pub port: u16,
    pub backend: JsonBackend,
    pub store: Arc<Store>,
    pub registry: Registry,
    pub links: LinkTable,
    pub pending: PendingTable,
    pub shutdown: broadcast::Sender<()>,
    state: RwLock<Lifecycle>,
}

impl Shared {
    pub async fn state(&self) -> Lifecycle {
        *self.state.read().await
    }

    pub async fn is_draining(&self) -> bool {
        matches!(*self.state.read().await, Lifecycle::Draining | Lifecycle::Stopped)
    }

    async fn set_state(&self, state: Lifecycle) {
        *self.state.write().await = state;
        debug!(?state, "lifecycle transition");
    }

    /// The manager's own identity object, including live snapshots of the
    /// connected clients and the service directory.
    pub async fn manager_identity(&self) -> Value {
        let identity = Identity::Manager {
            hostname: local_hostname(),
            port: self.port,
            language: language(),
            os: os(),
            attributes: manager_attribute_table(),
        };
        let mut value = identity.to_value();
        if let Some(map) = value.as_object_mut() {
            map.insert("clients".into(), self.registry.clients_snapshot().await);
            map.insert("services".into(), self.links.snapshot().await);
        }
        value
    }

    /// Append to the connections audit log without blocking the loop.
    pub fn audit(&self, address: &str, name: &str, message: &str) {
        let store = self.store.clone();
        let address = address.to_string();
        let name = name.to_string();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.log_connection(&address, &name, &message) {
                debug!(error = %e, "audit log write failed");
            }
        });
    }
}

/// A bound, not-yet-running manager.
pub struct Manager {
    shared: Arc<Shared>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

/// Used to stop a manager from outside (tests, embedding applications).
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<Shared>,
}

impl ManagerHandle {
    /// Trigger the draining sequence.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(());
    }

    pub async fn state(&self) -> Lifecycle {
        self.shared.state().await
    }

    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.len().await
    }
}

impl Manager {
    /// Bind the listener and prepare all shared state (`starting`).
    pub async fn bind(config: ManagerConfig) -> SwitchboardResult<Manager> {
        config.validate()?;
        let backend = JsonBackend::from_env()?;

        let store = Arc::new(Store::open(&config.database)?);
        info!(path = %store.path(), "credential store loaded");

        let acceptor = if config.disable_tls {
            warn!("TLS is disabled, peers connect over plain TCP");
            None
        } else {
            let capture = config.auth == AuthPolicy::Certificate;
            Some(tls::build_acceptor(&config, capture)?)
        };

        let bind_host = config.host.clone().unwrap_or_else(|| "0.0.0.0".into());
        let listener = TcpListener::bind((bind_host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let network_id = format!("{}:{}", local_hostname(), port);

        let (shutdown, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            config,
            network_id,
            port,
            backend,
            store,
            registry: Registry::new(),
            links: LinkTable::new(),
            pending: PendingTable::new(),
            shutdown,
            state: RwLock::new(Lifecycle::Starting),
        });

        info!(
            addr = %listener.local_addr()?,
            tls = acceptor.is_some(),
            auth = ?shared.config.auth,
            "manager listening"
        );
        Ok(Manager {
            shared,
            listener,
            acceptor,
        })
    }

    /// Address the manager is listening on.
    pub fn local_addr(&self) -> SwitchboardResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle for stopping the manager from elsewhere.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until a shutdown is requested, then drain.
    pub async fn run(self) -> SwitchboardResult<()> {
        let Manager {
            shared,
            listener,
            acceptor,
        } = self;
        shared.set_state(Lifecycle::Running).await;

        let mut sessions = JoinSet::new();
        let mut shutdown_rx = shared.shutdown.subscribe();
        let signals = shutdown_signal();
        tokio::pin!(signals);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(session::run(
                            shared.clone(),
                            stream,
                            peer,
                            acceptor.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
                _ = &mut signals => {
                    info!("shutdown signal received");
                    break;
                }
                // Reap finished session tasks as they complete.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        drop(listener);

        // Draining: let in-flight requests settle, then close everything.
        shared.set_state(Lifecycle::Draining).await;
        let deadline = Instant::now() + shared.config.shutdown_grace;
        while !shared.pending.is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let unsettled = shared.pending.len().await;
        if unsettled > 0 {
            warn!(unsettled, "closing with requests still in flight");
        }

        shared.registry.close_all().await;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_secs(5), sessions.join_next()).await
        {}
        sessions.abort_all();

        shared.set_state(Lifecycle::Stopped).await;
        shared.audit(&shared.network_id, "Manager", "stopped");
        info!("manager stopped");
        Ok(())
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
