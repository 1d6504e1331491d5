//! Helpers shared by the integration tests: a manager on an ephemeral
//! port with TLS disabled, plus connection options pointing at it.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use switchboard_manager::manager::ManagerHandle;
use switchboard_manager::{AuthPolicy, Manager, ManagerConfig};
use switchboard_peer::ConnectOptions;

pub struct TestManager {
    pub addr: SocketAddr,
    pub handle: ManagerHandle,
    pub task: tokio::task::JoinHandle<switchboard_core::SwitchboardResult<()>>,
}

pub async fn start_manager(auth: AuthPolicy, database: PathBuf) -> TestManager {
    let config = ManagerConfig {
        host: Some("127.0.0.1".into()),
        port: 0,
        disable_tls: true,
        auth,
        database,
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    };
    let manager = Manager::bind(config).await.expect("bind manager");
    let addr = manager.local_addr().expect("local addr");
    let handle = manager.handle();
    let task = tokio::spawn(manager.run());
    TestManager { addr, handle, task }
}

pub async fn start_default_manager() -> TestManager {
    start_manager(AuthPolicy::None, PathBuf::from(":memory:")).await
}

pub fn options(addr: SocketAddr) -> ConnectOptions {
    ConnectOptions::insecure("127.0.0.1", addr.port())
}
