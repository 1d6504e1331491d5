//! The service directory and the client↔service link table.
//!
//! One table owns both concerns because every link operation must see a
//! consistent view of the directory: registrations, links, locks and caps
//! mutate under a single write lock, so racing requests serialize in
//! arrival order and the loser gets a precise error.

use crate::session::PeerHandle;
use serde_json::{Map, Value};
use std::collections::HashMap;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Lock a client holds on a service it is linked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn parse(s: &str) -> SwitchboardResult<LockMode> {
        match s.to_ascii_lowercase().as_str() {
            "shared" => Ok(LockMode::Shared),
            "exclusive" => Ok(LockMode::Exclusive),
            other => Err(SwitchboardError::Remote(format!(
                "unknown lock mode {other:?}, must be \"shared\" or \"exclusive\""
            ))),
        }
    }
}

/// A registered, ready service.
pub struct ServiceEntry {
    pub name: String,
    pub address: String,
    pub identity: Value,
    pub max_clients: i64,
    pub handle: PeerHandle,
}

#[derive(Default)]
struct LinkInner {
    services: HashMap<String, ServiceEntry>,
    /// service name → (client address → lock the client holds)
    links: HashMap<String, HashMap<String, LockMode>>,
}

/// The shared link table.
#[derive(Default)]
pub struct LinkTable {
    inner: RwLock<LinkInner>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready service; duplicate names are rejected.
    pub async fn register_service(&self, entry: ServiceEntry) -> SwitchboardResult<()> {
        let mut inner = self.inner.write().await;
        if inner.services.contains_key(&entry.name) {
            return Err(SwitchboardError::Identity(format!(
                "a service named {:?} is already running on the manager",
                entry.name
            )));
        }
        info!(service = %entry.name, addr = %entry.address, "service registered");
        inner.links.entry(entry.name.clone()).or_default();
        inner.services.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Remove the service registered from `address`.
    ///
    /// Returns the entry and the clients that were linked with it so the
    /// caller can run the death cascade (notifications + pending errors).
    pub async fn unregister_service_at(
        &self,
        address: &str,
    ) -> Option<(ServiceEntry, Vec<String>)> {
        let mut inner = self.inner.write().await;
        let name = inner
            .services
            .iter()
            .find(|(_, entry)| entry.address == address)
            .map(|(name, _)| name.clone())?;
        let entry = inner.services.remove(&name)?;
        let linked = inner
            .links
            .remove(&name)
            .map(|clients| clients.into_keys().collect())
            .unwrap_or_default();
        info!(service = %name, "service unregistered");
        Some((entry, linked))
    }

    /// Link a client with a service, returning the service identity.
    pub async fn link(&self, client: &str, service: &str) -> SwitchboardResult<Value> {
        let mut inner = self.inner.write().await;
        let max_clients = match inner.services.get(service) {
            Some(entry) => entry.max_clients,
            None => return Err(SwitchboardError::NoSuchService(service.to_string())),
        };
        let links = inner.links.entry(service.to_string()).or_default();

        if links
            .iter()
            .any(|(addr, mode)| addr != client && *mode == LockMode::Exclusive)
        {
            return Err(SwitchboardError::LockedExclusive(service.to_string()));
        }
        if !links.contains_key(client) {
            let count = links.len() as i64;
            if max_clients >= 0 && count >= max_clients {
                return Err(SwitchboardError::MaxClientsReached(service.to_string()));
            }
            links.insert(client.to_string(), LockMode::None);
            debug!(client = %client, service = %service, "linked");
        }
        Ok(inner.services[service].identity.clone())
    }

    /// Remove a client's link (and any lock it held). Idempotent.
    pub async fn unlink(&self, client: &str, service: &str) -> SwitchboardResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.services.contains_key(service) {
            return Err(SwitchboardError::NoSuchService(service.to_string()));
        }
        if let Some(links) = inner.links.get_mut(service) {
            if links.remove(client).is_some() {
                debug!(client = %client, service = %service, "unlinked");
            }
        }
        Ok(())
    }

    /// Acquire a lock on a service the client is linked with.
    ///
    /// Exclusive requires being the only linked client and no other lock;
    /// shared requires no exclusive lock. Re-locking with the same mode is
    /// idempotent.
    pub async fn lock(
        &self,
        client: &str,
        service: &str,
        mode: LockMode,
    ) -> SwitchboardResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.services.contains_key(service) {
            return Err(SwitchboardError::NoSuchService(service.to_string()));
        }
        let links = inner.links.entry(service.to_string()).or_default();
        if !links.contains_key(client) {
            return Err(SwitchboardError::NotLinked(service.to_string()));
        }
        match mode {
            LockMode::Exclusive => {
                if links.keys().any(|addr| addr != client) {
                    return Err(SwitchboardError::LockedExclusive(service.to_string()));
                }
            }
            LockMode::Shared => {
                if links
                    .iter()
                    .any(|(addr, m)| addr != client && *m == LockMode::Exclusive)
                {
                    return Err(SwitchboardError::LockedExclusive(service.to_string()));
                }
            }
            LockMode::None => {}
        }
        links.insert(client.to_string(), mode);
        debug!(client = %client, service = %service, ?mode, "lock granted");
        Ok(())
    }

    /// Release any lock the client holds on the service; the link remains.
    pub async fn unlock(&self, client: &str, service: &str) -> SwitchboardResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.services.contains_key(service) {
            return Err(SwitchboardError::NoSuchService(service.to_string()));
        }
        let links = inner.links.entry(service.to_string()).or_default();
        match links.get_mut(client) {
            Some(mode) => {
                *mode = LockMode::None;
                Ok(())
            }
            None => Err(SwitchboardError::NotLinked(service.to_string())),
        }
    }

    /// Whether the client currently holds a link to the service.
    pub async fn is_linked(&self, client: &str, service: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .links
            .get(service)
            .is_some_and(|links| links.contains_key(client))
    }

    /// Addresses of every client linked with a service.
    pub async fn linked_clients(&self, service: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .links
            .get(service)
            .map(|links| links.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The handle of a registered service, for forwarding.
    pub async fn service_handle(&self, service: &str) -> Option<PeerHandle> {
        let inner = self.inner.read().await;
        inner.services.get(service).map(|e| e.handle.clone())
    }

    /// Drop every link (and lock) a departing client held.
    pub async fn purge_client(&self, client: &str) {
        let mut inner = self.inner.write().await;
        for links in inner.links.values_mut() {
            links.remove(client);
        }
    }

    /// Snapshot of the directory, keyed by service name.
    pub async fn snapshot(&self) -> Value {
        let inner = self.inner.read().await;
        let mut map = Map::new();
        for (name, entry) in &inner.services {
            map.insert(name.clone(), entry.identity.clone());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_core::JsonBackend;

    fn handle(address: &str) -> PeerHandle {
        PeerHandle::detached(address, "test", JsonBackend::Builtin)
    }

    fn entry(name: &str, address: &str, max_clients: i64) -> ServiceEntry {
        ServiceEntry {
            name: name.into(),
            address: address.into(),
            identity: json!({"type": "service", "name": name}),
            max_clients,
            handle: handle(address),
        }
    }

    #[tokio::test]
    async fn duplicate_service_name_is_rejected() {
        let table = LinkTable::new();
        table.register_service(entry("Echo", "a:1", -1)).await.unwrap();
        let err = table
            .register_service(entry("Echo", "b:2", -1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn link_unknown_service_fails() {
        let table = LinkTable::new();
        let err = table.link("c:1", "Nope").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::NoSuchService(_)));
    }

    #[tokio::test]
    async fn max_clients_is_enforced() {
        let table = LinkTable::new();
        table.register_service(entry("Solo", "s:1", 1)).await.unwrap();
        table.link("a:1", "Solo").await.unwrap();
        // Re-linking the same client does not consume a second slot.
        table.link("a:1", "Solo").await.unwrap();
        let err = table.link("b:2", "Solo").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::MaxClientsReached(_)));

        table.unlink("a:1", "Solo").await.unwrap();
        table.link("b:2", "Solo").await.unwrap();
    }

    #[tokio::test]
    async fn unbounded_cap_admits_many() {
        let table = LinkTable::new();
        table.register_service(entry("Open", "s:1", -1)).await.unwrap();
        for i in 0..64 {
            table.link(&format!("c:{i}"), "Open").await.unwrap();
        }
        assert_eq!(table.linked_clients("Open").await.len(), 64);
    }

    #[tokio::test]
    async fn exclusive_lock_requires_sole_linkage() {
        let table = LinkTable::new();
        table.register_service(entry("S", "s:1", -1)).await.unwrap();
        table.link("a:1", "S").await.unwrap();
        table.link("b:2", "S").await.unwrap();
        let err = table.lock("a:1", "S", LockMode::Exclusive).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::LockedExclusive(_)));

        table.unlink("b:2", "S").await.unwrap();
        table.lock("a:1", "S", LockMode::Exclusive).await.unwrap();
        // Nobody else can link while the exclusive lock is held.
        let err = table.link("b:2", "S").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::LockedExclusive(_)));
    }

    #[tokio::test]
    async fn shared_lock_is_idempotent_and_blocks_exclusive() {
        let table = LinkTable::new();
        table.register_service(entry("S", "s:1", -1)).await.unwrap();
        table.link("a:1", "S").await.unwrap();
        table.link("b:2", "S").await.unwrap();
        table.lock("a:1", "S", LockMode::Shared).await.unwrap();
        table.lock("a:1", "S", LockMode::Shared).await.unwrap();
        let err = table.lock("b:2", "S", LockMode::Exclusive).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::LockedExclusive(_)));
    }

    #[tokio::test]
    async fn lock_requires_link() {
        let table = LinkTable::new();
        table.register_service(entry("S", "s:1", -1)).await.unwrap();
        let err = table.lock("a:1", "S", LockMode::Shared).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::NotLinked(_)));
    }

    #[tokio::test]
    async fn unlink_releases_lock_and_is_idempotent() {
        let table = LinkTable::new();
        table.register_service(entry("S", "s:1", -1)).await.unwrap();
        table.link("a:1", "S").await.unwrap();
        table.lock("a:1", "S", LockMode::Exclusive).await.unwrap();
        table.unlink("a:1", "S").await.unwrap();
        table.unlink("a:1", "S").await.unwrap();
        // The lock is gone; another client may now link.
        table.link("b:2", "S").await.unwrap();
    }

    #[tokio::test]
    async fn service_death_reports_linked_clients() {
        let table = LinkTable::new();
        table.register_service(entry("S", "s:1", -1)).await.unwrap();
        table.link("a:1", "S").await.unwrap();
        table.link("b:2", "S").await.unwrap();
        let (removed, mut linked) = table.unregister_service_at("s:1").await.unwrap();
        linked.sort();
        assert_eq!(removed.name, "S");
        assert_eq!(linked, vec!["a:1", "b:2"]);
        assert!(table.service_handle("S").await.is_none());
    }

    #[tokio::test]
    async fn purge_client_clears_all_links() {
        let table = LinkTable::new();
        table.register_service(entry("S", "s:1", 1)).await.unwrap();
        table.link("a:1", "S").await.unwrap();
        table.purge_client("a:1").await;
        assert!(!table.is_linked("a:1", "S").await);
        // The freed slot is reusable.
        table.link("b:2", "S").await.unwrap();
    }
}
