//! The in-flight request table.
//!
//! Every client frame forwarded to a service leaves a record keyed by
//! `(client address, uid)` so the matching reply can be routed back. The
//! key only has to be unique while the request is in flight; reusing a uid
//! that is still pending is rejected rather than silently overwritten.

use crate::session::PeerHandle;
use std::collections::HashMap;
use std::time::Instant;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tokio::sync::Mutex;

/// One request awaiting its reply.
pub struct PendingEntry {
    /// Handle of the client the reply goes back to.
    pub client: PeerHandle,
    /// Name of the service the request was forwarded to.
    pub service: String,
    /// When the request was forwarded.
    pub since: Instant,
}

/// Table of requests awaiting replies.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<(String, String), PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a forwarded request.
    ///
    /// Fails with `DuplicateUid` when the same client already has a request
    /// with this uid in flight.
    pub async fn insert(
        &self,
        client: PeerHandle,
        uid: &str,
        service: &str,
    ) -> SwitchboardResult<()> {
        let mut inner = self.inner.lock().await;
        let key = (client.address.clone(), uid.to_string());
        if inner.contains_key(&key) {
            return Err(SwitchboardError::DuplicateUid(uid.to_string()));
        }
        inner.insert(
            key,
            PendingEntry {
                client,
                service: service.to_string(),
                since: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolve a reply: remove and return the matching entry, if any.
    pub async fn resolve(&self, requester: &str, uid: &str) -> Option<PendingEntry> {
        let mut inner = self.inner.lock().await;
        inner.remove(&(requester.to_string(), uid.to_string()))
    }

    /// Drop one entry without routing anything (client-requested cancel).
    /// Returns whether an entry existed.
    pub async fn cancel(&self, requester: &str, uid: &str) -> bool {
        self.resolve(requester, uid).await.is_some()
    }

    /// Drop every entry owned by a departing client.
    ///
    /// Returns `(uid, entry)` pairs so the caller can tell each target
    /// service that the requester is gone.
    pub async fn purge_client(&self, address: &str) -> Vec<(String, PendingEntry)> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<(String, String)> = inner
            .keys()
            .filter(|(client, _)| client == address)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| inner.remove(&key).map(|entry| (key.1, entry)))
            .collect()
    }

    /// Remove every entry addressed to a dying service.
    ///
    /// Returns `(uid, entry)` pairs so the caller can synthesize an error
    /// frame per waiting client.
    pub async fn purge_service(&self, service: &str) -> Vec<(String, PendingEntry)> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<(String, String)> = inner
            .iter()
            .filter(|(_, entry)| entry.service == service)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| inner.remove(&key).map(|entry| (key.1, entry)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::JsonBackend;

    fn handle(address: &str) -> PeerHandle {
        PeerHandle::detached(address, "test", JsonBackend::Builtin)
    }

    #[tokio::test]
    async fn insert_and_resolve() {
        let table = PendingTable::new();
        table.insert(handle("c:1"), "u1", "Echo").await.unwrap();
        let entry = table.resolve("c:1", "u1").await.unwrap();
        assert_eq!(entry.service, "Echo");
        assert!(table.resolve("c:1", "u1").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_uid_is_rejected() {
        let table = PendingTable::new();
        table.insert(handle("c:1"), "u1", "Echo").await.unwrap();
        let err = table.insert(handle("c:1"), "u1", "Echo").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::DuplicateUid(_)));
        // A different client may reuse the same uid.
        table.insert(handle("c:2"), "u1", "Echo").await.unwrap();
    }

    #[tokio::test]
    async fn uid_is_reusable_after_settlement() {
        let table = PendingTable::new();
        table.insert(handle("c:1"), "u1", "Echo").await.unwrap();
        table.resolve("c:1", "u1").await.unwrap();
        table.insert(handle("c:1"), "u1", "Echo").await.unwrap();
    }

    #[tokio::test]
    async fn purge_client_drops_only_that_client() {
        let table = PendingTable::new();
        table.insert(handle("c:1"), "u1", "Echo").await.unwrap();
        table.insert(handle("c:1"), "u2", "Echo").await.unwrap();
        table.insert(handle("c:2"), "u1", "Echo").await.unwrap();
        let mut purged = table.purge_client("c:1").await;
        purged.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(purged.len(), 2);
        assert_eq!(purged[0].0, "u1");
        assert_eq!(purged[0].1.service, "Echo");
        assert_eq!(purged[1].0, "u2");
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn purge_service_returns_waiters() {
        let table = PendingTable::new();
        table.insert(handle("c:1"), "u1", "Slow").await.unwrap();
        table.insert(handle("c:2"), "u9", "Slow").await.unwrap();
        table.insert(handle("c:3"), "u1", "Other").await.unwrap();
        let mut purged = table.purge_service("Slow").await;
        purged.sort_by(|a, b| a.1.client.address.cmp(&b.1.client.address));
        assert_eq!(purged.len(), 2);
        assert_eq!(purged[0].0, "u1");
        assert_eq!(purged[1].0, "u9");
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn cancel_drops_the_entry() {
        let table = PendingTable::new();
        table.insert(handle("c:1"), "u1", "Echo").await.unwrap();
        assert!(table.cancel("c:1", "u1").await);
        assert!(!table.cancel("c:1", "u1").await);
        assert!(table.is_empty().await);
    }
}
