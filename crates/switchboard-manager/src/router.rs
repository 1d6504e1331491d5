//! Frame classification and routing.
//!
//! Frames from ready peers fall into four paths: admin calls addressed to
//! the manager itself, client requests forwarded to services, service
//! replies correlated back through the pending table, and notifications
//! fanned out to linked clients. Routing-policy violations are answered
//! with error frames and the session survives; protocol faults (wrong
//! shape, reserved uid) bubble up and end the offending session.

use crate::links::LockMode;
use crate::manager::Shared;
use crate::session::{PeerHandle, Role};
use serde_json::Value;
use std::sync::Arc;
use switchboard_core::constants::{
    DISCONNECT_ATTRIBUTE, MANAGER_SERVICE, NOTIFICATION_UID, SELF_SERVICE,
};
use switchboard_core::{message, Frame, Request, SwitchboardError, SwitchboardResult};
use tracing::{debug, info, warn};

/// What the session loop should do after a frame was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The peer asked to disconnect cleanly.
    Disconnect,
}

/// Route one decoded frame from a ready peer.
pub async fn route(
    shared: &Arc<Shared>,
    peer: &PeerHandle,
    value: Value,
) -> SwitchboardResult<Disposition> {
    // Replies and notifications are forwarded unchanged, so keep the
    // original around; classification works on a clone.
    let frame = Frame::classify(value.clone())?;
    match frame {
        Frame::Request(request) => route_request(shared, peer, request, value).await,
        Frame::Reply(reply) => {
            deliver_reply(shared, peer, &reply.requester, &reply.uid, value).await;
            Ok(Disposition::Continue)
        }
        Frame::Error(error) => {
            deliver_reply(shared, peer, &error.requester, &error.uid, value).await;
            Ok(Disposition::Continue)
        }
        Frame::Notification(notification) => {
            // Only services may emit the reserved uid; from anyone else it
            // is reserved-uid abuse and ends the session.
            if peer.role != Role::Service {
                return Err(SwitchboardError::ReservedUid(NOTIFICATION_UID.into()));
            }
            route_notification(shared, peer, &notification.service, value).await;
            Ok(Disposition::Continue)
        }
    }
}

async fn route_request(
    shared: &Arc<Shared>,
    peer: &PeerHandle,
    request: Request,
    mut value: Value,
) -> SwitchboardResult<Disposition> {
    if request.uid == NOTIFICATION_UID {
        return Err(SwitchboardError::ReservedUid(request.uid));
    }
    if request.service == SELF_SERVICE && request.attribute == DISCONNECT_ATTRIBUTE {
        return Ok(Disposition::Disconnect);
    }
    if request.service == MANAGER_SERVICE {
        handle_manager_request(shared, peer, request).await;
        return Ok(Disposition::Continue);
    }

    // Client → service request.
    if shared.is_draining().await {
        answer_err(peer, &SwitchboardError::Draining, &request.uid).await;
        return Ok(Disposition::Continue);
    }
    let Some(service) = shared.links.service_handle(&request.service).await else {
        answer_err(
            peer,
            &SwitchboardError::NoSuchService(request.service),
            &request.uid,
        )
        .await;
        return Ok(Disposition::Continue);
    };
    if peer.role != Role::Terminal && !shared.links.is_linked(&peer.address, &request.service).await
    {
        answer_err(
            peer,
            &SwitchboardError::NotLinked(request.service),
            &request.uid,
        )
        .await;
        return Ok(Disposition::Continue);
    }
    if let Err(e) = shared
        .pending
        .insert(peer.clone(), &request.uid, &request.service)
        .await
    {
        answer_err(peer, &e, &request.uid).await;
        return Ok(Disposition::Continue);
    }

    // Stamp the originator so the service can address its reply.
    if let Some(map) = value.as_object_mut() {
        map.insert("requester".into(), Value::String(peer.address.clone()));
    }
    debug!(
        from = %peer.address,
        service = %request.service,
        attribute = %request.attribute,
        uid = %request.uid,
        "request forwarded"
    );
    if !service.send(&value).await {
        // The service vanished between lookup and send.
        shared.pending.resolve(&peer.address, &request.uid).await;
        answer_err(
            peer,
            &SwitchboardError::ServiceGone(request.service),
            &request.uid,
        )
        .await;
    }
    Ok(Disposition::Continue)
}

/// Correlate a reply or error frame back to the waiting client.
async fn deliver_reply(
    shared: &Arc<Shared>,
    peer: &PeerHandle,
    requester: &str,
    uid: &str,
    value: Value,
) {
    let Some(entry) = shared.pending.resolve(requester, uid).await else {
        warn!(
            from = %peer.address,
            requester = %requester,
            uid = %uid,
            "reply has no matching pending request, dropped"
        );
        return;
    };
    // Only the service the request was forwarded to may answer it.
    if peer.role != Role::Service || peer.name != entry.service {
        warn!(
            from = %peer.address,
            service = %entry.service,
            uid = %uid,
            "reply from a peer that does not own the request, dropped"
        );
        // The request is still outstanding as far as the client knows.
        let _ = shared
            .pending
            .insert(entry.client.clone(), uid, &entry.service)
            .await;
        return;
    }
    debug!(
        service = %peer.name,
        requester = %requester,
        uid = %uid,
        elapsed_ms = entry.since.elapsed().as_millis() as u64,
        "reply routed"
    );
    if !entry.client.send(&value).await {
        debug!(requester = %requester, uid = %uid, "client left before its reply arrived");
    }
}

/// Fan a notification out to every client linked with the emitting service.
async fn route_notification(
    shared: &Arc<Shared>,
    peer: &PeerHandle,
    service: &str,
    value: Value,
) {
    if service != peer.name {
        warn!(
            from = %peer.name,
            claimed = %service,
            "notification names a different service, dropped"
        );
        return;
    }
    let linked = shared.links.linked_clients(service).await;
    debug!(service = %service, clients = linked.len(), "notification fan-out");
    for client_address in linked {
        if let Some(client) = shared.registry.get(&client_address).await {
            client.send(&value).await;
        }
    }
}

/// Dispatch a request addressed to the manager itself.
async fn handle_manager_request(shared: &Arc<Shared>, peer: &PeerHandle, request: Request) {
    let uid = request.uid.clone();
    match manager_attribute(shared, peer, request).await {
        Ok(result) => {
            peer.send(&message::reply(result, &peer.address, &uid)).await;
        }
        Err(e) => answer_err(peer, &e, &uid).await,
    }
}

async fn manager_attribute(
    shared: &Arc<Shared>,
    peer: &PeerHandle,
    request: Request,
) -> SwitchboardResult<Value> {
    match request.attribute.as_str() {
        "identity" => Ok(shared.manager_identity().await),
        "link" => {
            let service = named_arg(&request, 0, "service")?;
            let identity = shared.links.link(&peer.address, &service).await?;
            info!(client = %peer.name, service = %service, "linked");
            Ok(identity)
        }
        "unlink" => {
            let service = named_arg(&request, 0, "service")?;
            shared.links.unlink(&peer.address, &service).await?;
            info!(client = %peer.name, service = %service, "unlinked");
            Ok(Value::Bool(true))
        }
        "lock" => {
            let service = named_arg(&request, 0, "service")?;
            let mode = optional_arg(&request, 1, "mode")
                .map(|m| LockMode::parse(&m))
                .transpose()?
                .unwrap_or(LockMode::Exclusive);
            shared.links.lock(&peer.address, &service, mode).await?;
            info!(client = %peer.name, service = %service, ?mode, "locked");
            Ok(Value::Bool(true))
        }
        "unlock" => {
            let service = named_arg(&request, 0, "service")?;
            shared.links.unlock(&peer.address, &service).await?;
            Ok(Value::Bool(true))
        }
        "list_services" => Ok(shared.links.snapshot().await),
        "cancel" => {
            let uid = named_arg(&request, 0, "uid")?;
            let existed = shared.pending.cancel(&peer.address, &uid).await;
            debug!(client = %peer.address, uid = %uid, existed, "pending request cancelled");
            Ok(Value::Bool(existed))
        }
        "shutdown_manager" => {
            require_admin(peer)?;
            info!(by = %peer.name, "shutdown requested");
            let _ = shared.shutdown.send(());
            Ok(Value::Bool(true))
        }
        "kick" => {
            require_admin(peer)?;
            let address = named_arg(&request, 0, "address")?;
            match shared.registry.get(&address).await {
                Some(handle) => {
                    info!(by = %peer.name, kicked = %address, "session kicked");
                    handle.close();
                    Ok(Value::Bool(true))
                }
                None => Err(SwitchboardError::Remote(format!(
                    "no peer is connected from {address:?}"
                ))),
            }
        }
        "users_table.is_user_registered" => {
            let username = named_arg(&request, 0, "username")?;
            let store = shared.store.clone();
            let registered =
                tokio::task::spawn_blocking(move || store.is_user_registered(&username))
                    .await
                    .map_err(|e| SwitchboardError::Database(e.to_string()))??;
            Ok(Value::Bool(registered))
        }
        "users_table.users" => {
            let store = shared.store.clone();
            let users = tokio::task::spawn_blocking(move || store.users())
                .await
                .map_err(|e| SwitchboardError::Database(e.to_string()))??;
            Ok(Value::Array(
                users
                    .into_iter()
                    .map(|(name, admin)| {
                        Value::Array(vec![Value::String(name), Value::Bool(admin)])
                    })
                    .collect(),
            ))
        }
        "hostnames_table.hostnames" => {
            let store = shared.store.clone();
            let hostnames = tokio::task::spawn_blocking(move || store.hostnames())
                .await
                .map_err(|e| SwitchboardError::Database(e.to_string()))??;
            Ok(Value::Array(
                hostnames.into_iter().map(Value::String).collect(),
            ))
        }
        other => Err(SwitchboardError::Remote(format!(
            "the manager does not have a {other:?} attribute to call"
        ))),
    }
}

fn require_admin(peer: &PeerHandle) -> SwitchboardResult<()> {
    if peer.admin {
        Ok(())
    } else {
        Err(SwitchboardError::PermissionDenied(
            "this attribute requires an administrator login".into(),
        ))
    }
}

/// Fetch a required string argument by position or keyword.
fn named_arg(request: &Request, index: usize, key: &str) -> SwitchboardResult<String> {
    optional_arg(request, index, key).ok_or_else(|| {
        SwitchboardError::Remote(format!(
            "{}() is missing the {key:?} argument",
            request.attribute
        ))
    })
}

fn optional_arg(request: &Request, index: usize, key: &str) -> Option<String> {
    request
        .args
        .get(index)
        .or_else(|| request.kwargs.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn answer_err(peer: &PeerHandle, error: &SwitchboardError, uid: &str) {
    debug!(to = %peer.address, uid = %uid, error = %error, "error frame returned");
    peer.send(&message::error_frame(error, &peer.address, uid))
        .await;
}

/// Signatures of the attributes the manager exposes, for its identity.
pub fn manager_attribute_table() -> std::collections::BTreeMap<String, String> {
    let entries: &[(&str, &str)] = &[
        ("identity", "() -> dict"),
        ("link", "(service: str) -> dict"),
        ("unlink", "(service: str) -> bool"),
        ("lock", "(service: str, mode: str) -> bool"),
        ("unlock", "(service: str) -> bool"),
        ("list_services", "() -> dict"),
        ("cancel", "(uid: str) -> bool"),
        ("shutdown_manager", "() -> bool"),
        ("kick", "(address: str) -> bool"),
        ("users_table.is_user_registered", "(username: str) -> bool"),
        ("users_table.users", "() -> list"),
        ("hostnames_table.hostnames", "() -> list"),
    ];
    entries
        .iter()
        .map(|(name, signature)| (name.to_string(), signature.to_string()))
        .collect()
}
