//! The authentication modes enforced after a peer identifies itself.
//!
//! Certificate and hostname checks need no extra round trip; the login
//! exchange lives in the session module because it owns the socket.
//! Credential-store reads run on the blocking pool so the event loop never
//! waits on disk.

use crate::manager::Shared;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tracing::debug;

/// Certificate mode: the presented client certificate's SHA-256
/// fingerprint must be allow-listed.
pub async fn check_certificate(
    shared: &Shared,
    peer_fingerprint: Option<&str>,
) -> SwitchboardResult<()> {
    let fingerprint = peer_fingerprint
        .ok_or_else(|| SwitchboardError::Auth("no peer certificate was presented".into()))?
        .to_string();
    let store = shared.store.clone();
    let fp = fingerprint.clone();
    let trusted = tokio::task::spawn_blocking(move || store.is_certificate_trusted(&fp))
        .await
        .map_err(|e| SwitchboardError::Database(e.to_string()))??;
    if trusted {
        debug!(fingerprint = %&fingerprint[..16.min(fingerprint.len())], "certificate trusted");
        Ok(())
    } else {
        Err(SwitchboardError::Auth(format!(
            "certificate {fingerprint} is not trusted"
        )))
    }
}

/// Hostname mode: the peer address must match a trusted hostname.
///
/// The peer's IP literal is compared against the allow-list directly;
/// stored names are also forward-resolved and their addresses compared.
pub async fn check_hostname(shared: &Shared, address: &str) -> SwitchboardResult<()> {
    let ip = peer_ip(address);
    let store = shared.store.clone();
    let hostnames = tokio::task::spawn_blocking(move || store.hostnames())
        .await
        .map_err(|e| SwitchboardError::Database(e.to_string()))??;

    if hostnames.iter().any(|h| h == &ip) {
        return Ok(());
    }
    for host in &hostnames {
        if let Ok(resolved) = tokio::net::lookup_host((host.as_str(), 0)).await {
            for addr in resolved {
                if addr.ip().to_string() == ip {
                    debug!(hostname = %host, ip = %ip, "peer matched trusted hostname");
                    return Ok(());
                }
            }
        }
    }
    Err(SwitchboardError::Auth(format!(
        "{ip} is not a trusted hostname"
    )))
}

/// Extract the IP literal from a `host:port` peer address; IPv6 peers
/// arrive bracketed (`[::1]:1875`).
fn peer_ip(address: &str) -> String {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}
