//! Protocol constants shared by the manager and the peer library.

use std::time::Duration;

/// Default port for a manager.
pub const PORT: u16 = 1875;

/// Bytes that terminate every frame on the wire.
///
/// Readers must also accept a lone `\n`; writers always emit `\r\n`.
pub const TERMINATION: &[u8] = b"\r\n";

/// Reserved `uid` value marking a notification frame.
pub const NOTIFICATION_UID: &str = "notification";

/// Reserved `service` value addressing the manager itself.
pub const MANAGER_SERVICE: &str = "Manager";

/// Attribute a peer sends to request a clean disconnect.
pub const DISCONNECT_ATTRIBUTE: &str = "__disconnect__";

/// Pseudo-service a peer addresses when it wants to act on its own session.
pub const SELF_SERVICE: &str = "self";

/// Default per-session read limit before a frame is rejected as too large.
pub const DEFAULT_READ_LIMIT: usize = 64 * 1024 * 1024;

/// How long a connecting peer has to complete the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a draining manager waits for in-flight requests to settle.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Number of failed login attempts before the session is closed.
pub const MAX_LOGIN_ATTEMPTS: u32 = 3;

/// Environment variable selecting the JSON backend.
pub const JSON_BACKEND_ENV: &str = "MSL_NETWORK_JSON";
