use thiserror::Error;

/// Errors produced by the switchboard protocol layer.
///
/// The first group maps one-to-one onto the wire error taxonomy; the rest
/// are local conditions (configuration, storage, I/O) that never leave the
/// process as frames.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("reserved uid: {0:?} cannot be used for a request")]
    ReservedUid(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no service named {0:?} is connected to the manager")]
    NoSuchService(String),

    #[error("the maximum number of clients are linked with {0:?}")]
    MaxClientsReached(String),

    #[error("{0:?} is locked for the exclusive use of another client")]
    LockedExclusive(String),

    #[error("not linked with {0:?}")]
    NotLinked(String),

    #[error("a request with uid {0:?} is already in flight")]
    DuplicateUid(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("service-gone: {0:?} disconnected while the request was in flight")]
    ServiceGone(String),

    #[error("peer-disconnected: {0} is no longer connected")]
    PeerDisconnected(String),

    #[error("the manager is draining and does not accept new requests")]
    Draining,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchboardError {
    /// Whether this error must end the session it was raised on.
    ///
    /// Routing-policy violations are answered with an error frame and the
    /// session survives; handshake and framing faults are terminal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwitchboardError::Protocol(_)
                | SwitchboardError::FrameTooLarge { .. }
                | SwitchboardError::ReservedUid(_)
                | SwitchboardError::Identity(_)
                | SwitchboardError::Auth(_)
                | SwitchboardError::Io(_)
                | SwitchboardError::ConnectionClosed
        )
    }
}

pub type SwitchboardResult<T> = Result<T, SwitchboardError>;
