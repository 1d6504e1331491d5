//! switchboard-core: Shared protocol library for switchboard.
//!
//! Provides the newline-delimited JSON frame codec, the five wire message
//! shapes, peer identities, the pluggable JSON backend, the terminal
//! shortcut parser, and the error taxonomy shared by the manager and the
//! peer library.

pub mod codec;
pub mod constants;
pub mod error;
pub mod identity;
pub mod json;
pub mod message;
pub mod terminal;

// Re-export commonly used items at crate root.
pub use codec::{encode_frame, FrameDecoder};
pub use constants::{MANAGER_SERVICE, NOTIFICATION_UID, PORT};
pub use error::{SwitchboardError, SwitchboardResult};
pub use identity::{fingerprint, Identity};
pub use json::JsonBackend;
pub use message::{ErrorFrame, Frame, Notification, Reply, Request};
