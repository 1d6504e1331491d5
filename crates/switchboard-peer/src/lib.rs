//! switchboard-peer: the client and service sides of the wire protocol.
//!
//! A [`Client`] issues correlated requests to services through a manager
//! and receives their notifications; a [`ServiceBuilder`] registers named
//! handlers and serves them. Both share the connection establishment and
//! handshake logic in [`connect`].

pub mod client;
pub mod connect;
pub mod service;

pub use client::Client;
pub use connect::ConnectOptions;
pub use service::{RunningService, ServiceBuilder};
