//! RPC session client for the profile monitor UI API.
//!
//! This crate keeps one persistent, authenticated connection to a profile
//! monitor and multiplexes one-shot calls and streaming subscriptions over it.
//! Connection loss is absorbed: every outstanding call fails with a transport
//! error and the session reconnects with exponential backoff. It is
//! UI-agnostic and can be used by CLI tools, test harnesses, and alternative
//! frontends.

pub mod call;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use call::{CallHandle, CallKind, CallState, Handlers};
pub use connection::{
    normalize_url, resolve_endpoint, AddressError, AddressSource, EndpointAddress,
    DEFAULT_API_PATH, DEFAULT_API_PORT, DEFAULT_ENDPOINT_URL, ENDPOINT_ENV_VAR,
};
pub use error::{CallError, ClientError, ProtocolError, Result, TransportError};
pub use reconnect::{Backoff, ConnectionState, ReconnectConfig};
pub use session::{Session, SessionConfig};
pub use transport::{Connection, Connector, Transport, TransportEvent, WebSocketConnector};
