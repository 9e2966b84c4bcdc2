//! Client error types.
//!
//! Two families live here:
//!
//! - [`CallError`] is what a caller's error handler receives. It is local to
//!   one call and is `Clone` so a single synthetic transport failure can be
//!   handed to every live call.
//! - [`ProtocolError`] and [`TransportError`] describe failures of the
//!   codec and the socket. The session turns them into `CallError`s.
//! - [`ClientError`] is returned before a session exists, for a bad endpoint
//!   or an out-of-range reconnect policy.

use thiserror::Error;

use crate::connection::AddressError;

/// Result type alias for session setup.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors delivered to a call's error handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The peer rejected the call (`api_error` was set on the reply).
    #[error("{0}")]
    Api(String),

    /// The peer sent an envelope this client cannot accept for the call.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport failed while the call was outstanding.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The session was destroyed before a reply arrived.
    #[error("session destroyed")]
    SessionDestroyed,

    /// `unsubscribe` was requested for a one-shot call.
    #[error("call to api_name={0} is not a subscription")]
    NotSubscription(String),
}

impl CallError {
    /// Returns true if the error came from the connection rather than the peer's API.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::SessionDestroyed)
    }
}

/// Errors produced by the wire codec.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Encoding an outbound envelope failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Decoding an inbound frame failed.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// `Call::message` was asked for a second time.
    #[error("api_args for call_id={0} were already consumed")]
    ArgumentsConsumed(u64),
}

/// Errors raised by a transport or its connector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the channel failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The channel is closed and cannot take more frames.
    #[error("transport closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connect(err.to_string())
    }
}

/// Errors raised while setting up a session.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The endpoint address was rejected.
    #[error("Invalid endpoint: {0}")]
    Address(#[from] AddressError),

    /// The session settings are out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
