//! Wire envelopes of the UI API.
//!
//! Every frame is a MessagePack map with named fields. `msg_kind` selects the
//! envelope type:
//!
//! | kind          | value  | direction | fields                                   |
//! |---------------|--------|-----------|------------------------------------------|
//! | `CALL`        | 777501 | out       | `call_id`, `api_name`, `api_args`        |
//! | `REPLY`       | 777502 | in        | `call_id`, `api_result`, `api_error`     |
//! | `SUBSCRIBE`   | 777503 | out       | `call_id`, `api_name`, `api_args`        |
//! | `UNSUBSCRIBE` | 777504 | both      | `call_id`                                |
//!
//! Outbound frames are built from [`Outbound`]; inbound frames decode into
//! [`Inbound`], and nothing past this module looks at raw fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Correlation id of a call, unique within one session.
pub type CallId = u64;

/// Reserved api name of the handshake call.
pub const AUTH_API_NAME: &str = "authenticate_connection";

/// Protocol version presented in the handshake.
pub const AUTH_API_VERSION: u64 = 658_584_001;

const MSG_KIND_BASE: u32 = 777_500;

/// Envelope type carried in `msg_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    /// One-shot request
    Call = MSG_KIND_BASE + 1,
    /// Reply to a call or subscription
    Reply = MSG_KIND_BASE + 2,
    /// Streaming request
    Subscribe = MSG_KIND_BASE + 3,
    /// Unsubscribe request, or its acknowledgment
    Unsubscribe = MSG_KIND_BASE + 4,
}

impl MsgKind {
    /// Map a raw `msg_kind` value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            v if v == Self::Call as u32 => Some(Self::Call),
            v if v == Self::Reply as u32 => Some(Self::Reply),
            v if v == Self::Subscribe as u32 => Some(Self::Subscribe),
            v if v == Self::Unsubscribe as u32 => Some(Self::Unsubscribe),
            _ => None,
        }
    }
}

/// Frames this client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound<'a> {
    /// CALL or SUBSCRIBE request
    Request {
        /// Correlation id
        call_id: CallId,
        /// Remote operation
        api_name: &'a str,
        /// Arguments, any serializable value
        api_args: &'a Value,
        /// Streaming request when true
        subscribe: bool,
    },
    /// UNSUBSCRIBE control frame
    Unsubscribe {
        /// Subscription to cancel
        call_id: CallId,
    },
}

#[derive(Serialize)]
struct WireRequest<'a> {
    api_args: &'a Value,
    api_name: &'a str,
    call_id: CallId,
    msg_kind: u32,
}

#[derive(Serialize)]
struct WireControl {
    call_id: CallId,
    msg_kind: u32,
}

impl Outbound<'_> {
    /// Encode into a MessagePack frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let frame = match *self {
            Self::Request {
                call_id,
                api_name,
                api_args,
                subscribe,
            } => {
                let kind = if subscribe {
                    MsgKind::Subscribe
                } else {
                    MsgKind::Call
                };
                rmp_serde::to_vec_named(&WireRequest {
                    api_args,
                    api_name,
                    call_id,
                    msg_kind: kind as u32,
                })?
            }
            Self::Unsubscribe { call_id } => rmp_serde::to_vec_named(&WireControl {
                call_id,
                msg_kind: MsgKind::Unsubscribe as u32,
            })?,
        };
        Ok(frame)
    }
}

/// Frames this client receives, one variant per acceptable `msg_kind`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// REPLY
    Reply {
        /// Correlation id
        call_id: CallId,
        /// `Ok(None)` is a null result (stream end for subscriptions)
        outcome: Result<Option<Value>, String>,
    },
    /// UNSUBSCRIBE echoed by the peer
    UnsubscribeAck {
        /// Correlation id
        call_id: CallId,
    },
    /// Identifiable but unacceptable envelope
    Invalid {
        /// Correlation id
        call_id: CallId,
        /// What was wrong with it
        reason: String,
    },
}

impl Inbound {
    /// Correlation id the frame is addressed to.
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Reply { call_id, .. }
            | Self::UnsubscribeAck { call_id }
            | Self::Invalid { call_id, .. } => *call_id,
        }
    }
}

#[derive(Deserialize)]
struct WireInbound {
    call_id: CallId,
    msg_kind: u32,
    #[serde(default)]
    api_result: Option<Value>,
    #[serde(default)]
    api_error: Option<Value>,
}

#[derive(Deserialize)]
struct WireCallId {
    call_id: CallId,
}

/// Decode an inbound frame.
///
/// A frame whose fields do not decode but whose `call_id` does becomes
/// [`Inbound::Invalid`] so the owning call can be failed. Only a frame with
/// no recoverable `call_id` is an error.
pub fn decode_inbound(frame: &[u8]) -> Result<Inbound, ProtocolError> {
    let wire = match rmp_serde::from_slice::<WireInbound>(frame) {
        Ok(wire) => wire,
        Err(err) => {
            let WireCallId { call_id } = rmp_serde::from_slice(frame).map_err(|_| err)?;
            return Ok(Inbound::Invalid {
                call_id,
                reason: "malformed envelope".to_string(),
            });
        }
    };

    let call_id = wire.call_id;
    let inbound = match MsgKind::from_u32(wire.msg_kind) {
        Some(MsgKind::Reply) => Inbound::Reply {
            call_id,
            outcome: match api_error_text(wire.api_error) {
                Some(error) => Err(error),
                None => Ok(wire.api_result.filter(|v| !v.is_null())),
            },
        },
        Some(MsgKind::Unsubscribe) => Inbound::UnsubscribeAck { call_id },
        Some(MsgKind::Call | MsgKind::Subscribe) | None => Inbound::Invalid {
            call_id,
            reason: format!("invalid msg_kind={}", wire.msg_kind),
        },
    };
    Ok(inbound)
}

/// Null, `false` and `""` count as "no error"; other non-strings are rendered.
fn api_error_text(api_error: Option<Value>) -> Option<String> {
    match api_error? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Peer-side view of a client frame, for mock servers and test harnesses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeerRequest {
    /// Correlation id
    pub call_id: CallId,
    /// Raw `msg_kind`
    pub msg_kind: u32,
    /// Set on CALL and SUBSCRIBE
    #[serde(default)]
    pub api_name: Option<String>,
    /// Set on CALL and SUBSCRIBE (`None` when null)
    #[serde(default)]
    pub api_args: Option<Value>,
}

impl PeerRequest {
    /// Envelope type, if known.
    #[must_use]
    pub fn kind(&self) -> Option<MsgKind> {
        MsgKind::from_u32(self.msg_kind)
    }
}

/// Decode a frame the way the peer sees it.
pub fn decode_request(frame: &[u8]) -> Result<PeerRequest, ProtocolError> {
    Ok(rmp_serde::from_slice(frame)?)
}

#[derive(Serialize)]
struct WireReply<'a> {
    api_error: Option<&'a str>,
    api_result: Option<&'a Value>,
    call_id: CallId,
    msg_kind: u32,
}

/// Encode a REPLY the way the peer sends it. `Ok(&Value::Null)` is the
/// stream-end sentinel.
pub fn encode_reply(
    call_id: CallId,
    outcome: Result<&Value, &str>,
) -> Result<Vec<u8>, ProtocolError> {
    let (api_result, api_error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(error) => (None, Some(error)),
    };
    Ok(rmp_serde::to_vec_named(&WireReply {
        api_error,
        api_result,
        call_id,
        msg_kind: MsgKind::Reply as u32,
    })?)
}

/// `api_args` of the handshake call.
#[must_use]
pub fn auth_args(token: Option<&str>) -> Value {
    serde_json::json!({
        "token": token,
        "version": AUTH_API_VERSION,
    })
}
