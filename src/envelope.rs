//! Typed-message envelope codec for the signaling wire.
//!
//! Every message on the wire is a JSON object with exactly two top-level
//! fields:
//!
//!   {"type":"<message type>","msg":{...}}
//!
//! `type` is a non-empty string naming the payload schema; `msg` carries the
//! payload. Inbound frames that violate this shape are a protocol violation
//! and close the connection, not just the message; see `FrameViolation`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Message type catalogue ──────────────────────────────────

/// Server → client, sent once immediately after connection accept.
pub const CLIENT_TOKEN: &str = "client-token";
/// Client → server request; server → target delivery with the token swapped.
pub const REMOTE_TOKEN: &str = "remote-token";
/// Server → initiator: the requested remote token exists.
pub const SUCCESS: &str = "success";
/// Server → initiator: remote token missing, or protocol violation detail.
pub const ERROR: &str = "error";
/// Relayed peer → peer, token field rewritten to the sender's token.
pub const ICE_CANDIDATE: &str = "ice-candidate";
/// Relayed peer → peer, token field rewritten to the sender's token.
pub const SDP: &str = "sdp";
/// Relayed peer → peer to tear down a negotiation session.
pub const CLOSE_CONNECTION: &str = "close-connection";

// ── Wire types ──────────────────────────────────────────────

/// The `{type, msg}` wire wrapper carrying any payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub msg: T,
}

impl<T> Envelope<T> {
    pub fn new(msg_type: &str, msg: T) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            msg,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize to the wire text form.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `client-token` payload: the registry tells a fresh connection its own
/// address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientTokenPayload {
    pub token: String,
}

/// An inbound envelope whose payload has passed the frame contract but has
/// not yet been decoded into a concrete schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    pub msg_type: String,
    pub msg: serde_json::Value,
}

// ── Transport close taxonomy ────────────────────────────────

/// Close statuses the relay uses at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// Graceful shutdown.
    Normal,
    /// Malformed envelope: not an object, missing field, wrong field type,
    /// or empty `type`.
    InvalidPayload,
    /// Frame exceeds the configured maximum message size.
    MessageTooBig,
}

// ── Frame contract ──────────────────────────────────────────

/// Inbound frame contract violations. Any of these closes the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameViolation {
    /// Frame is not parseable JSON.
    NotJson(String),
    /// Top level is valid JSON but not an object.
    NotAnObject,
    /// No `type` field present.
    MissingType,
    /// `type` field present but not a string.
    TypeNotString,
    /// `type` field is the empty string.
    EmptyType,
    /// No `msg` field present.
    MissingMsg,
}

impl FrameViolation {
    /// The transport close status this violation maps to.
    pub fn close_status(&self) -> CloseStatus {
        CloseStatus::InvalidPayload
    }
}

impl fmt::Display for FrameViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameViolation::NotJson(detail) => write!(f, "frame is not JSON: {detail}"),
            FrameViolation::NotAnObject => write!(f, "frame top level is not an object"),
            FrameViolation::MissingType => write!(f, "frame has no 'type' field"),
            FrameViolation::TypeNotString => write!(f, "frame 'type' field is not a string"),
            FrameViolation::EmptyType => write!(f, "frame 'type' field is empty"),
            FrameViolation::MissingMsg => write!(f, "frame has no 'msg' field"),
        }
    }
}

impl std::error::Error for FrameViolation {}

/// Decode an inbound text frame against the envelope contract.
///
/// The payload is left as an untyped `serde_json::Value`; concrete schema
/// decoding happens per message type in the dispatcher.
pub fn decode_frame(text: &str) -> Result<RawEnvelope, FrameViolation> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameViolation::NotJson(e.to_string()))?;

    let object = value.as_object().ok_or(FrameViolation::NotAnObject)?;

    let type_field = object.get("type").ok_or(FrameViolation::MissingType)?;
    let msg_type = type_field.as_str().ok_or(FrameViolation::TypeNotString)?;
    if msg_type.is_empty() {
        return Err(FrameViolation::EmptyType);
    }

    let msg = object.get("msg").ok_or(FrameViolation::MissingMsg)?;

    Ok(RawEnvelope {
        msg_type: msg_type.to_string(),
        msg: msg.clone(),
    })
}

// ── Tests ───────────────────────────────────────────────────
