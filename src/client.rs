//! Signaling client: the peer side of the relay wire.
//!
//! The client runs single-threaded and cooperative: `pump_one` reads at
//! most one frame, decodes it, and dispatches it on the client's own
//! dispatcher instance before returning. Everything that waits (the local
//! token, a rendezvous response, the remote-token introduction) waits by
//! pumping, so subscribed handlers keep running while a request is pending.
//!
//! Rendezvous requests are correlated by request id: a success or error
//! carrying any other id is ignored, because concurrent attempts or stale
//! late responses would otherwise be misattributed.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::dispatcher::MessageDispatcher;
use crate::envelope::{
    decode_frame, ClientTokenPayload, Envelope, FrameViolation, RawEnvelope, CLIENT_TOKEN,
    CLOSE_CONNECTION, ERROR, ICE_CANDIDATE, REMOTE_TOKEN, SDP, SUCCESS,
};
use crate::negotiation::{
    CloseConnectionPayload, IceCandidate, IceCandidatePayload, SdpPayload, SessionDescription,
    SignalingPort,
};
use crate::rendezvous::{ErrorPayload, RemoteTokenPayload, SuccessPayload};
use crate::token::ClientToken;

// ── Constants ───────────────────────────────────────────────

/// Default timeout for a pending rendezvous request. The server mandates no
/// TTL; the client owns its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on a single blocking read, so deadlines stay responsive.
const READ_SLICE: Duration = Duration::from_millis(250);

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum ClientError {
    /// Could not reach or upgrade to the relay.
    Connect(String),
    /// Socket-level failure after connect.
    Transport(String),
    /// The server sent a frame violating the envelope contract.
    Protocol(FrameViolation),
    /// The relay closed the connection.
    ServerClosed,
    /// A wait expired.
    Timeout(&'static str),
    /// The rendezvous request was answered with a typed error.
    Rejected(ErrorPayload),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(detail) => write!(f, "connect failed: {detail}"),
            ClientError::Transport(detail) => write!(f, "transport error: {detail}"),
            ClientError::Protocol(violation) => write!(f, "protocol violation: {violation}"),
            ClientError::ServerClosed => write!(f, "server closed the connection"),
            ClientError::Timeout(what) => write!(f, "timed out waiting for {what}"),
            ClientError::Rejected(payload) => write!(f, "request rejected: {}", payload.description),
        }
    }
}

impl std::error::Error for ClientError {}

// ── Response correlation ────────────────────────────────────

/// Outcome of matching an inbound envelope against a pending request id.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMatch {
    /// Success with the matching id.
    Resolved(SuccessPayload),
    /// Error with the matching id.
    Rejected(ErrorPayload),
    /// Unrelated message, or a response to some other request: ignore it.
    Ignored,
}

/// Pure correlation rule for a pending rendezvous request: only a success
/// or error whose `requestID` equals `request_id` settles it.
pub fn match_response(request_id: &str, envelope: &RawEnvelope) -> ResponseMatch {
    match envelope.msg_type.as_str() {
        SUCCESS => match serde_json::from_value::<SuccessPayload>(envelope.msg.clone()) {
            Ok(payload) if payload.request_id == request_id => ResponseMatch::Resolved(payload),
            _ => ResponseMatch::Ignored,
        },
        ERROR => match serde_json::from_value::<ErrorPayload>(envelope.msg.clone()) {
            Ok(payload) if payload.request_id == request_id => ResponseMatch::Rejected(payload),
            _ => ResponseMatch::Ignored,
        },
        _ => ResponseMatch::Ignored,
    }
}

/// Generate a fresh rendezvous request id.
pub fn generate_request_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

// ── Signal sender ───────────────────────────────────────────

type ClientWs = WebSocket<MaybeTlsStream<TcpStream>>;

/// Cheap cloneable handle for writing envelopes to the relay. Shares the
/// client's socket; the mutex orders writes on it.
#[derive(Clone)]
pub struct SignalSender {
    socket: Arc<Mutex<ClientWs>>,
}

impl SignalSender {
    pub fn send_envelope<T: Serialize>(&self, envelope: &Envelope<T>) -> Result<(), ClientError> {
        let text = envelope
            .to_wire()
            .map_err(|e| ClientError::Transport(format!("serialize: {e}")))?;
        self.socket
            .lock()
            .unwrap()
            .send(Message::Text(text))
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Ask the relay to tell `remote_token` to tear its session down.
    pub fn send_close_connection(&self, remote_token: &str) -> Result<(), ClientError> {
        self.send_envelope(&Envelope::new(
            CLOSE_CONNECTION,
            CloseConnectionPayload {
                remote_token: remote_token.to_string(),
            },
        ))
    }
}

/// The negotiation engine signals through the same socket the client pumps.
impl SignalingPort for SignalSender {
    fn send_description(
        &self,
        remote_token: &str,
        description: &SessionDescription,
    ) -> Result<(), String> {
        self.send_envelope(&Envelope::new(
            SDP,
            SdpPayload {
                remote_token: remote_token.to_string(),
                description: description.clone(),
            },
        ))
        .map_err(|e| e.to_string())
    }

    fn send_candidate(&self, remote_token: &str, candidate: &IceCandidate) -> Result<(), String> {
        self.send_envelope(&Envelope::new(
            ICE_CANDIDATE,
            IceCandidatePayload {
                remote_token: remote_token.to_string(),
                ice_candidate: candidate.clone(),
            },
        ))
        .map_err(|e| e.to_string())
    }
}

// ── Client ──────────────────────────────────────────────────

/// A connected signaling client.
pub struct SignalClient {
    socket: Arc<Mutex<ClientWs>>,
    /// Subscriber table for inbound messages. Public so session code can
    /// subscribe `sdp` / `ice-candidate` / `close-connection` handlers.
    pub dispatcher: Arc<MessageDispatcher>,
    local_token: Option<ClientToken>,
}

impl SignalClient {
    /// Connect to the relay at `url` (e.g. `ws://127.0.0.1:4000`).
    pub fn connect(url: &str) -> Result<Self, ClientError> {
        eprintln!("[client] connecting to {url} ...");
        let (socket, _response) =
            tungstenite::connect(url).map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
            dispatcher: Arc::new(MessageDispatcher::new()),
            local_token: None,
        })
    }

    /// The token the relay assigned this connection, once received.
    pub fn local_token(&self) -> Option<&ClientToken> {
        self.local_token.as_ref()
    }

    /// A cloneable write handle over this client's socket.
    pub fn sender(&self) -> SignalSender {
        SignalSender {
            socket: Arc::clone(&self.socket),
        }
    }

    pub fn send_envelope<T: Serialize>(&self, envelope: &Envelope<T>) -> Result<(), ClientError> {
        self.sender().send_envelope(envelope)
    }

    /// Read and dispatch at most one frame before `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes with no frame. The frame
    /// is dispatched on the client's dispatcher *and* returned, so callers
    /// waiting for a specific message can inspect it directly.
    pub fn pump_one(&mut self, deadline: Instant) -> Result<Option<RawEnvelope>, ClientError> {
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Ok(None),
            };

            let result = {
                let mut socket = self.socket.lock().unwrap();
                set_read_timeout(&socket, remaining.min(READ_SLICE))?;
                socket.read()
            };

            let message = match result {
                Ok(message) => message,
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => return Err(ClientError::ServerClosed),
                Err(e) => return Err(ClientError::Transport(e.to_string())),
            };

            if message.is_ping() || message.is_pong() {
                continue;
            }
            if message.is_close() {
                return Err(ClientError::ServerClosed);
            }

            let text = match message {
                Message::Text(text) => text,
                other => {
                    return Err(ClientError::Transport(format!(
                        "unexpected non-text frame ({} bytes)",
                        other.len()
                    )))
                }
            };

            let raw = decode_frame(&text).map_err(ClientError::Protocol)?;

            if raw.msg_type == CLIENT_TOKEN {
                if let Ok(payload) =
                    serde_json::from_value::<ClientTokenPayload>(raw.msg.clone())
                {
                    eprintln!("[client] received local token {}", payload.token);
                    self.local_token = Some(payload.token);
                }
            }

            // Client-side dispatch has no sender token: the relay is the
            // only counterparty on this socket.
            self.dispatcher.dispatch("", &raw.msg_type, &raw.msg);
            return Ok(Some(raw));
        }
    }

    /// Wait (cooperatively pumping) for the relay's `client-token` envelope.
    pub fn wait_for_client_token(&mut self, timeout: Duration) -> Result<ClientToken, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = &self.local_token {
                return Ok(token.clone());
            }
            if self.pump_one(deadline)?.is_none() {
                return Err(ClientError::Timeout("client token"));
            }
        }
    }

    /// Ask the relay to introduce this connection to `remote_token`.
    ///
    /// Sends `remote-token` with a fresh request id and pumps until the
    /// matching success or error arrives. Responses carrying any other
    /// request id are ignored; `timeout` bounds the wait.
    pub fn request_remote_token(
        &mut self,
        remote_token: &str,
        timeout: Duration,
    ) -> Result<SuccessPayload, ClientError> {
        let request_id = generate_request_id();
        let request = Envelope::new(
            REMOTE_TOKEN,
            RemoteTokenPayload {
                request_id: Some(request_id.clone()),
                remote_token: remote_token.to_string(),
            },
        );
        self.send_envelope(&request)?;
        eprintln!("[client] sent remote token request for {remote_token}");

        let deadline = Instant::now() + timeout;
        loop {
            let raw = match self.pump_one(deadline)? {
                Some(raw) => raw,
                None => return Err(ClientError::Timeout("rendezvous response")),
            };
            match match_response(&request_id, &raw) {
                ResponseMatch::Resolved(success) => {
                    eprintln!("[client] rendezvous success: {}", success.description);
                    return Ok(success);
                }
                ResponseMatch::Rejected(error) => {
                    eprintln!("[client] rendezvous error: {}", error.description);
                    return Err(ClientError::Rejected(error));
                }
                ResponseMatch::Ignored => continue,
            }
        }
    }

    /// Passive side of the token exchange: wait for the relayed
    /// `remote-token` introduction and return the initiator's token.
    pub fn await_remote_token(&mut self, timeout: Duration) -> Result<ClientToken, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let raw = match self.pump_one(deadline)? {
                Some(raw) => raw,
                None => return Err(ClientError::Timeout("remote token introduction")),
            };
            if raw.msg_type != REMOTE_TOKEN {
                continue;
            }
            match serde_json::from_value::<RemoteTokenPayload>(raw.msg.clone()) {
                Ok(payload) => {
                    eprintln!("[client] introduced to remote token {}", payload.remote_token);
                    return Ok(payload.remote_token);
                }
                Err(e) => {
                    eprintln!("[client] dropping undecodable remote-token payload: {e}");
                    continue;
                }
            }
        }
    }
}

fn set_read_timeout(socket: &ClientWs, timeout: Duration) -> Result<(), ClientError> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp
            .set_read_timeout(Some(timeout))
            .map_err(|e| ClientError::Transport(e.to_string())),
        // No TLS variant is compiled in; a future TLS stream needs its own
        // timeout handling rather than silently blocking forever.
        #[allow(unreachable_patterns)]
        _ => Err(ClientError::Transport(
            "read timeout unsupported for this stream type".to_string(),
        )),
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(msg_type: &str, msg: serde_json::Value) -> RawEnvelope {
        RawEnvelope {
            msg_type: msg_type.to_string(),
            msg,
        }
    }

    #[test]
    fn matching_success_resolves() {
        let envelope = raw(SUCCESS, json!({"requestID": "r1", "description": "ok"}));
        match match_response("r1", &envelope) {
            ResponseMatch::Resolved(payload) => assert_eq!(payload.description, "ok"),
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[test]
    fn matching_error_rejects() {
        let envelope = raw(ERROR, json!({"requestID": "r1", "description": "missing"}));
        match match_response("r1", &envelope) {
            ResponseMatch::Rejected(payload) => assert_eq!(payload.description, "missing"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn stale_response_with_other_request_id_is_ignored() {
        let success = raw(SUCCESS, json!({"requestID": "r2", "description": "ok"}));
        assert_eq!(match_response("r1", &success), ResponseMatch::Ignored);

        let error = raw(ERROR, json!({"requestID": "r2", "description": "missing"}));
        assert_eq!(match_response("r1", &error), ResponseMatch::Ignored);
    }

    #[test]
    fn unrelated_message_types_are_ignored() {
        let envelope = raw("sdp", json!({"remoteToken": "AAAAA"}));
        assert_eq!(match_response("r1", &envelope), ResponseMatch::Ignored);
    }

    #[test]
    fn undecodable_response_payload_is_ignored() {
        let envelope = raw(SUCCESS, json!({"weird": true}));
        assert_eq!(match_response("r1", &envelope), ResponseMatch::Ignored);
    }

    #[test]
    fn request_ids_are_unique_and_well_formed() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
