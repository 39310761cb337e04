//! Relay process: accepts WebSocket connections, registers them, and feeds
//! decoded envelopes into the dispatcher.
//!
//! Each accepted connection gets its own thread running a polling read
//! loop. The loop enforces the inbound frame contract: a frame that is not
//! a `{type, msg}` object closes the connection with an invalid-payload
//! status, and a frame above the configured size ceiling closes it with a
//! message-too-big status. Undecodable payloads for a known type are the
//! dispatcher's concern and never close the connection.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

use crate::dispatcher::MessageDispatcher;
use crate::envelope::{decode_frame, ClientTokenPayload, CloseStatus, Envelope, CLIENT_TOKEN};
use crate::registry::{ConnectionRegistry, EvictionPolicy, Transport, TransportError};

// ── Constants ───────────────────────────────────────────────

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 4000;

/// Default maximum inbound message size. Frames above this close the
/// connection with a message-too-big status.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 65_536;

/// Read timeout for the polling loop. Each pass holds the socket mutex for
/// at most this long, so relayed sends to the same peer interleave with
/// reads instead of starving.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause between empty read passes, with the socket mutex released.
const POLL_PAUSE: Duration = Duration::from_millis(2);

// ── Config ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub max_message_bytes: usize,
    pub eviction: EvictionPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            eviction: EvictionPolicy::Keep,
        }
    }
}

// ── WebSocket transport ─────────────────────────────────────

type WsStream = WebSocket<TcpStream>;

/// Map the close taxonomy to WebSocket close codes.
fn close_code(status: CloseStatus) -> CloseCode {
    match status {
        CloseStatus::Normal => CloseCode::Normal,
        CloseStatus::InvalidPayload => CloseCode::Invalid,
        CloseStatus::MessageTooBig => CloseCode::Size,
    }
}

fn close_reason(status: CloseStatus) -> &'static str {
    match status {
        CloseStatus::Normal => "",
        CloseStatus::InvalidPayload => "invalid payload",
        CloseStatus::MessageTooBig => "message too big",
    }
}

/// Registry-facing handle over a shared server-side WebSocket. The socket
/// mutex is what orders concurrent sends to the same peer.
struct WsTransport {
    socket: Arc<Mutex<WsStream>>,
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        let mut socket = self.socket.lock().unwrap();
        socket
            .send(Message::Text(text.to_string()))
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    TransportError::Closed
                }
                other => TransportError::Io(other.to_string()),
            })
    }

    fn close(&mut self, status: CloseStatus) {
        let mut socket = self.socket.lock().unwrap();
        let frame = CloseFrame {
            code: close_code(status),
            reason: close_reason(status).into(),
        };
        // Best effort: the peer may already be gone.
        let _ = socket.close(Some(frame));
        let _ = socket.flush();
    }
}

// ── Serve loop ──────────────────────────────────────────────

/// Accept connections forever, one receive thread per connection.
///
/// The registry and dispatcher are shared across all connection threads;
/// callers attach the rendezvous service (or any other subscriber set)
/// before serving.
pub fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    config: RelayConfig,
) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let registry = Arc::clone(&registry);
                let dispatcher = Arc::clone(&dispatcher);
                let config = config.clone();
                thread::spawn(move || client_session(stream, registry, dispatcher, config));
            }
            Err(e) => {
                eprintln!("[relay] accept error: {e}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

/// Serve one client connection: upgrade, register, read until the
/// connection ends, then remove the registration exactly once.
fn client_session(
    stream: TcpStream,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    config: RelayConfig,
) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("[relay] WebSocket handshake failed for {peer_addr}: {e}");
            return;
        }
    };

    if let Err(e) = socket.get_ref().set_read_timeout(Some(POLL_READ_TIMEOUT)) {
        eprintln!("[relay] set_read_timeout failed for {peer_addr}: {e}");
        return;
    }

    let socket = Arc::new(Mutex::new(socket));
    let token = registry.add(Box::new(WsTransport {
        socket: Arc::clone(&socket),
    }));
    eprintln!("[relay] {peer_addr} connected, token {token}");

    // The owner learns its address immediately after registration.
    registry.send(&token, &Envelope::new(CLIENT_TOKEN, ClientTokenPayload { token: token.clone() }));

    receive_loop(&socket, &token, &dispatcher, &config);

    registry.remove(&token);
    eprintln!("[relay] {peer_addr} disconnected, token {token} released");
}

/// Poll the socket for inbound frames and dispatch them until the
/// connection ends (gracefully or by protocol violation).
fn receive_loop(
    socket: &Arc<Mutex<WsStream>>,
    token: &str,
    dispatcher: &MessageDispatcher,
    config: &RelayConfig,
) {
    loop {
        let result = {
            let mut socket = socket.lock().unwrap();
            socket.read()
        };

        let message = match result {
            Ok(message) => message,
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                thread::sleep(POLL_PAUSE);
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return;
            }
            Err(tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            )) => {
                eprintln!("[relay] {token} reset without close handshake");
                return;
            }
            Err(e) => {
                eprintln!("[relay] {token} read error: {e}");
                return;
            }
        };

        if message.is_ping() || message.is_pong() {
            continue;
        }
        if message.is_close() {
            return;
        }

        let text = match message {
            Message::Text(text) => text,
            // The signaling wire is text-only JSON.
            other => {
                eprintln!(
                    "[relay] {token} sent non-text frame ({} bytes), closing",
                    other.len()
                );
                close_session(socket, CloseStatus::InvalidPayload);
                return;
            }
        };

        if text.len() > config.max_message_bytes {
            eprintln!(
                "[relay] {token} frame of {} bytes exceeds cap {}, closing",
                text.len(),
                config.max_message_bytes
            );
            close_session(socket, CloseStatus::MessageTooBig);
            return;
        }

        match decode_frame(&text) {
            Ok(raw) => {
                let handled = dispatcher.dispatch(token, &raw.msg_type, &raw.msg);
                eprintln!(
                    "[relay] from {token}: '{}' -> {handled} handler(s)",
                    raw.msg_type
                );
            }
            Err(violation) => {
                eprintln!("[relay] {token} protocol violation: {violation}, closing");
                close_session(socket, violation.close_status());
                return;
            }
        }
    }
}

fn close_session(socket: &Arc<Mutex<WsStream>>, status: CloseStatus) {
    WsTransport {
        socket: Arc::clone(socket),
    }
    .close(status);
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_match_taxonomy() {
        assert_eq!(close_code(CloseStatus::Normal), CloseCode::Normal);
        assert_eq!(close_code(CloseStatus::InvalidPayload), CloseCode::Invalid);
        assert_eq!(close_code(CloseStatus::MessageTooBig), CloseCode::Size);
    }

    #[test]
    fn default_config_values() {
        let config = RelayConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(config.eviction, EvictionPolicy::Keep);
    }
}
