//! Connection registry: opaque token → live bidirectional transport.
//!
//! The registry is the relay's sole addressing structure. It issues unique
//! tokens at accept time, validates remote tokens for the rendezvous
//! service, and serializes outbound envelopes onto the owning transport.
//!
//! Registries are explicitly owned, injectable instances: construct one per
//! relay process (or per test) rather than reaching for a global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::envelope::{CloseStatus, Envelope};
use crate::token::{generate_token, ClientToken};

// ── Transport seam ──────────────────────────────────────────

/// Write errors a transport can report. Callers treat any failure as a
/// silent drop, never as proof the peer disappeared.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The transport is already closed.
    Closed,
    /// Underlying socket error.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(detail) => write!(f, "transport I/O error: {detail}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A live bidirectional transport bound to one token.
///
/// The relay wires a WebSocket-backed implementation; tests inject mocks.
/// Implementations must serialize writes internally so two frames to the
/// same peer never interleave.
pub trait Transport: Send {
    /// Write one text frame.
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the transport with the given status. Idempotent.
    fn close(&mut self, status: CloseStatus);
}

// ── Eviction policy ─────────────────────────────────────────

/// What a failed send does to the token binding.
///
/// A failed write does not prove the peer is gone, so `Keep` is the
/// default; `Evict` drops the binding immediately on the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Keep,
    Evict,
}

// ── Registry ────────────────────────────────────────────────

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Maps active connection tokens to their transports.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ClientToken, SharedTransport>>,
    eviction: EvictionPolicy,
}

impl ConnectionRegistry {
    pub fn new(eviction: EvictionPolicy) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            eviction,
        }
    }

    /// Insert `transport` under a freshly generated token and return it.
    ///
    /// The map lock is held across generate-check-insert, so a returned
    /// token is never simultaneously bound to a different live transport.
    /// Collisions with live tokens are retried.
    pub fn add(&self, transport: Box<dyn Transport>) -> ClientToken {
        let mut connections = self.connections.lock().unwrap();
        let token = loop {
            let candidate = generate_token();
            if !connections.contains_key(&candidate) {
                break candidate;
            }
        };
        connections.insert(token.clone(), Arc::new(Mutex::new(transport)));
        token
    }

    /// Remove the binding for `token`, freeing it for reuse.
    ///
    /// Removing an absent token indicates a double-close bug: assertion
    /// failure in debug builds, logged anomaly in release.
    pub fn remove(&self, token: &str) {
        let removed = self.connections.lock().unwrap().remove(token);
        if removed.is_none() {
            debug_assert!(false, "removed unknown token {token}");
            eprintln!("[registry] anomaly: removed unknown token {token}");
        }
    }

    /// Non-blocking membership test.
    pub fn exists(&self, token: &str) -> bool {
        self.connections.lock().unwrap().contains_key(token)
    }

    /// Number of currently-active connections.
    pub fn active_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Serialize `message` and write it to the transport bound to `token`.
    ///
    /// Returns `false` if the token is unknown, serialization fails, or the
    /// write fails. The map lock is released before the socket write so a
    /// slow peer never stalls unrelated registry operations.
    pub fn send<T: Serialize>(&self, token: &str, message: &Envelope<T>) -> bool {
        let text = match message.to_wire() {
            Ok(text) => text,
            Err(e) => {
                eprintln!("[registry] serialize for {token} failed: {e}");
                return false;
            }
        };

        let transport = match self.connections.lock().unwrap().get(token) {
            Some(transport) => Arc::clone(transport),
            None => return false,
        };

        let result = transport.lock().unwrap().send_text(&text);
        match result {
            Ok(()) => true,
            Err(e) => {
                eprintln!("[registry] send to {token} failed: {e}");
                if self.eviction == EvictionPolicy::Evict {
                    self.connections.lock().unwrap().remove(token);
                    eprintln!("[registry] evicted {token} after failed send");
                }
                false
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(EvictionPolicy::Keep)
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::thread;

    use crate::token::TOKEN_LENGTH;
    use serde_json::json;

    /// Records sent frames; optionally fails every write.
    struct MockTransport {
        sent: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl MockTransport {
        fn recording() -> (Box<dyn Transport>, Arc<Mutex<Vec<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let transport = Box::new(MockTransport {
                sent: Arc::clone(&sent),
                fail: false,
            });
            (transport, sent)
        }

        fn failing() -> Box<dyn Transport> {
            Box::new(MockTransport {
                sent: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            })
        }
    }

    impl Transport for MockTransport {
        fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Io("mock failure".to_string()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn close(&mut self, _status: CloseStatus) {}
    }

    #[test]
    fn add_returns_well_formed_token() {
        let registry = ConnectionRegistry::default();
        let (transport, _) = MockTransport::recording();
        let token = registry.add(transport);
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(registry.exists(&token));
    }

    #[test]
    fn concurrently_added_tokens_are_pairwise_distinct() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let tx = tx.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let (transport, _) = MockTransport::recording();
                        tx.send(registry.add(transport)).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);
        for handle in handles {
            handle.join().unwrap();
        }

        let tokens: Vec<ClientToken> = rx.iter().collect();
        let distinct: HashSet<&ClientToken> = tokens.iter().collect();
        assert_eq!(tokens.len(), 400);
        assert_eq!(distinct.len(), 400, "token collision among live connections");
        assert_eq!(registry.active_count(), 400);
    }

    #[test]
    fn removed_token_is_freed() {
        let registry = ConnectionRegistry::default();
        let (transport, _) = MockTransport::recording();
        let token = registry.add(transport);
        registry.remove(&token);
        assert!(!registry.exists(&token));
        assert_eq!(registry.active_count(), 0);

        // The slot is free again; new adds proceed normally.
        let (transport, _) = MockTransport::recording();
        let fresh = registry.add(transport);
        assert!(registry.exists(&fresh));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "removed unknown token")]
    fn double_remove_asserts_in_debug() {
        let registry = ConnectionRegistry::default();
        let (transport, _) = MockTransport::recording();
        let token = registry.add(transport);
        registry.remove(&token);
        registry.remove(&token);
    }

    #[test]
    fn send_writes_serialized_envelope() {
        let registry = ConnectionRegistry::default();
        let (transport, sent) = MockTransport::recording();
        let token = registry.add(transport);

        let delivered = registry.send(&token, &Envelope::new("success", json!({"ok": true})));
        assert!(delivered);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(r#""type":"success"#));
    }

    #[test]
    fn send_to_unknown_token_fails_quietly() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.send("ZZZZZ", &Envelope::new("success", json!({}))));
    }

    #[test]
    fn failed_send_keeps_binding_by_default() {
        let registry = ConnectionRegistry::default();
        let token = registry.add(MockTransport::failing());
        assert!(!registry.send(&token, &Envelope::new("success", json!({}))));
        assert!(registry.exists(&token), "Keep policy must not evict");
    }

    #[test]
    fn failed_send_evicts_under_evict_policy() {
        let registry = ConnectionRegistry::new(EvictionPolicy::Evict);
        let token = registry.add(MockTransport::failing());
        assert!(!registry.send(&token, &Envelope::new("success", json!({}))));
        assert!(!registry.exists(&token), "Evict policy must drop the binding");
    }
}
