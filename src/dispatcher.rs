//! Per-message-type subscriber lists and fan-out dispatch.
//!
//! Subscriptions are dispatcher-wide, not per connection: a handler
//! registered for `"sdp"` sees every inbound `sdp` envelope together with
//! the sending connection's token. Payloads cross the dispatcher as
//! untyped JSON; `subscribe_typed` layers a concrete schema on top, where a
//! decode failure drops that single message and nothing else.
//!
//! Dispatchers are injectable instances, one per relay process (and one per
//! signaling client), never globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;

// ── Handler identity ────────────────────────────────────────

/// Identifies one subscription for later removal. Issued by the dispatcher;
/// monotonically unique for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A subscriber: receives the sending connection's token and the payload.
/// Returning `Err` is logged and never stops fan-out to later handlers.
pub type MessageHandler = Arc<dyn Fn(&str, &serde_json::Value) -> Result<(), String> + Send + Sync>;

type HandlerList = Arc<Mutex<Vec<(HandlerId, MessageHandler)>>>;

// ── Dispatcher ──────────────────────────────────────────────

/// Routes decoded envelopes to the subscribers of their message type.
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<String, HandlerList>>,
    next_id: AtomicU64,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `msg_type`. Returns the id used to
    /// unsubscribe it later.
    pub fn subscribe(&self, msg_type: &str, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let list = self.handler_list(msg_type);
        list.lock().unwrap().push((id, handler));
        id
    }

    /// Register a handler that receives the payload decoded as `T`.
    ///
    /// A payload that fails to decode is logged and dropped; the
    /// connection stays open and other message types are unaffected.
    pub fn subscribe_typed<T, F>(&self, msg_type: &str, handler: F) -> HandlerId
    where
        T: DeserializeOwned,
        F: Fn(&str, T) -> Result<(), String> + Send + Sync + 'static,
    {
        let msg_type_owned = msg_type.to_string();
        self.subscribe(
            msg_type,
            Arc::new(move |sender, payload| {
                let typed: T = match serde_json::from_value(payload.clone()) {
                    Ok(typed) => typed,
                    Err(e) => {
                        eprintln!(
                            "[dispatcher] dropping undecodable '{msg_type_owned}' payload from {sender}: {e}"
                        );
                        return Ok(());
                    }
                };
                handler(sender, typed)
            }),
        )
    }

    /// Remove a previously-registered handler.
    ///
    /// Unsubscribing an id that is not registered for `msg_type` is a usage
    /// error: assertion failure in debug, logged anomaly in release.
    pub fn unsubscribe(&self, msg_type: &str, id: HandlerId) {
        let list = match self.handlers.read().unwrap().get(msg_type) {
            Some(list) => Arc::clone(list),
            None => {
                debug_assert!(false, "unsubscribe from unknown type {msg_type}");
                eprintln!("[dispatcher] anomaly: unsubscribe from unknown type {msg_type}");
                return;
            }
        };

        let mut list = list.lock().unwrap();
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        if list.len() == before {
            debug_assert!(false, "unsubscribe of unregistered handler for {msg_type}");
            eprintln!("[dispatcher] anomaly: unsubscribe of unregistered handler for {msg_type}");
        }
    }

    /// Invoke every subscriber of `msg_type` with `(sender_token, payload)`.
    ///
    /// Returns the number of handlers invoked; zero subscribers is a
    /// normal, silent drop. Fan-out iterates a snapshot taken under the
    /// list lock, so subscribe/unsubscribe never race an in-flight
    /// dispatch; they take effect from the next message.
    pub fn dispatch(&self, sender_token: &str, msg_type: &str, payload: &serde_json::Value) -> usize {
        let list = match self.handlers.read().unwrap().get(msg_type) {
            Some(list) => Arc::clone(list),
            None => return 0,
        };

        let snapshot: Vec<MessageHandler> = list
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &snapshot {
            if let Err(e) = handler(sender_token, payload) {
                eprintln!("[dispatcher] handler for '{msg_type}' failed: {e}");
            }
        }
        snapshot.len()
    }

    fn handler_list(&self, msg_type: &str) -> HandlerList {
        if let Some(list) = self.handlers.read().unwrap().get(msg_type) {
            return Arc::clone(list);
        }
        let mut map = self.handlers.write().unwrap();
        Arc::clone(
            map.entry(msg_type.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new()))),
        )
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────
