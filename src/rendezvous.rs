//! Rendezvous service: token exchange and peer-to-peer signal relay.
//!
//! Sits on top of the dispatcher and the connection registry. The token
//! exchange introduces two connections to each other: the initiator asks
//! for a remote token, and on success the target receives the initiator's
//! token under the same field name, completing a token swap. After that both
//! peers signal each other through the verbatim `sdp` / `ice-candidate`
//! relays, and `close-connection` tears a session down.
//!
//! The service holds no per-request state: success/error correlation by
//! request id is entirely the client's concern.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatcher::{HandlerId, MessageDispatcher};
use crate::envelope::{Envelope, CLOSE_CONNECTION, ERROR, ICE_CANDIDATE, REMOTE_TOKEN, SDP, SUCCESS};
use crate::registry::ConnectionRegistry;
use crate::token::ClientToken;

// ── Payload DTOs ────────────────────────────────────────────

/// `remote-token` payload. Client → server as a request; server → target as
/// the swapped delivery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteTokenPayload {
    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
    #[serde(rename = "remoteToken")]
    pub remote_token: ClientToken,
}

/// `success` payload, server → initiator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuccessPayload {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub description: String,
}

/// `error` payload, server → initiator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actual: Option<String>,
}

// ── Service ─────────────────────────────────────────────────

/// The attached rendezvous handlers. Keeps the subscription ids so tests
/// can detach cleanly.
pub struct RendezvousService {
    subscriptions: Vec<(&'static str, HandlerId)>,
}

impl RendezvousService {
    /// Subscribe the rendezvous handlers on `dispatcher`, relaying through
    /// `registry`.
    pub fn attach(dispatcher: &MessageDispatcher, registry: Arc<ConnectionRegistry>) -> Self {
        let mut subscriptions = Vec::new();

        let reg = Arc::clone(&registry);
        subscriptions.push((
            REMOTE_TOKEN,
            dispatcher.subscribe_typed::<RemoteTokenPayload, _>(REMOTE_TOKEN, move |sender, req| {
                handle_remote_token(&reg, sender, req);
                Ok(())
            }),
        ));

        let reg = Arc::clone(&registry);
        subscriptions.push((
            ICE_CANDIDATE,
            dispatcher.subscribe(
                ICE_CANDIDATE,
                Arc::new(move |sender, payload| {
                    relay_to_remote(&reg, sender, ICE_CANDIDATE, payload);
                    Ok(())
                }),
            ),
        ));

        let reg = Arc::clone(&registry);
        subscriptions.push((
            SDP,
            dispatcher.subscribe(
                SDP,
                Arc::new(move |sender, payload| {
                    relay_to_remote(&reg, sender, SDP, payload);
                    Ok(())
                }),
            ),
        ));

        let reg = registry;
        subscriptions.push((
            CLOSE_CONNECTION,
            dispatcher.subscribe(
                CLOSE_CONNECTION,
                Arc::new(move |sender, payload| {
                    relay_to_remote(&reg, sender, CLOSE_CONNECTION, payload);
                    Ok(())
                }),
            ),
        ));

        Self { subscriptions }
    }

    /// Remove the service's subscriptions from `dispatcher`.
    pub fn detach(self, dispatcher: &MessageDispatcher) {
        for (msg_type, id) in self.subscriptions {
            dispatcher.unsubscribe(msg_type, id);
        }
    }
}

// ── Handlers ────────────────────────────────────────────────

/// Token-exchange request. Reports success or error to the initiator only;
/// on success the target additionally receives the initiator's token.
fn handle_remote_token(registry: &ConnectionRegistry, sender: &str, req: RemoteTokenPayload) {
    eprintln!("[rendezvous] from {sender}: remote token request");
    let request_id = req.request_id.unwrap_or_default();
    let remote_token = req.remote_token;

    if !registry.exists(&remote_token) {
        let error = Envelope::new(
            ERROR,
            ErrorPayload {
                request_id,
                description: format!("Remote token {remote_token} does not exist"),
                expected: None,
                actual: None,
            },
        );
        registry.send(sender, &error);
        eprintln!("[rendezvous] to {sender}: ERROR: remote token {remote_token} does not exist");
        return;
    }

    let success = Envelope::new(
        SUCCESS,
        SuccessPayload {
            request_id: request_id.clone(),
            description: format!("Token {remote_token} exists, OK"),
        },
    );
    registry.send(sender, &success);
    eprintln!("[rendezvous] to {sender}: SUCCESS: remote token {remote_token} exists");

    // Token swap: the target learns the initiator's token under the same
    // field name it would have sent itself.
    let delivery = Envelope::new(
        REMOTE_TOKEN,
        RemoteTokenPayload {
            request_id: Some(request_id),
            remote_token: sender.to_string(),
        },
    );
    registry.send(&remote_token, &delivery);
    eprintln!("[rendezvous] to {remote_token}: remote token delivery");
}

/// Verbatim relay: forward `payload` to the token in its `remoteToken`
/// field, with that field rewritten to the sender's token. Everything else
/// in the payload passes through untouched; the relay never inspects
/// descriptions or candidates.
fn relay_to_remote(
    registry: &ConnectionRegistry,
    sender: &str,
    msg_type: &str,
    payload: &serde_json::Value,
) {
    let target = match payload.get("remoteToken").and_then(|v| v.as_str()) {
        Some(target) => target.to_string(),
        None => {
            eprintln!("[rendezvous] dropping '{msg_type}' from {sender}: no remoteToken field");
            return;
        }
    };

    let mut rewritten = payload.clone();
    match rewritten.as_object_mut() {
        Some(object) => {
            object.insert(
                "remoteToken".to_string(),
                serde_json::Value::String(sender.to_string()),
            );
        }
        None => {
            eprintln!("[rendezvous] dropping '{msg_type}' from {sender}: payload not an object");
            return;
        }
    }

    // A failed send is a silent drop; the sender learns nothing and the
    // registry's eviction policy decides whether the binding survives.
    if registry.send(&target, &Envelope::new(msg_type, rewritten)) {
        eprintln!("[rendezvous] relayed '{msg_type}' {sender} -> {target}");
    } else {
        eprintln!("[rendezvous] relay '{msg_type}' {sender} -> {target} failed, dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::envelope::CloseStatus;
    use crate::registry::{Transport, TransportError};

    struct RecordingTransport {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for RecordingTransport {
        fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn close(&mut self, _status: CloseStatus) {}
    }

    struct Fixture {
        dispatcher: MessageDispatcher,
        registry: Arc<ConnectionRegistry>,
        _service: RendezvousService,
    }

    impl Fixture {
        fn new() -> Self {
            let dispatcher = MessageDispatcher::new();
            let registry = Arc::new(ConnectionRegistry::default());
            let service = RendezvousService::attach(&dispatcher, Arc::clone(&registry));
            Self {
                dispatcher,
                registry,
                _service: service,
            }
        }

        fn connect(&self) -> (ClientToken, Arc<Mutex<Vec<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let token = self.registry.add(Box::new(RecordingTransport {
                sent: Arc::clone(&sent),
            }));
            (token, sent)
        }
    }

    fn parse_all(sent: &Arc<Mutex<Vec<String>>>) -> Vec<serde_json::Value> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    #[test]
    fn token_exchange_happy_path_swaps_tokens() {
        let fx = Fixture::new();
        let (token_a, sent_a) = fx.connect();
        let (token_b, sent_b) = fx.connect();

        fx.dispatcher.dispatch(
            &token_a,
            REMOTE_TOKEN,
            &json!({"requestID": "req-1", "remoteToken": token_b}),
        );

        let to_a = parse_all(&sent_a);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], SUCCESS);
        assert_eq!(to_a[0]["msg"]["requestID"], "req-1");

        let to_b = parse_all(&sent_b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], REMOTE_TOKEN);
        assert_eq!(to_b[0]["msg"]["requestID"], "req-1");
        assert_eq!(to_b[0]["msg"]["remoteToken"], token_a.as_str());
    }

    #[test]
    fn token_exchange_miss_reports_error_to_initiator_only() {
        let fx = Fixture::new();
        let (token_a, sent_a) = fx.connect();
        let (_token_b, sent_b) = fx.connect();

        fx.dispatcher.dispatch(
            &token_a,
            REMOTE_TOKEN,
            &json!({"requestID": "req-2", "remoteToken": "ZZZZZ"}),
        );

        let to_a = parse_all(&sent_a);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], ERROR);
        assert_eq!(to_a[0]["msg"]["requestID"], "req-2");
        assert!(to_a[0]["msg"]["description"]
            .as_str()
            .unwrap()
            .contains("does not exist"));

        assert!(sent_b.lock().unwrap().is_empty(), "bystander must see nothing");
    }

    #[test]
    fn sdp_relay_rewrites_token_and_preserves_description() {
        let fx = Fixture::new();
        let (token_a, _sent_a) = fx.connect();
        let (token_b, sent_b) = fx.connect();

        let description = json!({"type": "offer", "sdp": "v=0\r\no=- 42 2 IN IP4 127.0.0.1"});
        fx.dispatcher.dispatch(
            &token_a,
            SDP,
            &json!({"remoteToken": token_b, "description": description}),
        );

        let to_b = parse_all(&sent_b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], SDP);
        assert_eq!(to_b[0]["msg"]["remoteToken"], token_a.as_str());
        assert_eq!(to_b[0]["msg"]["description"], description);
    }

    #[test]
    fn ice_candidate_relay_rewrites_token_and_preserves_candidate() {
        let fx = Fixture::new();
        let (token_a, _sent_a) = fx.connect();
        let (token_b, sent_b) = fx.connect();

        let candidate = json!({
            "candidate": "candidate:1 1 UDP 2122252543 192.168.1.10 51472 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        fx.dispatcher.dispatch(
            &token_a,
            ICE_CANDIDATE,
            &json!({"remoteToken": token_b, "iceCandidate": candidate}),
        );

        let to_b = parse_all(&sent_b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], ICE_CANDIDATE);
        assert_eq!(to_b[0]["msg"]["remoteToken"], token_a.as_str());
        assert_eq!(to_b[0]["msg"]["iceCandidate"], candidate);
    }

    #[test]
    fn close_connection_is_relayed_to_the_addressed_peer() {
        let fx = Fixture::new();
        let (token_a, _sent_a) = fx.connect();
        let (token_b, sent_b) = fx.connect();

        fx.dispatcher
            .dispatch(&token_a, CLOSE_CONNECTION, &json!({"remoteToken": token_b}));

        let to_b = parse_all(&sent_b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], CLOSE_CONNECTION);
        assert_eq!(to_b[0]["msg"]["remoteToken"], token_a.as_str());
    }

    #[test]
    fn relay_without_remote_token_field_is_dropped() {
        let fx = Fixture::new();
        let (token_a, sent_a) = fx.connect();
        let (_token_b, sent_b) = fx.connect();

        fx.dispatcher
            .dispatch(&token_a, SDP, &json!({"description": {"type": "offer"}}));

        assert!(sent_a.lock().unwrap().is_empty());
        assert!(sent_b.lock().unwrap().is_empty());
    }

    #[test]
    fn relay_to_departed_peer_is_a_silent_drop() {
        let fx = Fixture::new();
        let (token_a, sent_a) = fx.connect();
        let (token_b, _sent_b) = fx.connect();
        fx.registry.remove(&token_b);

        fx.dispatcher.dispatch(
            &token_a,
            SDP,
            &json!({"remoteToken": token_b, "description": {"type": "offer", "sdp": ""}}),
        );

        // No error envelope, no panic: the drop is silent for the sender.
        assert!(sent_a.lock().unwrap().is_empty());
    }

    #[test]
    fn detach_removes_all_handlers() {
        let dispatcher = MessageDispatcher::new();
        let registry = Arc::new(ConnectionRegistry::default());
        let service = RendezvousService::attach(&dispatcher, Arc::clone(&registry));
        service.detach(&dispatcher);

        assert_eq!(
            dispatcher.dispatch("AAAAA", REMOTE_TOKEN, &json!({"remoteToken": "BBBBB"})),
            0
        );
    }
}
