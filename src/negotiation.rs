//! Perfect-negotiation engine: two peers agree on session descriptions and
//! transport candidates with no coordinator.
//!
//! Each peer runs one engine per session. The polite/impolite role is fixed
//! at construction from the token order and resolves simultaneous offers
//! deterministically: the impolite peer drops a colliding incoming offer,
//! the polite peer rolls with it and answers. The `making_offer` /
//! `awaiting_answer` flags are cooperative markers for a single-threaded
//! event loop: they must be set before the first suspension point of an
//! operation and cleared after the last, and they are deliberately not a
//! multi-threaded locking scheme.
//!
//! The engine talks to the actual RTC stack through `PeerTransport` and to
//! the relay through `SignalingPort`; it never inspects SDP or candidates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::dispatcher::{HandlerId, MessageDispatcher};
use crate::envelope::{CLOSE_CONNECTION, ICE_CANDIDATE, SDP};
use crate::token::{is_polite, ClientToken};

// ── Wire shapes ─────────────────────────────────────────────

/// SDP description type string for offers.
pub const SDP_TYPE_OFFER: &str = "offer";
/// SDP description type string for answers.
pub const SDP_TYPE_ANSWER: &str = "answer";

/// A session description as it crosses the signaling wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: &str) -> Self {
        Self {
            sdp_type: SDP_TYPE_OFFER.to_string(),
            sdp: sdp.to_string(),
        }
    }

    pub fn answer(sdp: &str) -> Self {
        Self {
            sdp_type: SDP_TYPE_ANSWER.to_string(),
            sdp: sdp.to_string(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SDP_TYPE_OFFER
    }
}

/// A transport candidate as it crosses the signaling wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// `sdp` message payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SdpPayload {
    #[serde(rename = "remoteToken")]
    pub remote_token: ClientToken,
    pub description: SessionDescription,
}

/// `ice-candidate` message payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IceCandidatePayload {
    #[serde(rename = "remoteToken")]
    pub remote_token: ClientToken,
    #[serde(rename = "iceCandidate")]
    pub ice_candidate: IceCandidate,
}

/// `close-connection` message payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloseConnectionPayload {
    #[serde(rename = "remoteToken")]
    pub remote_token: ClientToken,
}

// ── Seams ───────────────────────────────────────────────────

/// Signaling states the engine cares about; mirrors the RTC stack's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// The engine's view of the local RTC stack.
///
/// `create_local_description` produces an offer or an answer depending on
/// the current signaling state, like the browser's argument-less
/// `setLocalDescription`.
pub trait PeerTransport {
    fn signaling_state(&self) -> SignalingState;
    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<(), String>;
    fn create_local_description(&mut self) -> Result<SessionDescription, String>;
    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), String>;
    fn close(&mut self);
}

/// The engine's view of the signaling channel.
pub trait SignalingPort {
    fn send_description(
        &self,
        remote_token: &str,
        description: &SessionDescription,
    ) -> Result<(), String>;
    fn send_candidate(&self, remote_token: &str, candidate: &IceCandidate) -> Result<(), String>;
}

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum NegotiationError {
    /// The RTC stack rejected a description operation.
    Transport(String),
    /// Sending a description over the signaling channel failed.
    Signaling(String),
    /// A candidate failed to apply outside an ignored-offer window.
    CandidateFailed(String),
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::Transport(detail) => write!(f, "transport error: {detail}"),
            NegotiationError::Signaling(detail) => write!(f, "signaling error: {detail}"),
            NegotiationError::CandidateFailed(detail) => {
                write!(f, "candidate failed to apply: {detail}")
            }
        }
    }
}

impl std::error::Error for NegotiationError {}

// ── Engine ──────────────────────────────────────────────────

/// Observable lifecycle of a negotiation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Stable,
}

pub struct NegotiationEngine<T: PeerTransport, S: SignalingPort> {
    remote_token: ClientToken,
    polite: bool,
    transport: T,
    signaling: S,
    making_offer: bool,
    ignore_offer: bool,
    awaiting_answer: bool,
    closed: bool,
}

impl<T: PeerTransport, S: SignalingPort> NegotiationEngine<T, S> {
    /// Politeness is computed once from the token order and never changes
    /// for the session's lifetime.
    pub fn new(local_token: &str, remote_token: &str, transport: T, signaling: S) -> Self {
        let polite = is_polite(local_token, remote_token);
        eprintln!(
            "[negotiation] session with {remote_token}: this peer is {}",
            if polite { "polite" } else { "impolite" }
        );
        Self {
            remote_token: remote_token.to_string(),
            polite,
            transport,
            signaling,
            making_offer: false,
            ignore_offer: false,
            awaiting_answer: false,
            closed: false,
        }
    }

    pub fn remote_token(&self) -> &str {
        &self.remote_token
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> NegotiationState {
        if self.closed {
            NegotiationState::Idle
        } else if self.making_offer || self.transport.signaling_state() != SignalingState::Stable {
            NegotiationState::Negotiating
        } else {
            NegotiationState::Stable
        }
    }

    /// Local negotiation-needed trigger: produce and send an offer.
    ///
    /// `making_offer` guards local offer creation only, not delivery: it is
    /// set before the description is produced and cleared once the send has
    /// been attempted, whether or not the send succeeded.
    pub fn on_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if self.closed {
            return Ok(());
        }
        eprintln!("[negotiation] making offer for {}", self.remote_token);

        self.making_offer = true;
        let outcome = self.produce_and_send_offer();
        self.making_offer = false;
        outcome
    }

    fn produce_and_send_offer(&mut self) -> Result<(), NegotiationError> {
        let offer = self
            .transport
            .create_local_description()
            .map_err(NegotiationError::Transport)?;
        if self.closed {
            // Closed while the description was being produced: discard.
            return Ok(());
        }
        self.signaling
            .send_description(&self.remote_token, &offer)
            .map_err(NegotiationError::Signaling)
    }

    /// A description arrived from the remote peer.
    pub fn on_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.closed {
            eprintln!("[negotiation] discarding description after teardown");
            return Ok(());
        }

        let is_offer = description.is_offer();
        let ready_for_offer = !self.making_offer
            && (self.transport.signaling_state() == SignalingState::Stable || self.awaiting_answer);
        let collision = is_offer && !ready_for_offer;

        self.ignore_offer = !self.polite && collision;
        if self.ignore_offer {
            // Expected collision resolution, not an error.
            eprintln!("[negotiation] impolite peer ignoring colliding offer");
            return Ok(());
        }

        self.awaiting_answer = description.sdp_type == SDP_TYPE_ANSWER;
        let applied = self.transport.set_remote_description(&description);
        self.awaiting_answer = false;
        applied.map_err(NegotiationError::Transport)?;

        if self.closed {
            // Closed while the description was being applied: stop here.
            return Ok(());
        }

        if is_offer {
            eprintln!("[negotiation] answering offer from {}", self.remote_token);
            let answer = self
                .transport
                .create_local_description()
                .map_err(NegotiationError::Transport)?;
            self.signaling
                .send_description(&self.remote_token, &answer)
                .map_err(NegotiationError::Signaling)?;
        }
        Ok(())
    }

    /// A transport candidate arrived from the remote peer.
    ///
    /// A failure to apply is expected while an ignored offer's candidates
    /// trickle in; outside that window it is a genuine error.
    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.closed {
            eprintln!("[negotiation] discarding candidate after teardown");
            return Ok(());
        }
        if let Err(detail) = self.transport.add_remote_candidate(&candidate) {
            if self.ignore_offer {
                eprintln!("[negotiation] swallowing candidate failure for ignored offer");
                return Ok(());
            }
            return Err(NegotiationError::CandidateFailed(detail));
        }
        Ok(())
    }

    /// Tear the session down: release the transport and clear every flag.
    /// Idempotent; all entry points discard input once closed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.close();
        self.making_offer = false;
        self.ignore_offer = false;
        self.awaiting_answer = false;
        eprintln!("[negotiation] session with {} closed", self.remote_token);
    }
}

// ── Session wiring ──────────────────────────────────────────

/// Binds an engine to a client dispatcher: subscribes the session's
/// `sdp` / `ice-candidate` / `close-connection` handlers and unsubscribes
/// them at teardown.
pub struct NegotiationSession<T, S>
where
    T: PeerTransport + Send + 'static,
    S: SignalingPort + Send + 'static,
{
    engine: Arc<Mutex<NegotiationEngine<T, S>>>,
    dispatcher: Arc<MessageDispatcher>,
    subscriptions: Vec<(&'static str, HandlerId)>,
    remote_closed: Arc<AtomicBool>,
}

impl<T, S> NegotiationSession<T, S>
where
    T: PeerTransport + Send + 'static,
    S: SignalingPort + Send + 'static,
{
    /// Subscribe the session's handlers on `dispatcher`. Messages tagged
    /// with a different remote token are ignored; one session, one peer.
    pub fn attach(
        dispatcher: Arc<MessageDispatcher>,
        engine: NegotiationEngine<T, S>,
    ) -> Self {
        let remote = engine.remote_token.clone();
        let engine = Arc::new(Mutex::new(engine));
        let remote_closed = Arc::new(AtomicBool::new(false));
        let mut subscriptions = Vec::new();

        let engine_sdp = Arc::clone(&engine);
        let remote_sdp = remote.clone();
        subscriptions.push((
            SDP,
            dispatcher.subscribe_typed::<SdpPayload, _>(SDP, move |_, payload| {
                if payload.remote_token != remote_sdp {
                    return Ok(());
                }
                engine_sdp
                    .lock()
                    .unwrap()
                    .on_remote_description(payload.description)
                    .map_err(|e| e.to_string())
            }),
        ));

        let engine_ice = Arc::clone(&engine);
        let remote_ice = remote.clone();
        subscriptions.push((
            ICE_CANDIDATE,
            dispatcher.subscribe_typed::<IceCandidatePayload, _>(ICE_CANDIDATE, move |_, payload| {
                if payload.remote_token != remote_ice {
                    return Ok(());
                }
                engine_ice
                    .lock()
                    .unwrap()
                    .on_remote_candidate(payload.ice_candidate)
                    .map_err(|e| e.to_string())
            }),
        ));

        let engine_close = Arc::clone(&engine);
        let closed_flag = Arc::clone(&remote_closed);
        subscriptions.push((
            CLOSE_CONNECTION,
            dispatcher.subscribe_typed::<CloseConnectionPayload, _>(
                CLOSE_CONNECTION,
                move |_, payload| {
                    if payload.remote_token != remote {
                        return Ok(());
                    }
                    eprintln!("[negotiation] remote peer requested teardown");
                    engine_close.lock().unwrap().close();
                    closed_flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
            ),
        ));

        Self {
            engine,
            dispatcher,
            subscriptions,
            remote_closed,
        }
    }

    /// Kick off negotiation (the local negotiation-needed trigger).
    pub fn negotiate(&self) -> Result<(), NegotiationError> {
        self.engine.lock().unwrap().on_negotiation_needed()
    }

    /// Whether the remote peer tore the session down.
    pub fn remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> NegotiationState {
        self.engine.lock().unwrap().state()
    }

    /// Tear down: close the engine and unsubscribe the session's handlers.
    pub fn close(&mut self) {
        self.engine.lock().unwrap().close();
        for (msg_type, id) in self.subscriptions.drain(..) {
            self.dispatcher.unsubscribe(msg_type, id);
        }
    }
}

impl<T, S> Drop for NegotiationSession<T, S>
where
    T: PeerTransport + Send + 'static,
    S: SignalingPort + Send + 'static,
{
    fn drop(&mut self) {
        if !self.subscriptions.is_empty() {
            self.close();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────
