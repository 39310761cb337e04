//! Sidedrop — token-rendezvous signaling relay and peer negotiation for
//! direct browser-to-browser file transfer.
//!
//! The relay multiplexes many client links behind short opaque tokens and
//! forwards signaling envelopes without inspecting descriptions or
//! candidates. Peers discover each other through the rendezvous token
//! exchange, run perfect negotiation to establish a direct channel, and
//! move the actual bytes over that channel in chunks. The relay never
//! sees the transferred content.

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod negotiation;
pub mod registry;
pub mod relay;
pub mod rendezvous;
pub mod token;
pub mod transfer;
