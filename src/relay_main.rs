//! sidedrop-relay — signaling relay for token-rendezvous peer discovery.
//!
//! Accepts WebSocket clients, assigns each a short opaque token, and runs
//! the rendezvous service on top of the shared dispatcher. The relay only
//! forwards signaling envelopes; peer content never crosses it.
//!
//! Usage:
//!   sidedrop-relay [--port <PORT>] [--max-message-bytes <N>] [--evict-on-send-failure]

use std::net::TcpListener;
use std::sync::Arc;

use sidedrop::dispatcher::MessageDispatcher;
use sidedrop::registry::{ConnectionRegistry, EvictionPolicy};
use sidedrop::relay::{serve, RelayConfig};
use sidedrop::rendezvous::RendezvousService;

// ── CLI ─────────────────────────────────────────────────────

fn parse_args() -> RelayConfig {
    let argv: Vec<String> = std::env::args().collect();
    let mut config = RelayConfig::default();

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--port" => {
                i += 1;
                config.port = match argv.get(i).and_then(|s| s.parse::<u16>().ok()) {
                    Some(p) if p > 0 => p,
                    _ => {
                        eprintln!("--port requires a valid port number (1-65535)");
                        std::process::exit(1);
                    }
                };
            }
            "--max-message-bytes" => {
                i += 1;
                config.max_message_bytes = match argv.get(i).and_then(|s| s.parse::<usize>().ok()) {
                    Some(n) if n > 0 => n,
                    _ => {
                        eprintln!("--max-message-bytes requires a positive byte count");
                        std::process::exit(1);
                    }
                };
            }
            "--evict-on-send-failure" => {
                config.eviction = EvictionPolicy::Evict;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!(
                    "Usage: sidedrop-relay [--port <PORT>] [--max-message-bytes <N>] [--evict-on-send-failure]"
                );
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

// ── Entry ───────────────────────────────────────────────────

fn main() {
    let config = parse_args();

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr) {
        Ok(l) => {
            eprintln!("[relay] listening on {}", bind_addr);
            l
        }
        Err(e) => {
            eprintln!("[relay] FATAL: bind {} failed: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(ConnectionRegistry::new(config.eviction));
    let dispatcher = Arc::new(MessageDispatcher::new());
    let _service = RendezvousService::attach(&dispatcher, Arc::clone(&registry));

    serve(listener, registry, dispatcher, config);
}
