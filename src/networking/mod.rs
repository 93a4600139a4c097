/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Peer-to-peer networking.
//!
//! ## Layers
//!
//! 1. [`messages`] and [`envelope`]: what goes on the wire. Every message travels inside a signed
//!    envelope framed as `u32 length ‖ envelope`.
//! 2. [`peer`]: one TCP connection with background reader and writer threads.
//! 3. [`handshake`]: mutual authentication of a fresh connection.
//! 4. [`mux`]: the table of authenticated peers, handler dispatch, gossip and request/response.
//! 5. [`manager`]: admission control, dialing, the listener and outbound refill.
//! 6. [`pinger`] and [`peer_exchanger`]: periodic keep-alives and peer discovery.

pub mod envelope;

pub mod handshake;

pub mod manager;

pub mod messages;

pub mod mux;

pub mod peer;

pub mod peer_exchanger;

pub mod pinger;

/// Identifies the network. Envelopes with any other magic are rejected.
pub const NETWORK_MAGIC: u32 = 0xCAFE_CAFE;

pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_PORT: u16 = 9097;

/// Maximum size of one encoded envelope.
pub const MAX_MESSAGE_LEN: usize = 5 * 1024 * 1024;

pub const USER_AGENT: &str = concat!("ddrp_rs/", env!("CARGO_PKG_VERSION"));
