/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A peer-to-peer daemon library that replicates signed, fixed-size binary blobs keyed by
//! human-readable names.
//!
//! Each name authorizes exactly one public key, learned from a [naming registry](registry), to
//! publish successive versions of its blob. Peers gossip new versions, sync missing sectors from one
//! another, verify them against a signed serial hash chain, and throttle writers with a per-name
//! [timebank](update::timebank).
//!
//! The crate is organized into the following subsystems:
//! - [`blob_store`]: the sector grid, copy-on-write transactions and serial sector hashes.
//! - [`networking`]: signed envelopes over TCP, the handshake, peer connections, the multiplexer
//!   and the peer manager.
//! - [`update`]: the update queue, the updater workers and the timebank.
//! - [`blob_sync`]: the sector server, the update server and the background name syncer.
//! - [`registry`]: the pluggable naming registry, the name importer and ban lists.
//! - [`kv`]: pluggable persistence for headers, name infos, peers and bans.
//!
//! A running daemon is assembled by [`node::NodeSpec`] and kept alive by [`node::Node`].

pub mod blob_store;

pub mod blob_sync;

pub mod codec;

pub mod config;

pub mod events;

pub mod kv;

pub mod logging;

pub mod networking;

pub mod node;

pub mod registry;

pub mod types;

pub mod update;

pub mod utils;
