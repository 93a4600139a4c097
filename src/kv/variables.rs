/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Key prefixes that specify where each piece of daemon state is stored in the user-provided
//! key-value store.
//!
//! # List of State Variables
//!
//! Keys are slash-joined ASCII paths. Mappings append the mapped key (a name, a hex peer id or an
//! IP address) to a prefix ending in `/`.
//!
//! ## Headers
//!
//! |Key|Value|
//! |---|---|
//! |`headers/header/<name>`|JSON [`Header`](crate::types::header::Header).|
//! |`headers/merkle-base/<name>`|Borsh `Vec<[u8; 32]>`: the serial hash row `H_0 … H_{sector_size-1}` of the committed blob.|
//! |`headers/count`|Big-endian `u64` number of stored headers.|
//!
//! ## Names
//!
//! |Key|Value|
//! |---|---|
//! |`names/name/<name>`|JSON [`NameInfo`](crate::types::header::NameInfo).|
//! |`last-name-import-height`|Big-endian `u64`.|
//! |`initial-import-complete`|`0x01` once the name importer has caught up with the registry.|
//!
//! ## Peers
//!
//! |Key|Value|
//! |---|---|
//! |`peers/peer/<peer_id_hex>`|JSON [`PeerInfo`](crate::types::header::PeerInfo).|
//! |`peers/inbound-ban/<ip>`|Big-endian `u64` Unix seconds until which inbound connections from `ip` are refused.|
//! |`peers/outbound-ban/<ip>`|Big-endian `u64` Unix seconds until which we will not dial `ip`.|
//!
//! ## Bans and misbehavior
//!
//! |Key|Value|
//! |---|---|
//! |`bans/ban/<name>`|`0x01` for every name on an imported ban list.|
//! |`last-ban-list-import-at`|Big-endian `u64` Unix seconds.|
//! |`equivocationproofs/<name>`|Wire-encoded [`EquivocationProof`](crate::types::header::EquivocationProof).|

pub const HEADERS_HEADER: &[u8] = b"headers/header/";
pub const HEADERS_MERKLE_BASE: &[u8] = b"headers/merkle-base/";
pub const HEADERS_COUNT: &[u8] = b"headers/count";

pub const NAMES_NAME: &[u8] = b"names/name/";
pub const LAST_NAME_IMPORT_HEIGHT: &[u8] = b"last-name-import-height";
pub const INITIAL_IMPORT_COMPLETE: &[u8] = b"initial-import-complete";

pub const PEERS_PEER: &[u8] = b"peers/peer/";
pub const PEERS_INBOUND_BAN: &[u8] = b"peers/inbound-ban/";
pub const PEERS_OUTBOUND_BAN: &[u8] = b"peers/outbound-ban/";

pub const BANS_BAN: &[u8] = b"bans/ban/";
pub const LAST_BAN_LIST_IMPORT_AT: &[u8] = b"last-ban-list-import-at";

pub const EQUIVOCATION_PROOFS: &[u8] = b"equivocationproofs/";

/// Value stored under flag keys.
pub const FLAG_SET: [u8; 1] = [0x01];

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
