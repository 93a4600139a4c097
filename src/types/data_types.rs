/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use super::hex_serde;

/// Length in bytes of a single sector.
pub const SECTOR_LEN: usize = 65536;

/// Number of sectors in every blob.
pub const SECTOR_COUNT: u16 = 256;

/// Size in bytes of every blob file (16 MiB).
pub const BLOB_LEN: u64 = SECTOR_LEN as u64 * SECTOR_COUNT as u64;

/// Monotonically increasing counter that starts a fresh version history of a name.
pub type EpochHeight = u16;

/// Number of committed sectors of a blob, in `[0, SECTOR_COUNT]`.
pub type SectorSize = u16;

/// 32-byte BLAKE2b-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CryptoHash(#[serde(with = "hex_serde")] [u8; 32]);

impl CryptoHash {
    /// The all-zero hash. Seeds the serial sector hash chain and fills `reserved_root`.
    pub const ZERO: CryptoHash = CryptoHash([0u8; 32]);

    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoHash({})", hex::encode(&self.0[..8]))
    }
}

/// 65-byte recoverable secp256k1 signature laid out as `r ‖ s ‖ recovery_id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "hex_serde")] [u8; 65]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 65]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 65] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(&self.0[..8]))
    }
}

/// Compressed 33-byte SEC1 encoding of a secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(#[serde(with = "hex_serde")] [u8; 33]);

impl PublicKeyBytes {
    pub const fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 33] {
        self.0
    }
}

impl Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", hex::encode(self.0))
    }
}

/// Identifier of a peer: BLAKE2b-256 of its compressed public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerID(#[serde(with = "hex_serde")] [u8; 32]);

impl PeerID {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for PeerID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for PeerID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerID({})", hex::encode(&self.0[..8]))
    }
}

/// One 64 KiB sector of a blob.
#[derive(Clone, PartialEq, Eq)]
pub struct Sector(Box<[u8]>);

impl Sector {
    /// A sector filled with zeros, the content of every sector past a blob's `sector_size`.
    pub fn zeroed() -> Sector {
        Sector(vec![0u8; SECTOR_LEN].into_boxed_slice())
    }

    /// A sector with every byte set to `byte`.
    pub fn filled(byte: u8) -> Sector {
        Sector(vec![byte; SECTOR_LEN].into_boxed_slice())
    }

    /// Wrap `bytes` as a sector. Returns `None` unless `bytes.len() == SECTOR_LEN`.
    pub fn from_vec(bytes: Vec<u8>) -> Option<Sector> {
        if bytes.len() == SECTOR_LEN {
            Some(Sector(bytes.into_boxed_slice()))
        } else {
            None
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Debug for Sector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Sector({}..)", hex::encode(&self.0[..4]))
    }
}

/// Seconds since the Unix Epoch. Every timestamp persisted or sent on the wire uses this unit.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
