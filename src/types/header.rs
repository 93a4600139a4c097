/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-name metadata: headers, seals, name infos, peer records and equivocation proofs.
//!
//! ## Seals
//!
//! The tuple `(name, epoch_height, sector_size, sector_tip_hash, reserved_root)` is a name's
//! "seal". The key registered for the name signs the [seal hash](seal_hash) of every version it
//! publishes:
//!
//! ```text
//! BLAKE2b-256("DDRPBLOB" ‖ encode(name) ‖ encode(epoch_height) ‖ encode(sector_size) ‖ sector_tip_hash ‖ reserved_root)
//! ```

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Decode, Encode, Reader};

use super::{
    crypto_primitives::{blake2b256, verify},
    data_types::{CryptoHash, EpochHeight, PeerID, PublicKeyBytes, SectorSize, SignatureBytes},
};

/// Domain separator prepended to every seal hash preimage.
pub const SEAL_PREFIX: &[u8; 8] = b"DDRPBLOB";

pub fn seal_hash(
    name: &str,
    epoch_height: EpochHeight,
    sector_size: SectorSize,
    sector_tip_hash: &CryptoHash,
    reserved_root: &CryptoHash,
) -> CryptoHash {
    let mut preimage = Vec::with_capacity(8 + name.len() + 1 + 4 + 64);
    preimage.extend_from_slice(SEAL_PREFIX);
    name.encode(&mut preimage);
    epoch_height.encode(&mut preimage);
    sector_size.encode(&mut preimage);
    sector_tip_hash.encode(&mut preimage);
    reserved_root.encode(&mut preimage);
    blake2b256(&preimage)
}

/// The committed state of a name, persisted under `headers/header/<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub sector_tip_hash: CryptoHash,
    pub reserved_root: CryptoHash,
    pub signature: SignatureBytes,
    /// Unix seconds at which this epoch began locally.
    pub epoch_start_at: u64,
    /// Unix seconds at which the last update was accepted.
    pub received_at: u64,
    /// Sectors left in the name's timebank after the last accepted update.
    pub timebank: i32,
    /// Unix seconds at which a peer served data for this name that did not match its signed tip.
    /// Zero when no mismatch has been seen.
    pub banned_at: u64,
}

impl Header {
    pub fn seal_hash(&self) -> CryptoHash {
        seal_hash(
            &self.name,
            self.epoch_height,
            self.sector_size,
            &self.sector_tip_hash,
            &self.reserved_root,
        )
    }

    pub fn verify_signature(&self, public_key: &PublicKeyBytes) -> bool {
        verify(&self.seal_hash(), &self.signature, public_key)
    }
}

/// `(name, public_key, import_height)` imported from the naming registry. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameInfo {
    pub name: String,
    pub public_key: PublicKeyBytes,
    pub import_height: u32,
}

/// What we know about a remote peer, persisted under `peers/peer/<peer_id_hex>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerID,
    pub ip: IpAddr,
    pub port: u16,
    pub last_seen: u64,
    /// `true` once we have completed a handshake with the peer ourselves.
    pub verify: bool,
    pub inbound_banned_until: u64,
    pub outbound_banned_until: u64,
}

/// A signed seal, without the name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedSeal {
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub sector_tip_hash: CryptoHash,
    pub reserved_root: CryptoHash,
    pub signature: SignatureBytes,
}

impl SignedSeal {
    pub fn seal_hash(&self, name: &str) -> CryptoHash {
        seal_hash(
            name,
            self.epoch_height,
            self.sector_size,
            &self.sector_tip_hash,
            &self.reserved_root,
        )
    }
}

impl Encode for SignedSeal {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.epoch_height.encode(buf);
        self.sector_size.encode(buf);
        self.sector_tip_hash.encode(buf);
        self.reserved_root.encode(buf);
        self.signature.encode(buf);
    }
}

impl Decode for SignedSeal {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SignedSeal {
            epoch_height: reader.u16()?,
            sector_size: reader.u16()?,
            sector_tip_hash: CryptoHash::decode(reader)?,
            reserved_root: CryptoHash::decode(reader)?,
            signature: SignatureBytes::decode(reader)?,
        })
    }
}

/// Two seals for the same name, epoch and sector size that differ in tip, both signed by the name's
/// registered key. Proves that the key holder published conflicting histories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EquivocationProof {
    pub name: String,
    pub a: SignedSeal,
    pub b: SignedSeal,
}

impl EquivocationProof {
    /// Check that the proof is internally consistent and that both seals are signed by
    /// `public_key`.
    pub fn is_valid(&self, public_key: &PublicKeyBytes) -> bool {
        self.a.epoch_height == self.b.epoch_height
            && self.a.sector_size == self.b.sector_size
            && self.a.sector_tip_hash != self.b.sector_tip_hash
            && verify(&self.a.seal_hash(&self.name), &self.a.signature, public_key)
            && verify(&self.b.seal_hash(&self.name), &self.b.signature, public_key)
    }
}

impl Encode for EquivocationProof {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.a.encode(buf);
        self.b.encode(buf);
    }
}

impl Decode for EquivocationProof {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(EquivocationProof {
            name: reader.string()?,
            a: SignedSeal::decode(reader)?,
            b: SignedSeal::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::Keypair;

    fn signed_seal(keypair: &Keypair, name: &str, tip: CryptoHash) -> SignedSeal {
        let hash = seal_hash(name, 0, 100, &tip, &CryptoHash::ZERO);
        SignedSeal {
            epoch_height: 0,
            sector_size: 100,
            sector_tip_hash: tip,
            reserved_root: CryptoHash::ZERO,
            signature: keypair.sign(&hash),
        }
    }

    #[test]
    fn seal_hash_covers_every_field() {
        let base = seal_hash("foo", 0, 1, &CryptoHash::ZERO, &CryptoHash::ZERO);
        assert_ne!(base, seal_hash("fop", 0, 1, &CryptoHash::ZERO, &CryptoHash::ZERO));
        assert_ne!(base, seal_hash("foo", 1, 1, &CryptoHash::ZERO, &CryptoHash::ZERO));
        assert_ne!(base, seal_hash("foo", 0, 2, &CryptoHash::ZERO, &CryptoHash::ZERO));
        assert_ne!(
            base,
            seal_hash("foo", 0, 1, &CryptoHash::new([1; 32]), &CryptoHash::ZERO)
        );
    }

    #[test]
    fn header_json_round_trips() {
        let keypair = Keypair::generate();
        let mut header = Header {
            name: "foo".into(),
            epoch_height: 3,
            sector_size: 12,
            sector_tip_hash: CryptoHash::new([7; 32]),
            reserved_root: CryptoHash::ZERO,
            signature: SignatureBytes::new([0; 65]),
            epoch_start_at: 10,
            received_at: 20,
            timebank: 156,
            banned_at: 0,
        };
        header.signature = keypair.sign(&header.seal_hash());

        let json = serde_json::to_string(&header).unwrap();
        assert!(json.contains(&hex::encode([7u8; 32])));
        let decoded: Header = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify_signature(&keypair.public_bytes()));
    }

    #[test]
    fn equivocation_proofs_require_distinct_tips_from_the_same_key() {
        let keypair = Keypair::generate();
        let a = signed_seal(&keypair, "foo", CryptoHash::new([1; 32]));
        let b = signed_seal(&keypair, "foo", CryptoHash::new([2; 32]));

        let proof = EquivocationProof { name: "foo".into(), a, b };
        assert!(proof.is_valid(&keypair.public_bytes()));
        assert_eq!(EquivocationProof::from_bytes(&proof.to_bytes()).unwrap(), proof);

        let same = EquivocationProof { name: "foo".into(), a, b: a };
        assert!(!same.is_valid(&keypair.public_bytes()));

        let other = Keypair::generate();
        assert!(!proof.is_valid(&other.public_bytes()));
    }
}
