/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: BLAKE2b with a 256-bit output, provided by the [`blake2`] crate.
//! 2. **Digital Signatures**: recoverable secp256k1 ECDSA, provided by the [`k256`] crate.

use blake2::{digest::consts::U32, Blake2b};
use rand_core::OsRng;

use super::data_types::{CryptoHash, PeerID, PublicKeyBytes, SignatureBytes};

// re-exports below.
pub use blake2::Digest;
pub use k256::ecdsa::{Error as SignatureError, RecoveryId, Signature, SigningKey, VerifyingKey};

/// BLAKE2b-256.
pub type CryptoHasher = Blake2b<U32>;

/// Hash `data` with [`CryptoHasher`].
pub fn blake2b256(data: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(data);
    CryptoHash::new(hasher.finalize().into())
}

/// A facade around [`SigningKey`] that signs 32-byte digests with a recovery id, so that verifiers
/// can derive the signer's public key (and therefore [`PeerID`]) from the signature alone.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Create a `Keypair` from a freshly generated random signing key.
    pub fn generate() -> Keypair {
        Keypair(SigningKey::random(&mut OsRng))
    }

    /// Sign the digest `hash`.
    pub fn sign(&self, hash: &CryptoHash) -> SignatureBytes {
        let (signature, recovery_id) = self
            .0
            .sign_prehash_recoverable(&hash.bytes())
            .expect("a 32-byte prehash is always signable");
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();
        SignatureBytes::new(bytes)
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        *self.0.verifying_key()
    }

    pub fn public_bytes(&self) -> PublicKeyBytes {
        public_key_bytes(&self.public())
    }

    pub fn peer_id(&self) -> PeerID {
        peer_id(&self.public())
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.0
    }
}

/// Recover the public key that produced `signature` over `hash`.
pub fn recover(hash: &CryptoHash, signature: &SignatureBytes) -> Result<VerifyingKey, SignatureError> {
    let bytes = signature.bytes();
    let sig = Signature::from_slice(&bytes[..64])?;
    let recovery_id = RecoveryId::from_byte(bytes[64]).ok_or_else(SignatureError::new)?;
    VerifyingKey::recover_from_prehash(&hash.bytes(), &sig, recovery_id)
}

/// Check that `signature` over `hash` was produced by the holder of `public_key`.
pub fn verify(hash: &CryptoHash, signature: &SignatureBytes, public_key: &PublicKeyBytes) -> bool {
    match recover(hash, signature) {
        Ok(recovered) => public_key_bytes(&recovered) == *public_key,
        Err(_) => false,
    }
}

/// Compressed SEC1 encoding of `public_key`.
pub fn public_key_bytes(public_key: &VerifyingKey) -> PublicKeyBytes {
    let encoded = public_key.to_encoded_point(true);
    let mut bytes = [0u8; 33];
    bytes.copy_from_slice(encoded.as_bytes());
    PublicKeyBytes::new(bytes)
}

/// Parse a compressed (or uncompressed) SEC1 public key.
pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey, SignatureError> {
    VerifyingKey::from_sec1_bytes(bytes)
}

/// `PeerID` = BLAKE2b-256 of the compressed public key.
pub fn peer_id(public_key: &VerifyingKey) -> PeerID {
    PeerID::new(blake2b256(&public_key_bytes(public_key).bytes()).bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_recover_the_signer() {
        let keypair = Keypair::generate();
        let hash = blake2b256(b"hello");
        let signature = keypair.sign(&hash);

        let recovered = recover(&hash, &signature).unwrap();
        assert_eq!(peer_id(&recovered), keypair.peer_id());
        assert!(verify(&hash, &signature, &keypair.public_bytes()));
    }

    #[test]
    fn signatures_do_not_verify_over_other_digests_or_keys() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let signature = keypair.sign(&blake2b256(b"hello"));

        assert!(!verify(&blake2b256(b"world"), &signature, &keypair.public_bytes()));
        assert!(!verify(&blake2b256(b"hello"), &signature, &other.public_bytes()));
    }

    #[test]
    fn public_keys_round_trip_through_sec1() {
        let keypair = Keypair::generate();
        let parsed = parse_public_key(&keypair.public_bytes().bytes()).unwrap();
        assert_eq!(parsed, keypair.public());
    }
}
