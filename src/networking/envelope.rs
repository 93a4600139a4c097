/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed, replay-resistant wrapper around every [`Message`] sent over a connection.
//!
//! The signature is recoverable, so the receiver learns the sender's public key (and therefore
//! its [`PeerID`]) from the envelope alone. An envelope is accepted only if its magic matches the
//! network's, its timestamp is within [`MAX_CLOCK_SKEW_SECS`] of the local clock, and the
//! recovered peer id equals the one the connection was established with.

use thiserror::Error;

use crate::{
    codec::{put_bytes, CodecError, Decode, Encode, Reader},
    types::{
        crypto_primitives::{blake2b256, peer_id, public_key_bytes, recover, Keypair},
        data_types::{CryptoHash, PeerID, PublicKeyBytes, SignatureBytes},
    },
};

use super::{
    messages::{Message, MessageType},
    MAX_MESSAGE_LEN,
};

/// Maximum tolerated difference between an envelope's timestamp and the local clock.
pub const MAX_CLOCK_SKEW_SECS: u64 = 2 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub magic: u32,
    pub message_type: u16,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub signature: SignatureBytes,
}

impl Envelope {
    /// Wrap `message` and sign it with `keypair`.
    pub fn seal(magic: u32, message: &Message, keypair: &Keypair, timestamp: u64) -> Envelope {
        let mut envelope = Envelope {
            magic,
            message_type: message.message_type() as u16,
            timestamp,
            payload: message.payload(),
            signature: SignatureBytes::new([0; 65]),
        };
        envelope.signature = keypair.sign(&envelope.signing_hash());
        envelope
    }

    pub fn signing_hash(&self) -> CryptoHash {
        let mut preimage = Vec::with_capacity(16 + self.payload.len());
        self.encode_unsigned(&mut preimage);
        blake2b256(&preimage)
    }

    /// The public key that signed this envelope.
    pub fn signer(&self) -> Result<PublicKeyBytes, EnvelopeError> {
        recover(&self.signing_hash(), &self.signature)
            .map(|key| public_key_bytes(&key))
            .map_err(|_| EnvelopeError::InvalidEnvelopeSignature)
    }

    /// Run the acceptance checks and return the sender's peer id. When `expected` is given the
    /// signer must be that peer.
    pub fn check(
        &self,
        magic: u32,
        now: u64,
        expected: Option<&PeerID>,
    ) -> Result<PeerID, EnvelopeError> {
        if self.magic != magic {
            return Err(EnvelopeError::InvalidEnvelopeMagic(self.magic));
        }
        if now.abs_diff(self.timestamp) > MAX_CLOCK_SKEW_SECS {
            return Err(EnvelopeError::InvalidEnvelopeTimestamp(self.timestamp));
        }
        let signer = recover(&self.signing_hash(), &self.signature)
            .map_err(|_| EnvelopeError::InvalidEnvelopeSignature)?;
        let signer = peer_id(&signer);
        match expected {
            Some(expected) if *expected != signer => Err(EnvelopeError::InvalidEnvelopeSignature),
            _ => Ok(signer),
        }
    }

    pub fn message(&self) -> Result<Message, CodecError> {
        Message::decode_payload(MessageType::from_u16(self.message_type)?, &self.payload)
    }

    fn encode_unsigned(&self, buf: &mut Vec<u8>) {
        self.magic.encode(buf);
        self.message_type.encode(buf);
        self.timestamp.encode(buf);
        put_bytes(buf, &self.payload);
    }
}

impl Encode for Envelope {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_unsigned(buf);
        self.signature.encode(buf);
    }
}

impl Decode for Envelope {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Envelope {
            magic: reader.u32()?,
            message_type: reader.u16()?,
            timestamp: reader.u64()?,
            payload: reader.bytes_with_limit(MAX_MESSAGE_LEN)?,
            signature: SignatureBytes::decode(reader)?,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid envelope magic {0:#x}")]
    InvalidEnvelopeMagic(u32),
    #[error("envelope timestamp {0} is too far from the local clock")]
    InvalidEnvelopeTimestamp(u64),
    #[error("envelope signature does not match the expected peer")]
    InvalidEnvelopeSignature,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::{messages::NilUpdate, NETWORK_MAGIC};

    fn sealed(keypair: &Keypair, now: u64) -> Envelope {
        Envelope::seal(
            NETWORK_MAGIC,
            &NilUpdate { name: "foo".into() }.into(),
            keypair,
            now,
        )
    }

    #[test]
    fn signer_is_recovered_from_the_envelope() {
        let keypair = Keypair::generate();
        let envelope = sealed(&keypair, 1_000_000);
        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(
            decoded.check(NETWORK_MAGIC, 1_000_000, Some(&keypair.peer_id())),
            Ok(keypair.peer_id())
        );
        assert_eq!(decoded.signer(), Ok(keypair.public_bytes()));
        assert_eq!(
            decoded.message().unwrap(),
            NilUpdate { name: "foo".into() }.into()
        );
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let envelope = sealed(&Keypair::generate(), 1_000_000);
        assert_eq!(
            envelope.check(0xdeadbeef, 1_000_000, None),
            Err(EnvelopeError::InvalidEnvelopeMagic(NETWORK_MAGIC))
        );
    }

    #[test]
    fn clock_skew_is_bounded_in_both_directions() {
        let envelope = sealed(&Keypair::generate(), 1_000_000);
        assert!(envelope
            .check(NETWORK_MAGIC, 1_000_000 + MAX_CLOCK_SKEW_SECS, None)
            .is_ok());
        assert!(envelope
            .check(NETWORK_MAGIC, 1_000_000 - MAX_CLOCK_SKEW_SECS, None)
            .is_ok());
        assert_eq!(
            envelope.check(NETWORK_MAGIC, 1_000_000 + MAX_CLOCK_SKEW_SECS + 1, None),
            Err(EnvelopeError::InvalidEnvelopeTimestamp(1_000_000))
        );
    }

    #[test]
    fn tampering_or_impersonation_fails_the_signature_check() {
        let keypair = Keypair::generate();
        let mut envelope = sealed(&keypair, 1_000_000);
        assert_eq!(
            envelope.check(NETWORK_MAGIC, 1_000_000, Some(&Keypair::generate().peer_id())),
            Err(EnvelopeError::InvalidEnvelopeSignature)
        );

        envelope.payload[1] ^= 0xff;
        assert_ne!(
            envelope.check(NETWORK_MAGIC, 1_000_000, None),
            Ok(keypair.peer_id())
        );
    }
}
