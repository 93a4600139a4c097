/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three-message handshake that authenticates both ends of a new connection.
//!
//! ```text
//! initiator                                   responder
//!     | -- Hello{local_nonce = a, remote_nonce = 0} --> |
//!     | <-- Hello{local_nonce = b, remote_nonce = a} -- |
//!     | ------------ HelloAck{nonce = b} -------------> |
//! ```
//!
//! Each side proves possession of its key by signing an envelope that echoes the other side's
//! fresh nonce.

use std::time::Instant;

use rand::RngCore;
use thiserror::Error;

use crate::{
    codec::CodecError,
    types::{
        crypto_primitives::{parse_public_key, peer_id, Keypair},
        data_types::{unix_now, PeerID, PublicKeyBytes},
    },
};

use super::{
    envelope::{Envelope, EnvelopeError},
    messages::{Hello, HelloAck, Message, MessageType},
    peer::{Peer, PeerError},
    PROTOCOL_VERSION,
};

/// What the local side presents during a handshake.
#[derive(Clone)]
pub struct Identity {
    pub keypair: Keypair,
    pub magic: u32,
    pub user_agent: String,
}

impl Identity {
    fn seal(&self, message: impl Into<Message>) -> Envelope {
        Envelope::seal(self.magic, &message.into(), &self.keypair, unix_now())
    }

    fn hello(&self, local_nonce: [u8; 32], remote_nonce: [u8; 32]) -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            local_nonce,
            remote_nonce,
            public_key: self.keypair.public_bytes(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Run the initiator's side of the handshake and return the responder's peer id.
pub fn handshake_outbound(
    peer: &Peer,
    identity: &Identity,
    deadline: Instant,
) -> Result<PeerID, HandshakeError> {
    let local_nonce = fresh_nonce();
    peer.send(&identity.seal(identity.hello(local_nonce, [0; 32])), deadline)?;

    let (remote, hello) = receive_hello(peer, identity, deadline)?;
    if hello.remote_nonce != local_nonce {
        return Err(HandshakeError::InvalidNonce);
    }

    peer.send(
        &identity.seal(HelloAck {
            nonce: hello.local_nonce,
        }),
        deadline,
    )?;
    Ok(remote)
}

/// Run the responder's side of the handshake and return the initiator's peer id.
pub fn handshake_inbound(
    peer: &Peer,
    identity: &Identity,
    deadline: Instant,
) -> Result<PeerID, HandshakeError> {
    let (remote, hello) = receive_hello(peer, identity, deadline)?;

    let local_nonce = fresh_nonce();
    peer.send(
        &identity.seal(identity.hello(local_nonce, hello.local_nonce)),
        deadline,
    )?;

    let envelope = peer.receive(deadline)?;
    envelope.check(identity.magic, unix_now(), Some(&remote))?;
    match envelope.message()? {
        Message::HelloAck(ack) if ack.nonce == local_nonce => Ok(remote),
        Message::HelloAck(_) => Err(HandshakeError::InvalidNonce),
        other => Err(HandshakeError::UnexpectedMessage(other.message_type())),
    }
}

// Receive a `Hello` and check that its envelope was signed by the key it claims.
fn receive_hello(
    peer: &Peer,
    identity: &Identity,
    deadline: Instant,
) -> Result<(PeerID, Hello), HandshakeError> {
    let envelope = peer.receive(deadline)?;
    let signer = envelope.check(identity.magic, unix_now(), None)?;
    let hello = match envelope.message()? {
        Message::Hello(hello) => hello,
        other => return Err(HandshakeError::UnexpectedMessage(other.message_type())),
    };
    if hello.protocol_version > PROTOCOL_VERSION {
        return Err(HandshakeError::IncompatibleProtocol(hello.protocol_version));
    }
    if claimed_peer_id(&hello.public_key) != Some(signer) {
        return Err(EnvelopeError::InvalidEnvelopeSignature.into());
    }
    Ok((signer, hello))
}

fn claimed_peer_id(public_key: &PublicKeyBytes) -> Option<PeerID> {
    parse_public_key(&public_key.bytes())
        .ok()
        .map(|key| peer_id(&key))
}

fn fresh_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unexpected {0:?} during handshake")]
    UnexpectedMessage(MessageType),
    #[error("remote protocol version {0} is newer than ours")]
    IncompatibleProtocol(u32),
    #[error("handshake nonce mismatch")]
    InvalidNonce,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl From<CodecError> for HandshakeError {
    fn from(err: CodecError) -> Self {
        HandshakeError::Envelope(EnvelopeError::Codec(err))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        sync::Arc,
        thread,
        time::Duration,
    };

    use super::*;
    use crate::networking::{
        peer::{BandwidthCounter, Direction, PeerConfig},
        NETWORK_MAGIC,
    };

    fn identity() -> Identity {
        Identity {
            keypair: Keypair::generate(),
            magic: NETWORK_MAGIC,
            user_agent: "test".into(),
        }
    }

    fn connected_pair() -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let dialed = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let counter = Arc::new(BandwidthCounter::default());
        let config = PeerConfig::default();
        (
            Peer::new(dialed, Direction::Outbound, &config, counter.clone()).unwrap(),
            Peer::new(accepted, Direction::Inbound, &config, counter).unwrap(),
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn both_sides_learn_each_others_peer_id() {
        let (dialer, listener) = connected_pair();
        let (a, b) = (identity(), identity());
        let (a_id, b_id) = (a.keypair.peer_id(), b.keypair.peer_id());

        let responder = thread::spawn(move || handshake_inbound(&listener, &b, deadline()));
        assert_eq!(handshake_outbound(&dialer, &a, deadline()), Ok(b_id));
        assert_eq!(responder.join().unwrap(), Ok(a_id));
    }

    #[test]
    fn mismatched_magic_fails_the_handshake() {
        let (dialer, listener) = connected_pair();
        let a = identity();
        let b = Identity {
            magic: 0x01020304,
            ..identity()
        };

        let responder = thread::spawn(move || handshake_inbound(&listener, &b, deadline()));
        assert!(handshake_outbound(&dialer, &a, Instant::now() + Duration::from_millis(500)).is_err());
        assert_eq!(
            responder.join().unwrap(),
            Err(HandshakeError::Envelope(EnvelopeError::InvalidEnvelopeMagic(
                NETWORK_MAGIC
            )))
        );
    }

    #[test]
    fn a_responder_that_skips_hello_is_rejected() {
        let (dialer, listener) = connected_pair();
        let a = identity();
        let b = identity();

        let responder = thread::spawn(move || {
            listener.receive(deadline()).unwrap();
            listener
                .send(
                    &Envelope::seal(NETWORK_MAGIC, &Message::Ping, &b.keypair, unix_now()),
                    deadline(),
                )
                .unwrap();
            listener
        });
        assert_eq!(
            handshake_outbound(&dialer, &a, deadline()),
            Err(HandshakeError::UnexpectedMessage(MessageType::Ping))
        );
        drop(responder.join().unwrap());
    }

    #[test]
    fn a_wrong_echoed_nonce_is_rejected() {
        let (dialer, listener) = connected_pair();
        let a = identity();
        let b = identity();

        let responder = thread::spawn(move || {
            listener.receive(deadline()).unwrap();
            let hello = b.hello([1; 32], [2; 32]);
            listener.send(&b.seal(hello), deadline()).unwrap();
            listener
        });
        assert_eq!(
            handshake_outbound(&dialer, &a, deadline()),
            Err(HandshakeError::InvalidNonce)
        );
        drop(responder.join().unwrap());
    }

    #[test]
    fn a_newer_protocol_version_is_incompatible() {
        let (dialer, listener) = connected_pair();
        let a = identity();
        let b = identity();

        let responder = thread::spawn(move || {
            let envelope = listener.receive(deadline()).unwrap();
            let Message::Hello(theirs) = envelope.message().unwrap() else {
                panic!("expected hello");
            };
            let mut hello = b.hello([1; 32], theirs.local_nonce);
            hello.protocol_version = PROTOCOL_VERSION + 1;
            listener.send(&b.seal(hello), deadline()).unwrap();
            listener
        });
        assert_eq!(
            handshake_outbound(&dialer, &a, deadline()),
            Err(HandshakeError::IncompatibleProtocol(PROTOCOL_VERSION + 1))
        );
        drop(responder.join().unwrap());
    }
}
