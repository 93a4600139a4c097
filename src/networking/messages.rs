/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that peers exchange inside [envelopes](super::envelope::Envelope).
//!
//! Every message is identified on the wire by its [`MessageType`], a `u16` written into the
//! envelope header. The payload is the message's [`Encode`] output.

use std::net::{IpAddr, Ipv6Addr};

use crate::{
    codec::{put_slice, CodecError, Decode, Encode, Reader},
    types::{
        crypto_primitives::blake2b256,
        data_types::{CryptoHash, EpochHeight, PeerID, PublicKeyBytes, Sector, SectorSize, SignatureBytes},
        header::{seal_hash, EquivocationProof, Header, SignedSeal},
    },
};

/// Maximum number of sectors carried by one [`BlobRes`].
pub const MAX_SECTORS_PER_BLOB_RES: usize = 64;

/// Maximum number of peer records carried by one [`PeerRes`].
pub const MAX_PEERS_PER_PEER_RES: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageType {
    Hello = 0,
    HelloAck = 1,
    Ping = 2,
    Update = 3,
    NilUpdate = 4,
    UpdateReq = 5,
    BlobReq = 6,
    BlobRes = 7,
    TreeBaseReq = 8,
    TreeBaseRes = 9,
    SectorReq = 10,
    SectorRes = 11,
    PeerReq = 12,
    PeerRes = 13,
    EquivocationProof = 14,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Result<MessageType, CodecError> {
        Ok(match value {
            0 => MessageType::Hello,
            1 => MessageType::HelloAck,
            2 => MessageType::Ping,
            3 => MessageType::Update,
            4 => MessageType::NilUpdate,
            5 => MessageType::UpdateReq,
            6 => MessageType::BlobReq,
            7 => MessageType::BlobRes,
            8 => MessageType::TreeBaseReq,
            9 => MessageType::TreeBaseRes,
            10 => MessageType::SectorReq,
            11 => MessageType::SectorRes,
            12 => MessageType::PeerReq,
            13 => MessageType::PeerRes,
            14 => MessageType::EquivocationProof,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// Every message in the protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    HelloAck(HelloAck),
    Ping,
    Update(Update),
    NilUpdate(NilUpdate),
    UpdateReq(UpdateReq),
    BlobReq(BlobReq),
    BlobRes(BlobRes),
    TreeBaseReq(TreeBaseReq),
    TreeBaseRes(TreeBaseRes),
    SectorReq(SectorReq),
    SectorRes(SectorRes),
    PeerReq,
    PeerRes(PeerRes),
    EquivocationProof(EquivocationProof),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::HelloAck(_) => MessageType::HelloAck,
            Message::Ping => MessageType::Ping,
            Message::Update(_) => MessageType::Update,
            Message::NilUpdate(_) => MessageType::NilUpdate,
            Message::UpdateReq(_) => MessageType::UpdateReq,
            Message::BlobReq(_) => MessageType::BlobReq,
            Message::BlobRes(_) => MessageType::BlobRes,
            Message::TreeBaseReq(_) => MessageType::TreeBaseReq,
            Message::TreeBaseRes(_) => MessageType::TreeBaseRes,
            Message::SectorReq(_) => MessageType::SectorReq,
            Message::SectorRes(_) => MessageType::SectorRes,
            Message::PeerReq => MessageType::PeerReq,
            Message::PeerRes(_) => MessageType::PeerRes,
            Message::EquivocationProof(_) => MessageType::EquivocationProof,
        }
    }

    /// The encoded payload, without the type tag.
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Hello(msg) => msg.encode(&mut buf),
            Message::HelloAck(msg) => msg.encode(&mut buf),
            Message::Ping | Message::PeerReq => (),
            Message::Update(msg) => msg.encode(&mut buf),
            Message::NilUpdate(msg) => msg.encode(&mut buf),
            Message::UpdateReq(msg) => msg.encode(&mut buf),
            Message::BlobReq(msg) => msg.encode(&mut buf),
            Message::BlobRes(msg) => msg.encode(&mut buf),
            Message::TreeBaseReq(msg) => msg.encode(&mut buf),
            Message::TreeBaseRes(msg) => msg.encode(&mut buf),
            Message::SectorReq(msg) => msg.encode(&mut buf),
            Message::SectorRes(msg) => msg.encode(&mut buf),
            Message::PeerRes(msg) => msg.encode(&mut buf),
            Message::EquivocationProof(msg) => msg.encode(&mut buf),
        }
        buf
    }

    /// Decode a payload of type `message_type`. The payload must be consumed in full.
    pub fn decode_payload(message_type: MessageType, payload: &[u8]) -> Result<Message, CodecError> {
        Ok(match message_type {
            MessageType::Hello => Message::Hello(Hello::from_bytes(payload)?),
            MessageType::HelloAck => Message::HelloAck(HelloAck::from_bytes(payload)?),
            MessageType::Ping => {
                Reader::new(payload).finish()?;
                Message::Ping
            }
            MessageType::Update => Message::Update(Update::from_bytes(payload)?),
            MessageType::NilUpdate => Message::NilUpdate(NilUpdate::from_bytes(payload)?),
            MessageType::UpdateReq => Message::UpdateReq(UpdateReq::from_bytes(payload)?),
            MessageType::BlobReq => Message::BlobReq(BlobReq::from_bytes(payload)?),
            MessageType::BlobRes => Message::BlobRes(BlobRes::from_bytes(payload)?),
            MessageType::TreeBaseReq => Message::TreeBaseReq(TreeBaseReq::from_bytes(payload)?),
            MessageType::TreeBaseRes => Message::TreeBaseRes(TreeBaseRes::from_bytes(payload)?),
            MessageType::SectorReq => Message::SectorReq(SectorReq::from_bytes(payload)?),
            MessageType::SectorRes => Message::SectorRes(SectorRes::from_bytes(payload)?),
            MessageType::PeerReq => {
                Reader::new(payload).finish()?;
                Message::PeerReq
            }
            MessageType::PeerRes => Message::PeerRes(PeerRes::from_bytes(payload)?),
            MessageType::EquivocationProof => {
                Message::EquivocationProof(EquivocationProof::from_bytes(payload)?)
            }
        })
    }

    /// Identity of the message for gossip de-duplication: `BLAKE2b-256(type ‖ payload)`.
    pub fn hash(&self) -> CryptoHash {
        let mut preimage = Vec::new();
        (self.message_type() as u16).encode(&mut preimage);
        preimage.extend_from_slice(&self.payload());
        blake2b256(&preimage)
    }

    /// The name this message is about, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Message::Update(msg) => Some(&msg.name),
            Message::NilUpdate(msg) => Some(&msg.name),
            Message::UpdateReq(msg) => Some(&msg.name),
            Message::BlobReq(msg) => Some(&msg.name),
            Message::BlobRes(msg) => Some(&msg.name),
            Message::TreeBaseReq(msg) => Some(&msg.name),
            Message::TreeBaseRes(msg) => Some(&msg.name),
            Message::SectorReq(msg) => Some(&msg.name),
            Message::SectorRes(msg) => Some(&msg.name),
            Message::EquivocationProof(msg) => Some(&msg.name),
            Message::Hello(_)
            | Message::HelloAck(_)
            | Message::Ping
            | Message::PeerReq
            | Message::PeerRes(_) => None,
        }
    }

    /// For a request, the key under which its response is awaited.
    pub fn request_key(&self) -> Option<(MessageType, String)> {
        match self {
            Message::UpdateReq(_)
            | Message::BlobReq(_)
            | Message::TreeBaseReq(_)
            | Message::SectorReq(_)
            | Message::PeerReq => Some((self.message_type(), self.name().unwrap_or("").into())),
            _ => None,
        }
    }

    /// For a response, the key of the request it answers.
    pub fn response_key(&self) -> Option<(MessageType, String)> {
        let request = match self {
            Message::Update(_) | Message::NilUpdate(_) => MessageType::UpdateReq,
            Message::BlobRes(_) => MessageType::BlobReq,
            Message::TreeBaseRes(_) => MessageType::TreeBaseReq,
            Message::SectorRes(_) => MessageType::SectorReq,
            Message::PeerRes(_) => MessageType::PeerReq,
            _ => return None,
        };
        Some((request, self.name().unwrap_or("").into()))
    }
}

impl From<Hello> for Message {
    fn from(value: Hello) -> Self {
        Message::Hello(value)
    }
}

impl From<HelloAck> for Message {
    fn from(value: HelloAck) -> Self {
        Message::HelloAck(value)
    }
}

impl From<Update> for Message {
    fn from(value: Update) -> Self {
        Message::Update(value)
    }
}

impl From<NilUpdate> for Message {
    fn from(value: NilUpdate) -> Self {
        Message::NilUpdate(value)
    }
}

impl From<UpdateReq> for Message {
    fn from(value: UpdateReq) -> Self {
        Message::UpdateReq(value)
    }
}

impl From<BlobReq> for Message {
    fn from(value: BlobReq) -> Self {
        Message::BlobReq(value)
    }
}

impl From<BlobRes> for Message {
    fn from(value: BlobRes) -> Self {
        Message::BlobRes(value)
    }
}

impl From<TreeBaseReq> for Message {
    fn from(value: TreeBaseReq) -> Self {
        Message::TreeBaseReq(value)
    }
}

impl From<TreeBaseRes> for Message {
    fn from(value: TreeBaseRes) -> Self {
        Message::TreeBaseRes(value)
    }
}

impl From<SectorReq> for Message {
    fn from(value: SectorReq) -> Self {
        Message::SectorReq(value)
    }
}

impl From<SectorRes> for Message {
    fn from(value: SectorRes) -> Self {
        Message::SectorRes(value)
    }
}

impl From<PeerRes> for Message {
    fn from(value: PeerRes) -> Self {
        Message::PeerRes(value)
    }
}

impl From<EquivocationProof> for Message {
    fn from(value: EquivocationProof) -> Self {
        Message::EquivocationProof(value)
    }
}

/* ↓↓↓ Handshake ↓↓↓ */

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub local_nonce: [u8; 32],
    pub remote_nonce: [u8; 32],
    pub public_key: PublicKeyBytes,
    pub user_agent: String,
}

impl Encode for Hello {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.protocol_version.encode(buf);
        buf.extend_from_slice(&self.local_nonce);
        buf.extend_from_slice(&self.remote_nonce);
        self.public_key.encode(buf);
        self.user_agent.encode(buf);
    }
}

impl Decode for Hello {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Hello {
            protocol_version: reader.u32()?,
            local_nonce: reader.array()?,
            remote_nonce: reader.array()?,
            public_key: PublicKeyBytes::decode(reader)?,
            user_agent: reader.string()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloAck {
    pub nonce: [u8; 32],
}

impl Encode for HelloAck {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.nonce);
    }
}

impl Decode for HelloAck {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(HelloAck {
            nonce: reader.array()?,
        })
    }
}

/* ↓↓↓ Updates ↓↓↓ */

/// Announces that `name` has a new signed version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub sector_tip_hash: CryptoHash,
    pub reserved_root: CryptoHash,
    pub signature: SignatureBytes,
}

impl Update {
    pub fn from_header(header: &Header) -> Update {
        Update {
            name: header.name.clone(),
            epoch_height: header.epoch_height,
            sector_size: header.sector_size,
            sector_tip_hash: header.sector_tip_hash,
            reserved_root: header.reserved_root,
            signature: header.signature,
        }
    }

    pub fn seal_hash(&self) -> CryptoHash {
        seal_hash(
            &self.name,
            self.epoch_height,
            self.sector_size,
            &self.sector_tip_hash,
            &self.reserved_root,
        )
    }

    pub fn signed_seal(&self) -> SignedSeal {
        SignedSeal {
            epoch_height: self.epoch_height,
            sector_size: self.sector_size,
            sector_tip_hash: self.sector_tip_hash,
            reserved_root: self.reserved_root,
            signature: self.signature,
        }
    }
}

impl Encode for Update {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.epoch_height.encode(buf);
        self.sector_size.encode(buf);
        self.sector_tip_hash.encode(buf);
        self.reserved_root.encode(buf);
        self.signature.encode(buf);
    }
}

impl Decode for Update {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Update {
            name: reader.string()?,
            epoch_height: reader.u16()?,
            sector_size: reader.u16()?,
            sector_tip_hash: CryptoHash::decode(reader)?,
            reserved_root: CryptoHash::decode(reader)?,
            signature: SignatureBytes::decode(reader)?,
        })
    }
}

/// "I have nothing newer than what you asked about."
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NilUpdate {
    pub name: String,
}

impl Encode for NilUpdate {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
    }
}

impl Decode for NilUpdate {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(NilUpdate {
            name: reader.string()?,
        })
    }
}

/// Ask for the responder's version of `name` if it is newer than `(epoch_height, sector_size)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateReq {
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
}

impl Encode for UpdateReq {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.epoch_height.encode(buf);
        self.sector_size.encode(buf);
    }
}

impl Decode for UpdateReq {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(UpdateReq {
            name: reader.string()?,
            epoch_height: reader.u16()?,
            sector_size: reader.u16()?,
        })
    }
}

/* ↓↓↓ Blob transfer ↓↓↓ */

/// Ask for the sectors of `name` starting at `sector_size`, the requester's current cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobReq {
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
}

impl Encode for BlobReq {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.epoch_height.encode(buf);
        self.sector_size.encode(buf);
    }
}

impl Decode for BlobReq {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(BlobReq {
            name: reader.string()?,
            epoch_height: reader.u16()?,
            sector_size: reader.u16()?,
        })
    }
}

/// One page of sectors. `payload[0]` is sector `payload_position`, and `prev_hash` is the serial
/// hash of the sector just before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRes {
    pub name: String,
    pub epoch_height: EpochHeight,
    pub payload_position: SectorSize,
    pub prev_hash: CryptoHash,
    pub reserved_root: CryptoHash,
    pub payload: Vec<Sector>,
}

impl Encode for BlobRes {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.epoch_height.encode(buf);
        self.payload_position.encode(buf);
        self.prev_hash.encode(buf);
        self.reserved_root.encode(buf);
        put_slice(buf, &self.payload);
    }
}

impl Decode for BlobRes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let res = BlobRes {
            name: reader.string()?,
            epoch_height: reader.u16()?,
            payload_position: reader.u16()?,
            prev_hash: CryptoHash::decode(reader)?,
            reserved_root: CryptoHash::decode(reader)?,
            payload: reader.slice()?,
        };
        if res.payload.len() > MAX_SECTORS_PER_BLOB_RES {
            return Err(CodecError::ArrayTooLong {
                len: res.payload.len() as u64,
                max: MAX_SECTORS_PER_BLOB_RES,
            });
        }
        Ok(res)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeBaseReq {
    pub name: String,
}

impl Encode for TreeBaseReq {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
    }
}

impl Decode for TreeBaseReq {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TreeBaseReq {
            name: reader.string()?,
        })
    }
}

/// The full serial hash row of the responder's committed blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeBaseRes {
    pub name: String,
    pub sector_hashes: Vec<CryptoHash>,
}

impl Encode for TreeBaseRes {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        put_slice(buf, &self.sector_hashes);
    }
}

impl Decode for TreeBaseRes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TreeBaseRes {
            name: reader.string()?,
            sector_hashes: reader.slice()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectorReq {
    pub name: String,
    pub sector_id: u16,
}

impl Encode for SectorReq {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.sector_id.encode(buf);
    }
}

impl Decode for SectorReq {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SectorReq {
            name: reader.string()?,
            sector_id: reader.u16()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectorRes {
    pub name: String,
    pub sector_id: u16,
    pub sector: Sector,
}

impl Encode for SectorRes {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        self.sector_id.encode(buf);
        self.sector.encode(buf);
    }
}

impl Decode for SectorRes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SectorRes {
            name: reader.string()?,
            sector_id: reader.u16()?,
            sector: Sector::decode(reader)?,
        })
    }
}

/* ↓↓↓ Peer exchange ↓↓↓ */

/// A dialable peer. IPv4 addresses travel as IPv4-mapped IPv6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerID,
    pub ip: IpAddr,
    pub port: u16,
}

impl Encode for PeerAddress {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.peer_id.encode(buf);
        let ip = match self.ip {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        buf.extend_from_slice(&ip.octets());
        self.port.encode(buf);
    }
}

impl Decode for PeerAddress {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let peer_id = PeerID::decode(reader)?;
        let ip = Ipv6Addr::from(reader.array::<16>()?);
        let ip = match ip.to_ipv4_mapped() {
            Some(ip) => IpAddr::V4(ip),
            None => IpAddr::V6(ip),
        };
        Ok(PeerAddress {
            peer_id,
            ip,
            port: reader.u16()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRes {
    pub peers: Vec<PeerAddress>,
}

impl Encode for PeerRes {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_slice(buf, &self.peers);
    }
}

impl Decode for PeerRes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let peers: Vec<PeerAddress> = reader.slice()?;
        if peers.len() > MAX_PEERS_PER_PEER_RES {
            return Err(CodecError::ArrayTooLong {
                len: peers.len() as u64,
                max: MAX_PEERS_PER_PEER_RES,
            });
        }
        Ok(PeerRes { peers })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn round_trip(msg: Message) {
        let decoded = Message::decode_payload(msg.message_type(), &msg.payload()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn every_message_type_survives_the_wire() {
        let update = Update {
            name: "foo".into(),
            epoch_height: 1,
            sector_size: 2,
            sector_tip_hash: CryptoHash::new([3; 32]),
            reserved_root: CryptoHash::ZERO,
            signature: SignatureBytes::new([4; 65]),
        };
        round_trip(Message::Hello(Hello {
            protocol_version: 1,
            local_nonce: [1; 32],
            remote_nonce: [0; 32],
            public_key: PublicKeyBytes::new([2; 33]),
            user_agent: "ddrp_rs/0.1.0".into(),
        }));
        round_trip(HelloAck { nonce: [7; 32] }.into());
        round_trip(Message::Ping);
        round_trip(update.clone().into());
        round_trip(NilUpdate { name: "foo".into() }.into());
        round_trip(
            BlobRes {
                name: "foo".into(),
                epoch_height: 1,
                payload_position: 64,
                prev_hash: CryptoHash::new([9; 32]),
                reserved_root: CryptoHash::ZERO,
                payload: vec![Sector::filled(1), Sector::filled(2)],
            }
            .into(),
        );
        round_trip(
            SectorRes {
                name: "foo".into(),
                sector_id: 255,
                sector: Sector::filled(0xab),
            }
            .into(),
        );
        round_trip(Message::PeerReq);
        round_trip(
            PeerRes {
                peers: vec![
                    PeerAddress {
                        peer_id: PeerID::new([1; 32]),
                        ip: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
                        port: 9097,
                    },
                    PeerAddress {
                        peer_id: PeerID::new([2; 32]),
                        ip: "2001:db8::1".parse().unwrap(),
                        port: 1,
                    },
                ],
            }
            .into(),
        );
        round_trip(
            EquivocationProof {
                name: "foo".into(),
                a: update.signed_seal(),
                b: update.signed_seal(),
            }
            .into(),
        );
    }

    #[test]
    fn unknown_types_and_trailing_bytes_are_rejected() {
        assert_eq!(
            MessageType::from_u16(99),
            Err(CodecError::UnknownMessageType(99))
        );
        assert_eq!(
            Message::decode_payload(MessageType::Ping, &[0]),
            Err(CodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn oversized_blob_pages_are_rejected() {
        let res = BlobRes {
            name: "foo".into(),
            epoch_height: 0,
            payload_position: 0,
            prev_hash: CryptoHash::ZERO,
            reserved_root: CryptoHash::ZERO,
            payload: vec![Sector::zeroed(); MAX_SECTORS_PER_BLOB_RES + 1],
        };
        assert!(matches!(
            BlobRes::from_bytes(&res.to_bytes()),
            Err(CodecError::ArrayTooLong { .. })
        ));
    }

    #[test]
    fn responses_match_their_requests() {
        let req: Message = BlobReq {
            name: "foo".into(),
            epoch_height: 0,
            sector_size: 0,
        }
        .into();
        let res: Message = BlobRes {
            name: "foo".into(),
            epoch_height: 0,
            payload_position: 0,
            prev_hash: CryptoHash::ZERO,
            reserved_root: CryptoHash::ZERO,
            payload: vec![],
        }
        .into();
        assert_eq!(req.request_key(), res.response_key());
        assert_eq!(
            Message::PeerReq.request_key(),
            Message::from(PeerRes { peers: vec![] }).response_key()
        );
        assert_eq!(
            Message::from(NilUpdate { name: "bar".into() }).response_key(),
            Some((MessageType::UpdateReq, "bar".into()))
        );
        assert_eq!(Message::Ping.response_key(), None);
    }
}
