/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence.
//!
//! The daemon stores all of its metadata in a key-value store supplied by the embedder. Any
//! ordered KV engine works: implement [`KVStore`], [`KVGet`] and [`WriteBatch`] over it.
//! [`MemDB`](super::mem_db::MemDB) is a volatile reference implementation.

use std::{fmt::Display, io, net::IpAddr};

use borsh::BorshDeserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    codec::{CodecError, Decode},
    types::{
        data_types::{CryptoHash, PeerID},
        header::{EquivocationProof, Header, NameInfo, PeerInfo},
    },
};

use super::variables::{self, concat};

pub trait KVStore: KVGet + Clone + Send + Sync + 'static {
    type WriteBatch: WriteBatch;

    /// Apply every operation in `wb` atomically.
    fn write(&mut self, wb: Self::WriteBatch);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Every key-value pair whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    /* ↓↓↓ Headers ↓↓↓ */

    fn header(&self, name: &str) -> Result<Option<Header>, KVGetError> {
        get_json(
            self,
            &concat(variables::HEADERS_HEADER, name.as_bytes()),
            || Key::Header { name: name.into() },
        )
    }

    /// The serial hash row of `name`'s committed blob.
    fn sector_base(&self, name: &str) -> Result<Option<Vec<CryptoHash>>, KVGetError> {
        let Some(bytes) = self.get(&concat(variables::HEADERS_MERKLE_BASE, name.as_bytes())) else {
            return Ok(None);
        };
        let row = Vec::<[u8; 32]>::try_from_slice(&bytes).map_err(|err| {
            KVGetError::DeserializeValueError {
                key: Key::SectorBase { name: name.into() },
                source: DeserializeError::Borsh(err),
            }
        })?;
        Ok(Some(row.into_iter().map(CryptoHash::new).collect()))
    }

    fn header_count(&self) -> Result<u64, KVGetError> {
        Ok(get_u64(self, variables::HEADERS_COUNT, || Key::HeaderCount)?.unwrap_or(0))
    }

    /* ↓↓↓ Names ↓↓↓ */

    fn name_info(&self, name: &str) -> Result<Option<NameInfo>, KVGetError> {
        get_json(self, &concat(variables::NAMES_NAME, name.as_bytes()), || {
            Key::NameInfo { name: name.into() }
        })
    }

    fn name_infos(&self) -> Result<Vec<NameInfo>, KVGetError> {
        self.scan_prefix(variables::NAMES_NAME)
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_slice(&value).map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::NameInfo {
                        name: String::from_utf8_lossy(&key[variables::NAMES_NAME.len()..]).into(),
                    },
                    source: DeserializeError::Json(err),
                })
            })
            .collect()
    }

    fn last_name_import_height(&self) -> Result<u32, KVGetError> {
        let height = get_u64(self, variables::LAST_NAME_IMPORT_HEIGHT, || {
            Key::LastNameImportHeight
        })?;
        Ok(height.unwrap_or(0) as u32)
    }

    fn initial_import_complete(&self) -> bool {
        self.get(variables::INITIAL_IMPORT_COMPLETE).is_some()
    }

    /* ↓↓↓ Peers ↓↓↓ */

    fn peer(&self, peer_id: &PeerID) -> Result<Option<PeerInfo>, KVGetError> {
        get_json(
            self,
            &concat(variables::PEERS_PEER, peer_id.to_string().as_bytes()),
            || Key::Peer { peer_id: *peer_id },
        )
    }

    fn peers(&self) -> Result<Vec<PeerInfo>, KVGetError> {
        self.scan_prefix(variables::PEERS_PEER)
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_slice(&value).map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::Peers,
                    source: DeserializeError::Json(err),
                })
            })
            .collect()
    }

    fn inbound_ban_until(&self, ip: &IpAddr) -> Result<Option<u64>, KVGetError> {
        get_u64(
            self,
            &concat(variables::PEERS_INBOUND_BAN, ip.to_string().as_bytes()),
            || Key::InboundBan { ip: *ip },
        )
    }

    fn outbound_ban_until(&self, ip: &IpAddr) -> Result<Option<u64>, KVGetError> {
        get_u64(
            self,
            &concat(variables::PEERS_OUTBOUND_BAN, ip.to_string().as_bytes()),
            || Key::OutboundBan { ip: *ip },
        )
    }

    /* ↓↓↓ Bans ↓↓↓ */

    fn is_name_banned(&self, name: &str) -> bool {
        self.get(&concat(variables::BANS_BAN, name.as_bytes()))
            .is_some()
    }

    fn last_ban_list_import_at(&self) -> Result<Option<u64>, KVGetError> {
        get_u64(self, variables::LAST_BAN_LIST_IMPORT_AT, || {
            Key::LastBanListImportAt
        })
    }

    /* ↓↓↓ Equivocation proofs ↓↓↓ */

    fn equivocation_proof(&self, name: &str) -> Result<Option<EquivocationProof>, KVGetError> {
        let Some(bytes) = self.get(&concat(variables::EQUIVOCATION_PROOFS, name.as_bytes())) else {
            return Ok(None);
        };
        EquivocationProof::from_bytes(&bytes)
            .map(Some)
            .map_err(|err| KVGetError::DeserializeValueError {
                key: Key::EquivocationProof { name: name.into() },
                source: DeserializeError::Codec(err),
            })
    }
}

fn get_json<G: KVGet + ?Sized, T: DeserializeOwned>(
    kv: &G,
    key_bytes: &[u8],
    key: impl FnOnce() -> Key,
) -> Result<Option<T>, KVGetError> {
    match kv.get(key_bytes) {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            KVGetError::DeserializeValueError {
                key: key(),
                source: DeserializeError::Json(err),
            }
        }),
    }
}

fn get_u64<G: KVGet + ?Sized>(
    kv: &G,
    key_bytes: &[u8],
    key: impl FnOnce() -> Key,
) -> Result<Option<u64>, KVGetError> {
    match kv.get(key_bytes) {
        None => Ok(None),
        Some(bytes) => {
            let bytes: [u8; 8] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KVGetError::DeserializeValueError {
                        key: key(),
                        source: DeserializeError::Length {
                            expected: 8,
                            found: bytes.len(),
                        },
                    })?;
            Ok(Some(u64::from_be_bytes(bytes)))
        }
    }
}

/// Error when the value stored under a key cannot be deserialized into its expected type.
#[derive(Debug, Error)]
pub enum KVGetError {
    #[error("failed to deserialize {key}: {source}")]
    DeserializeValueError { key: Key, source: DeserializeError },
}

#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error(transparent)]
    Json(serde_json::Error),
    #[error(transparent)]
    Borsh(io::Error),
    #[error(transparent)]
    Codec(CodecError),
    #[error("expected {expected} bytes, found {found}")]
    Length { expected: usize, found: usize },
}

#[derive(Debug)]
pub enum Key {
    Header { name: String },
    SectorBase { name: String },
    HeaderCount,
    NameInfo { name: String },
    LastNameImportHeight,
    Peer { peer_id: PeerID },
    Peers,
    InboundBan { ip: IpAddr },
    OutboundBan { ip: IpAddr },
    LastBanListImportAt,
    EquivocationProof { name: String },
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Header { name } => write!(f, "Header for name {}", name),
            Key::SectorBase { name } => write!(f, "Sector base for name {}", name),
            Key::HeaderCount => write!(f, "Header count"),
            Key::NameInfo { name } => write!(f, "Name info for name {}", name),
            Key::LastNameImportHeight => write!(f, "Last name import height"),
            Key::Peer { peer_id } => write!(f, "Peer record for peer {}", peer_id),
            Key::Peers => write!(f, "Peer records"),
            Key::InboundBan { ip } => write!(f, "Inbound ban for {}", ip),
            Key::OutboundBan { ip } => write!(f, "Outbound ban for {}", ip),
            Key::LastBanListImportAt => write!(f, "Last ban list import time"),
            Key::EquivocationProof { name } => write!(f, "Equivocation proof for name {}", name),
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}
