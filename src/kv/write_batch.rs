/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A [`WriteBatch`] wrapper with typed setters for each state variable.

use std::net::IpAddr;

use borsh::BorshSerialize;

use crate::{
    codec::Encode,
    types::{
        data_types::{CryptoHash, PeerID},
        header::{EquivocationProof, Header, NameInfo, PeerInfo},
    },
};

use super::{
    pluggables::WriteBatch,
    variables::{self, concat},
};

/// Forms keys and serializes values so that callers never touch raw bytes.
pub struct StoreWriteBatch<W: WriteBatch>(pub(crate) W);

impl<W: WriteBatch> StoreWriteBatch<W> {
    pub fn new() -> StoreWriteBatch<W> {
        StoreWriteBatch(W::new())
    }

    /* ↓↓↓ Headers ↓↓↓ */

    pub fn set_header(&mut self, header: &Header) {
        self.0.set(
            &concat(variables::HEADERS_HEADER, header.name.as_bytes()),
            &serde_json::to_vec(header).expect("headers always serialize to JSON"),
        )
    }

    pub fn set_sector_base(&mut self, name: &str, row: &[CryptoHash]) {
        let row: Vec<[u8; 32]> = row.iter().map(CryptoHash::bytes).collect();
        self.0.set(
            &concat(variables::HEADERS_MERKLE_BASE, name.as_bytes()),
            &row.try_to_vec().expect("borsh serialization into memory cannot fail"),
        )
    }

    pub fn set_header_count(&mut self, count: u64) {
        self.0.set(variables::HEADERS_COUNT, &count.to_be_bytes())
    }

    /* ↓↓↓ Names ↓↓↓ */

    pub fn set_name_info(&mut self, info: &NameInfo) {
        self.0.set(
            &concat(variables::NAMES_NAME, info.name.as_bytes()),
            &serde_json::to_vec(info).expect("name infos always serialize to JSON"),
        )
    }

    pub fn set_last_name_import_height(&mut self, height: u32) {
        self.0
            .set(variables::LAST_NAME_IMPORT_HEIGHT, &(height as u64).to_be_bytes())
    }

    pub fn set_initial_import_complete(&mut self) {
        self.0
            .set(variables::INITIAL_IMPORT_COMPLETE, &variables::FLAG_SET)
    }

    /* ↓↓↓ Peers ↓↓↓ */

    pub fn set_peer(&mut self, peer: &PeerInfo) {
        self.0.set(
            &concat(variables::PEERS_PEER, peer.peer_id.to_string().as_bytes()),
            &serde_json::to_vec(peer).expect("peer records always serialize to JSON"),
        )
    }

    pub fn delete_peer(&mut self, peer_id: &PeerID) {
        self.0
            .delete(&concat(variables::PEERS_PEER, peer_id.to_string().as_bytes()))
    }

    pub fn set_inbound_ban(&mut self, ip: &IpAddr, until: u64) {
        self.0.set(
            &concat(variables::PEERS_INBOUND_BAN, ip.to_string().as_bytes()),
            &until.to_be_bytes(),
        )
    }

    pub fn set_outbound_ban(&mut self, ip: &IpAddr, until: u64) {
        self.0.set(
            &concat(variables::PEERS_OUTBOUND_BAN, ip.to_string().as_bytes()),
            &until.to_be_bytes(),
        )
    }

    /* ↓↓↓ Bans ↓↓↓ */

    pub fn set_name_ban(&mut self, name: &str) {
        self.0
            .set(&concat(variables::BANS_BAN, name.as_bytes()), &variables::FLAG_SET)
    }

    pub fn set_last_ban_list_import_at(&mut self, at: u64) {
        self.0
            .set(variables::LAST_BAN_LIST_IMPORT_AT, &at.to_be_bytes())
    }

    /* ↓↓↓ Equivocation proofs ↓↓↓ */

    pub fn set_equivocation_proof(&mut self, proof: &EquivocationProof) {
        self.0.set(
            &concat(variables::EQUIVOCATION_PROOFS, proof.name.as_bytes()),
            &proof.to_bytes(),
        )
    }
}

impl<W: WriteBatch> Default for StoreWriteBatch<W> {
    fn default() -> Self {
        Self::new()
    }
}
