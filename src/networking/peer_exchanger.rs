/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Peer discovery by asking connected peers for the peers they have verified.
//!
//! Answers `PeerReq` with up to [`MAX_PEERS_PER_PEER_RES`] verified peer records, excluding the
//! requester. Received records for unknown peers are stored unverified, so the connection manager
//! can later dial them.

use std::{
    sync::mpsc::Receiver,
    thread::{self, JoinHandle},
    time::Duration,
};

use rand::seq::SliceRandom;

use crate::{
    kv::{pluggables::KVStore, with_write_batch},
    types::{data_types::PeerID, header::PeerInfo},
    utils::{sampler::sample, shutdown::sleep_or_shutdown},
};

use super::{
    messages::{Message, MessageType, PeerAddress, PeerRes, MAX_PEERS_PER_PEER_RES},
    mux::PeerMuxer,
};

/// Register the `PeerReq` and `PeerRes` handlers on `mux`.
pub(crate) fn register_handlers<K: KVStore>(mux: &PeerMuxer, kv: K, max_peers: usize) {
    let max_peers = max_peers.min(MAX_PEERS_PER_PEER_RES);

    let responder = mux.clone();
    let peers = kv.clone();
    mux.add_handler(MessageType::PeerReq, move |from, _| {
        let res = verified_peers(&peers, &from, max_peers);
        if let Err(err) = responder.send(&from, &res.into()) {
            log::debug!("failed to answer peer request from {}: {}", from, err);
        }
    });

    let local_peer_id = mux.local_peer_id();
    mux.add_handler(MessageType::PeerRes, move |from, msg| {
        let Message::PeerRes(res) = msg else { return };
        let stored = store_unknown_peers(&kv, &local_peer_id, &res);
        if stored > 0 {
            log::debug!("learned {} new peers from {}", stored, from);
        }
    });
}

pub(crate) fn start_peer_exchanger(
    mux: PeerMuxer,
    interval: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if sleep_or_shutdown(&shutdown_signal, interval) {
            return;
        }
        let Some(peer_id) = mux.peer_ids().choose(&mut rand::thread_rng()).copied() else {
            continue;
        };
        if let Err(err) = mux.send(&peer_id, &Message::PeerReq) {
            log::debug!("peer request to {} failed: {}", peer_id, err);
        }
    })
}

fn verified_peers<K: KVStore>(kv: &K, requester: &PeerID, max_peers: usize) -> PeerRes {
    let candidates: Vec<PeerAddress> = match kv.peers() {
        Ok(peers) => peers
            .into_iter()
            .filter(|peer| peer.verify && peer.peer_id != *requester)
            .map(|peer| PeerAddress {
                peer_id: peer.peer_id,
                ip: peer.ip,
                port: peer.port,
            })
            .collect(),
        Err(err) => {
            log::warn!("failed to read the peer table: {}", err);
            Vec::new()
        }
    };
    PeerRes {
        peers: sample(&mut rand::thread_rng(), &candidates, max_peers),
    }
}

// Returns the number of records written.
fn store_unknown_peers<K: KVStore>(kv: &K, local_peer_id: &PeerID, res: &PeerRes) -> usize {
    let unknown: Vec<&PeerAddress> = res
        .peers
        .iter()
        .filter(|addr| addr.peer_id != *local_peer_id)
        .filter(|addr| !addr.ip.is_unspecified() && addr.port != 0)
        .filter(|addr| matches!(kv.peer(&addr.peer_id), Ok(None)))
        .collect();
    if unknown.is_empty() {
        return 0;
    }

    let mut kv = kv.clone();
    let _ = with_write_batch(&mut kv, |wb| {
        for addr in &unknown {
            wb.set_peer(&PeerInfo {
                peer_id: addr.peer_id,
                ip: addr.ip,
                port: addr.port,
                last_seen: 0,
                verify: false,
                inbound_banned_until: 0,
                outbound_banned_until: 0,
            });
        }
        Ok::<_, ()>(())
    });
    unknown.len()
}
