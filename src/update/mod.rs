/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The update pipeline.
//!
//! An update moves through the following states:
//!
//! ```text
//! received -> validated -> enqueued -> in-flight -> committed
//!                                               \-> aborted
//! ```
//!
//! - [`queue`] validates announcements and holds them until a worker is free.
//! - [`updater`] fetches, verifies and commits them.
//! - [`timebank`] limits how fast any one name may grow.

pub mod queue;

pub mod timebank;

pub mod updater;

use std::sync::Arc;

use crate::{
    kv::pluggables::KVStore,
    networking::{
        messages::{Message, MessageType},
        mux::PeerMuxer,
    },
};

use self::queue::{UpdateQueue, UpdateQueueError};

/// Feed `Update` and `EquivocationProof` messages received by `mux` into `queue`.
pub(crate) fn register_handlers<K: KVStore>(mux: &PeerMuxer, queue: Arc<UpdateQueue<K>>) {
    let gossip = mux.clone();
    let updates = Arc::clone(&queue);
    mux.add_handler(MessageType::Update, move |from, msg| {
        let Message::Update(update) = msg else { return };
        match updates.enqueue(&update, from) {
            Ok(()) => (),
            Err(UpdateQueueError::InvalidSignature) => {
                log::warn!("{} announced {} with a bad signature", from, update.name);
                if let Some(peer) = gossip.peer(&from) {
                    peer.close();
                }
            }
            Err(UpdateQueueError::SplitBrain(Some(proof))) => {
                gossip.gossip_all(&Message::EquivocationProof(*proof));
            }
            Err(err) => log::debug!("rejected update for {} from {}: {}", update.name, from, err),
        }
    });

    let gossip = mux.clone();
    mux.add_handler(MessageType::EquivocationProof, move |from, msg| {
        let Message::EquivocationProof(proof) = msg else { return };
        match queue.accept_equivocation_proof(&proof) {
            Ok(true) => {
                gossip.gossip_all(&Message::EquivocationProof(proof));
            }
            Ok(false) => (),
            Err(err) => log::debug!("rejected equivocation proof for {} from {}: {}", proof.name, from, err),
        }
    });
}
