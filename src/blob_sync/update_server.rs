//! Answers `UpdateReq` with our stored version of a name when it is newer than the requester's.

use std::sync::Arc;

use crate::{
    kv::pluggables::KVStore,
    networking::{
        messages::{Message, MessageType, NilUpdate, Update, UpdateReq},
        mux::PeerMuxer,
    },
    types::data_types::SECTOR_COUNT,
    utils::multi_locker::MultiLocker,
};

pub struct UpdateServer<K: KVStore> {
    kv: K,
    locker: Arc<MultiLocker<String>>,
}

impl<K: KVStore> UpdateServer<K> {
    pub fn new(kv: K, locker: Arc<MultiLocker<String>>) -> UpdateServer<K> {
        UpdateServer { kv, locker }
    }

    pub fn serve(&self, req: &UpdateReq) -> Message {
        let nil = Message::NilUpdate(NilUpdate {
            name: req.name.clone(),
        });
        if req.sector_size > SECTOR_COUNT || self.locker.is_locked(&req.name) {
            return nil;
        }
        match self.kv.header(&req.name) {
            Ok(Some(header))
                if (header.epoch_height, header.sector_size)
                    > (req.epoch_height, req.sector_size) =>
            {
                Message::Update(Update::from_header(&header))
            }
            _ => nil,
        }
    }
}

pub(crate) fn register_handlers<K: KVStore>(mux: &PeerMuxer, server: Arc<UpdateServer<K>>) {
    let responder = mux.clone();
    mux.add_handler(MessageType::UpdateReq, move |from, msg| {
        let Message::UpdateReq(req) = msg else { return };
        if let Err(err) = responder.send(&from, &server.serve(&req)) {
            log::debug!("failed to answer update request for {} from {}: {}", req.name, from, err);
        }
    });
}
