/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Serves committed blob data to peers.
//!
//! Answers `TreeBaseReq`, `SectorReq` and `BlobReq`. Requests about a name that is currently
//! being written are ignored rather than queued, as are requests for data we do not have. Sectors
//! read from disk are memoized for a few seconds, keyed by the header's `received_at` so that a
//! commit invalidates them.

use std::{sync::Arc, time::Duration};

use crate::{
    blob_store::{BlobError, BlobStore},
    kv::pluggables::KVStore,
    networking::{
        messages::{
            BlobReq, BlobRes, Message, MessageType, SectorReq, SectorRes, TreeBaseReq, TreeBaseRes,
            MAX_SECTORS_PER_BLOB_RES,
        },
        mux::PeerMuxer,
    },
    types::data_types::{CryptoHash, Sector, SECTOR_COUNT},
    utils::{multi_locker::MultiLocker, ttl_cache::TtlCache},
};

type SectorKey = (String, u64, u16);

pub struct SectorServer<K: KVStore> {
    kv: K,
    blobs: Arc<BlobStore>,
    locker: Arc<MultiLocker<String>>,
    cache: TtlCache<SectorKey, Sector>,
}

impl<K: KVStore> SectorServer<K> {
    pub fn new(
        kv: K,
        blobs: Arc<BlobStore>,
        locker: Arc<MultiLocker<String>>,
        cache_ttl: Duration,
    ) -> SectorServer<K> {
        SectorServer {
            kv,
            blobs,
            locker,
            cache: TtlCache::new(cache_ttl),
        }
    }

    pub fn serve_tree_base(&self, req: &TreeBaseReq) -> Option<TreeBaseRes> {
        let _guard = self.locker.try_read(&req.name)?;
        let sector_hashes = self.kv.sector_base(&req.name).ok().flatten()?;
        Some(TreeBaseRes {
            name: req.name.clone(),
            sector_hashes,
        })
    }

    pub fn serve_sector(&self, req: &SectorReq) -> Option<SectorRes> {
        let _guard = self.locker.try_read(&req.name)?;
        let header = self.kv.header(&req.name).ok().flatten()?;
        if req.sector_id >= header.sector_size {
            return None;
        }
        let sector = self
            .cached_sectors(&req.name, header.received_at, req.sector_id, 1)
            .map_err(|err| log::warn!("failed to read {} sector {}: {}", req.name, req.sector_id, err))
            .ok()?
            .pop()?;
        Some(SectorRes {
            name: req.name.clone(),
            sector_id: req.sector_id,
            sector,
        })
    }

    /// One page of sectors starting at the requester's `sector_size`, if we hold more of the same
    /// epoch.
    pub fn serve_blob(&self, req: &BlobReq) -> Option<BlobRes> {
        if req.sector_size > SECTOR_COUNT {
            return None;
        }
        let _guard = self.locker.try_read(&req.name)?;
        let header = self.kv.header(&req.name).ok().flatten()?;
        if header.epoch_height != req.epoch_height || header.sector_size <= req.sector_size {
            return None;
        }
        let position = req.sector_size;
        let prev_hash = match position {
            0 => CryptoHash::ZERO,
            _ => *self
                .kv
                .sector_base(&req.name)
                .ok()
                .flatten()?
                .get(position as usize - 1)?,
        };
        let count = (header.sector_size - position).min(MAX_SECTORS_PER_BLOB_RES as u16);
        let payload = self
            .cached_sectors(&req.name, header.received_at, position, count)
            .map_err(|err| log::warn!("failed to read {} at sector {}: {}", req.name, position, err))
            .ok()?;
        Some(BlobRes {
            name: req.name.clone(),
            epoch_height: header.epoch_height,
            payload_position: position,
            prev_hash,
            reserved_root: header.reserved_root,
            payload,
        })
    }

    fn cached_sectors(
        &self,
        name: &str,
        received_at: u64,
        first: u16,
        count: u16,
    ) -> Result<Vec<Sector>, BlobError> {
        self.blobs.with_blob(name, |blob| {
            (first..first + count)
                .map(|id| {
                    let key = (name.to_string(), received_at, id);
                    if let Some(sector) = self.cache.get(&key) {
                        return Ok(sector);
                    }
                    let sector = blob.read_sector(id)?;
                    self.cache.insert(key, sector.clone());
                    Ok(sector)
                })
                .collect()
        })
    }
}

/// Answer sector traffic received by `mux` from `server`.
pub(crate) fn register_handlers<K: KVStore>(mux: &PeerMuxer, server: Arc<SectorServer<K>>) {
    let (responder, tree_bases) = (mux.clone(), Arc::clone(&server));
    mux.add_handler(MessageType::TreeBaseReq, move |from, msg| {
        let Message::TreeBaseReq(req) = msg else { return };
        if let Some(res) = tree_bases.serve_tree_base(&req) {
            let _ = responder.send(&from, &Message::TreeBaseRes(res));
        }
    });

    let (responder, sectors) = (mux.clone(), Arc::clone(&server));
    mux.add_handler(MessageType::SectorReq, move |from, msg| {
        let Message::SectorReq(req) = msg else { return };
        if let Some(res) = sectors.serve_sector(&req) {
            let _ = responder.send(&from, &Message::SectorRes(res));
        }
    });

    let responder = mux.clone();
    mux.add_handler(MessageType::BlobReq, move |from, msg| {
        let Message::BlobReq(req) = msg else { return };
        if let Some(res) = server.serve_blob(&req) {
            if let Err(err) = responder.send(&from, &Message::BlobRes(res)) {
                log::debug!("failed to send {} page to {}: {}", req.name, from, err);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob_store::serial_hash::{serial_hash_sectors, tip},
        kv::{mem_db::MemDB, put_header},
        types::{data_types::SignatureBytes, header::Header},
    };

    struct Fixture {
        _home: tempfile::TempDir,
        locker: Arc<MultiLocker<String>>,
        server: SectorServer<MemDB>,
        row: Vec<CryptoHash>,
    }

    // "foo" holds `n` committed sectors filled with 1, 2, 3, ...
    fn fixture(n: u8) -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(home.path()).unwrap());
        let sectors: Vec<Sector> = (1..=n).map(Sector::filled).collect();
        blobs
            .with_blob("foo", |blob| {
                let mut tx = blob.begin_transaction(0);
                sectors.iter().try_for_each(|s| tx.write_sector(s))?;
                tx.commit()
            })
            .unwrap();
        let row = serial_hash_sectors(CryptoHash::ZERO, &sectors);
        let mut kv = MemDB::new();
        put_header(
            &mut kv,
            &Header {
                name: "foo".into(),
                epoch_height: 2,
                sector_size: n as u16,
                sector_tip_hash: tip(&row),
                reserved_root: CryptoHash::ZERO,
                signature: SignatureBytes::new([0; 65]),
                epoch_start_at: 1,
                received_at: 1,
                timebank: 0,
                banned_at: 0,
            },
            &row,
        )
        .unwrap();
        let locker = Arc::new(MultiLocker::new());
        let server = SectorServer::new(kv, blobs, locker.clone(), Duration::from_secs(5));
        Fixture {
            _home: home,
            locker,
            server,
            row,
        }
    }

    fn blob_req(epoch_height: u16, sector_size: u16) -> BlobReq {
        BlobReq {
            name: "foo".into(),
            epoch_height,
            sector_size,
        }
    }

    #[test]
    fn blob_pages_continue_from_the_requesters_cursor() {
        let f = fixture(70);
        let first = f.server.serve_blob(&blob_req(2, 0)).unwrap();
        assert_eq!(first.payload_position, 0);
        assert_eq!(first.prev_hash, CryptoHash::ZERO);
        assert_eq!(first.payload.len(), MAX_SECTORS_PER_BLOB_RES);

        let second = f.server.serve_blob(&blob_req(2, 64)).unwrap();
        assert_eq!(second.payload_position, 64);
        assert_eq!(second.prev_hash, f.row[63]);
        assert_eq!(second.payload.len(), 6);
        assert_eq!(second.payload[0], Sector::filled(65));
        assert_eq!(
            tip(&serial_hash_sectors(second.prev_hash, &second.payload)),
            tip(&f.row)
        );
    }

    #[test]
    fn blob_requests_for_other_epochs_or_nothing_new_are_ignored() {
        let f = fixture(3);
        assert!(f.server.serve_blob(&blob_req(1, 0)).is_none());
        assert!(f.server.serve_blob(&blob_req(2, 3)).is_none());
        assert!(f.server.serve_blob(&blob_req(2, 300)).is_none());
        assert!(f.server.serve_blob(&BlobReq { name: "bar".into(), ..blob_req(2, 0) }).is_none());
    }

    #[test]
    fn sectors_and_tree_bases_are_served() {
        let f = fixture(3);
        let res = f
            .server
            .serve_sector(&SectorReq { name: "foo".into(), sector_id: 1 })
            .unwrap();
        assert_eq!(res.sector, Sector::filled(2));
        assert!(f
            .server
            .serve_sector(&SectorReq { name: "foo".into(), sector_id: 3 })
            .is_none());

        let base = f.server.serve_tree_base(&TreeBaseReq { name: "foo".into() }).unwrap();
        assert_eq!(base.sector_hashes, f.row);
    }

    #[test]
    fn write_locked_names_are_not_served() {
        let f = fixture(3);
        let _writer = f.locker.try_write(&"foo".to_string()).unwrap();
        assert!(f.server.serve_blob(&blob_req(2, 0)).is_none());
        assert!(f
            .server
            .serve_sector(&SectorReq { name: "foo".into(), sector_id: 0 })
            .is_none());
        assert!(f.server.serve_tree_base(&TreeBaseReq { name: "foo".into() }).is_none());
    }
}
