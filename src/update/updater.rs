/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Workers that turn queued updates into committed blobs, and the local commit path.
//!
//! For each [`QueueItem`] a worker:
//! 1. Skips it if the stored header already has the announced version.
//! 2. Takes the name's write lock.
//! 3. Charges the name's [timebank](super::timebank) for the sectors it is about to add.
//! 4. Pages the missing sectors from the announcing peers with `BlobReq`, one peer at a time,
//!    verifying every page against the running serial hash. A peer whose data does not chain to the
//!    signed tip is disconnected and the next one is tried.
//! 5. Writes the sectors through a blob transaction, commits it, and stores the new header with
//!    its sector base row.
//! 6. Gossips the update onward, unless the name was imported too recently.
//!
//! Every processed item, committed or not, ends in an [`UpdateProcessedEvent`].

use std::{
    sync::{mpsc::Receiver, Arc},
    thread::{self, JoinHandle},
    time::{Instant, SystemTime},
};

use thiserror::Error;

use crate::{
    blob_store::{
        serial_hash::{chain, serial_hash_sectors, tip},
        Blob, BlobError, BlobStore, Transaction,
    },
    config::{TimebankConfig, UpdaterConfig},
    events::{Event, LocalCommitEvent, UpdateProcessedEvent},
    kv::{
        pluggables::{KVGetError, KVStore},
        put_header, with_write_batch,
    },
    networking::{
        messages::{BlobReq, Message, Update},
        mux::{MuxError, PeerMuxer},
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{unix_now, CryptoHash, EpochHeight, PeerID, Sector, SECTOR_COUNT},
        header::{seal_hash, Header},
    },
    utils::{
        multi_locker::MultiLocker,
        observable::Observable,
        shutdown::{should_shut_down, sleep_or_shutdown},
    },
};

use super::{
    queue::{QueueItem, UpdateQueue},
    timebank::check_timebank,
};

pub struct Updater<K: KVStore> {
    config: UpdaterConfig,
    timebank: TimebankConfig,
    kv: K,
    blobs: Arc<BlobStore>,
    locker: Arc<MultiLocker<String>>,
    mux: PeerMuxer,
    queue: Arc<UpdateQueue<K>>,
    events: Observable<Event>,
}

impl<K: KVStore> Updater<K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: UpdaterConfig,
        timebank: TimebankConfig,
        kv: K,
        blobs: Arc<BlobStore>,
        locker: Arc<MultiLocker<String>>,
        mux: PeerMuxer,
        queue: Arc<UpdateQueue<K>>,
        events: Observable<Event>,
    ) -> Updater<K> {
        Updater {
            config,
            timebank,
            kv,
            blobs,
            locker,
            mux,
            queue,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<UpdateQueue<K>> {
        &self.queue
    }

    pub(crate) fn start_worker(self: &Arc<Self>, shutdown_signal: Receiver<()>) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        thread::spawn(move || loop {
            if should_shut_down(&shutdown_signal) {
                return;
            }
            match updater.queue.dequeue() {
                Some(item) => updater.process(item),
                None => {
                    if sleep_or_shutdown(&shutdown_signal, updater.config.poll_interval) {
                        return;
                    }
                }
            }
        })
    }

    /// Sync and commit one queued item, then report the outcome.
    pub fn process(&self, item: QueueItem) {
        let outcome = self.sync_item(&item);
        match &outcome {
            Ok(()) => log::info!(
                "committed {} at epoch {} sector size {}",
                item.name,
                item.epoch_height,
                item.sector_size
            ),
            Err(err) => log::debug!("dropped update for {}: {}", item.name, err),
        }
        self.events.emit(Event::UpdateProcessed(UpdateProcessedEvent {
            timestamp: SystemTime::now(),
            name: item.name.clone(),
            epoch_height: item.epoch_height,
            sector_size: item.sector_size,
            outcome: outcome.map_err(|err| err.to_string()),
        }));
    }

    fn sync_item(&self, item: &QueueItem) -> Result<(), UpdaterError> {
        self.stored_behind(item)?;
        let _guard = self
            .locker
            .try_write(&item.name)
            .ok_or(UpdaterError::NameLocked)?;
        // Another writer may have committed between the check above and taking the lock.
        let stored = self.stored_behind(item)?;

        let new_epoch = stored
            .as_ref()
            .map_or(true, |header| item.epoch_height > header.epoch_height);
        let start = match &stored {
            Some(header) if !new_epoch => header.sector_size,
            _ => 0,
        };
        let now = unix_now();
        let new_timebank = check_timebank(
            &self.timebank,
            stored.as_ref().map(|header| header.received_at),
            stored.as_ref().map_or(0, |header| header.timebank),
            item.sector_size - start,
            now,
        );
        if new_timebank < 0 {
            return Err(UpdaterError::InsufficientTimebank);
        }

        let blob = self.blobs.get(&item.name)?;
        let result = self.fetch_and_commit(&blob, item, stored, new_epoch, start, new_timebank, now);
        self.blobs.put(&blob);
        let header = result?;

        let last_import_height = self.kv.last_name_import_height()?;
        if last_import_height.saturating_sub(item.import_height) >= self.config.gossip_import_height_diff {
            self.mux.gossip_all(&Update::from_header(&header).into());
        }
        Ok(())
    }

    /// The stored header for the item's name, provided it is older than the item.
    fn stored_behind(&self, item: &QueueItem) -> Result<Option<Header>, UpdaterError> {
        let stored = self.kv.header(&item.name)?;
        match &stored {
            Some(header)
                if (header.epoch_height, header.sector_size)
                    >= (item.epoch_height, item.sector_size) =>
            {
                Err(UpdaterError::AlreadySynchronized)
            }
            _ => Ok(stored),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_and_commit(
        &self,
        blob: &Arc<Blob>,
        item: &QueueItem,
        stored: Option<Header>,
        new_epoch: bool,
        start: u16,
        new_timebank: i32,
        now: u64,
    ) -> Result<Header, UpdaterError> {
        let base = if new_epoch {
            Vec::new()
        } else {
            self.sector_base(blob, start)?
        };
        let prev_hash = tip(&base);

        let mut banned_at = stored.as_ref().map_or(0, |header| header.banned_at);
        let mut sectors = None;
        for peer_id in item.peer_ids.iter().take(self.config.max_fetch_peers) {
            let deadline = Instant::now() + self.config.fetch_timeout;
            match self.fetch_from(peer_id, item, start, prev_hash, deadline) {
                Ok(fetched) => {
                    sectors = Some(fetched);
                    break;
                }
                Err(FetchError::TipMismatch) => {
                    log::warn!("{} served data for {} that does not match its tip", peer_id, item.name);
                    if let Some(peer) = self.mux.peer(peer_id) {
                        peer.close();
                    }
                    banned_at = now;
                    if let Some(header) = &stored {
                        self.mark_banned(header, now);
                    }
                }
                Err(FetchError::Mux(err)) => log::debug!("fetching {} failed: {}", item.name, err),
            }
        }
        let sectors = sectors.ok_or(UpdaterError::SyncTimeout)?;

        let mut tx = blob.begin_transaction(start);
        if let Err(err) = write_sectors(&mut tx, new_epoch, &sectors) {
            let _ = tx.rollback();
            return Err(err.into());
        }
        tx.commit()?;

        let mut row = base;
        row.extend(serial_hash_sectors(prev_hash, &sectors));
        let header = Header {
            name: item.name.clone(),
            epoch_height: item.epoch_height,
            sector_size: item.sector_size,
            sector_tip_hash: item.sector_tip_hash,
            reserved_root: item.reserved_root,
            signature: item.signature,
            epoch_start_at: match &stored {
                Some(header) if !new_epoch => header.epoch_start_at,
                _ => now,
            },
            received_at: now,
            timebank: new_timebank,
            banned_at,
        };
        put_header(&mut self.kv.clone(), &header, &row)?;
        Ok(header)
    }

    // Page sectors `start..item.sector_size` from one peer.
    fn fetch_from(
        &self,
        peer_id: &PeerID,
        item: &QueueItem,
        start: u16,
        prev_hash: CryptoHash,
        deadline: Instant,
    ) -> Result<Vec<Sector>, FetchError> {
        let mut sectors = Vec::with_capacity((item.sector_size - start) as usize);
        let mut link = prev_hash;
        let mut cursor = start;
        while cursor < item.sector_size {
            let req = BlobReq {
                name: item.name.clone(),
                epoch_height: item.epoch_height,
                sector_size: cursor,
            };
            let res = match self.mux.request(peer_id, &req.into())?.wait(deadline)? {
                Message::BlobRes(res) => res,
                _ => return Err(FetchError::TipMismatch),
            };
            if res.name != item.name
                || res.epoch_height != item.epoch_height
                || res.payload_position != cursor
                || res.prev_hash != link
                || res.payload.is_empty()
            {
                return Err(FetchError::TipMismatch);
            }
            let wanted = (item.sector_size - cursor) as usize;
            for sector in res.payload.into_iter().take(wanted) {
                link = chain(&link, sector.bytes());
                sectors.push(sector);
                cursor += 1;
            }
        }
        if link != item.sector_tip_hash {
            return Err(FetchError::TipMismatch);
        }
        Ok(sectors)
    }

    fn mark_banned(&self, header: &Header, now: u64) {
        let mut kv = self.kv.clone();
        let _ = with_write_batch(&mut kv, |wb| {
            wb.set_header(&Header {
                banned_at: now,
                ..header.clone()
            });
            Ok::<_, ()>(())
        });
    }

    // The first `len` links of the committed blob's serial hash row, recomputed from the blob when
    // the stored row is missing or short.
    fn sector_base(&self, blob: &Blob, len: u16) -> Result<Vec<CryptoHash>, UpdaterError> {
        if let Some(row) = self.kv.sector_base(blob.name())? {
            if row.len() >= len as usize {
                return Ok(row[..len as usize].to_vec());
            }
        }
        let mut link = CryptoHash::ZERO;
        (0..len)
            .map(|id| {
                link = chain(&link, blob.read_sector(id)?.bytes());
                Ok::<_, UpdaterError>(link)
            })
            .collect()
    }

    /* ↓↓↓ Local commits ↓↓↓ */

    /// Append `sectors` to `name`'s blob as its owner, or start epoch `epoch_height` with them when
    /// it is newer than the stored one. Signs and stores the new header and gossips it.
    pub fn commit_local(
        &self,
        name: &str,
        epoch_height: EpochHeight,
        sectors: &[Sector],
        keypair: &Keypair,
    ) -> Result<Header, UpdaterError> {
        let info = self
            .kv
            .name_info(name)?
            .ok_or(UpdaterError::NameNotFound)?;
        if info.public_key != keypair.public_bytes() {
            return Err(UpdaterError::InvalidKey);
        }
        let _guard = self
            .locker
            .try_write(&name.to_string())
            .ok_or(UpdaterError::NameLocked)?;

        let stored = self.kv.header(name)?;
        let new_epoch = match &stored {
            Some(header) if epoch_height < header.epoch_height => {
                return Err(UpdaterError::StaleEpoch)
            }
            Some(header) => epoch_height > header.epoch_height,
            None => true,
        };
        let start = match &stored {
            Some(header) if !new_epoch => header.sector_size,
            _ => 0,
        };
        if sectors.is_empty() {
            return Err(UpdaterError::NoSectors);
        }
        if start as usize + sectors.len() > SECTOR_COUNT as usize {
            return Err(UpdaterError::TooManySectors);
        }

        let now = unix_now();
        let new_timebank = check_timebank(
            &self.timebank,
            stored.as_ref().map(|header| header.received_at),
            stored.as_ref().map_or(0, |header| header.timebank),
            sectors.len() as u16,
            now,
        );
        if new_timebank < 0 {
            return Err(UpdaterError::InsufficientTimebank);
        }

        let blob = self.blobs.get(name)?;
        let result = (|| -> Result<Header, UpdaterError> {
            let mut row = if new_epoch {
                Vec::new()
            } else {
                self.sector_base(&blob, start)?
            };
            row.extend(serial_hash_sectors(tip(&row), sectors));

            let mut tx = blob.begin_transaction(start);
            if let Err(err) = write_sectors(&mut tx, new_epoch, sectors) {
                let _ = tx.rollback();
                return Err(err.into());
            }
            tx.commit()?;

            let sector_size = start + sectors.len() as u16;
            let sector_tip_hash = tip(&row);
            let header = Header {
                name: name.to_string(),
                epoch_height,
                sector_size,
                sector_tip_hash,
                reserved_root: CryptoHash::ZERO,
                signature: keypair.sign(&seal_hash(
                    name,
                    epoch_height,
                    sector_size,
                    &sector_tip_hash,
                    &CryptoHash::ZERO,
                )),
                epoch_start_at: match &stored {
                    Some(header) if !new_epoch => header.epoch_start_at,
                    _ => now,
                },
                received_at: now,
                timebank: new_timebank,
                banned_at: stored.as_ref().map_or(0, |header| header.banned_at),
            };
            put_header(&mut self.kv.clone(), &header, &row)?;
            Ok(header)
        })();
        self.blobs.put(&blob);
        let header = result?;

        self.mux.gossip_all(&Update::from_header(&header).into());
        self.events.emit(Event::LocalCommit(LocalCommitEvent {
            timestamp: SystemTime::now(),
            name: header.name.clone(),
            epoch_height: header.epoch_height,
            sector_size: header.sector_size,
            sector_tip_hash: header.sector_tip_hash,
        }));
        Ok(header)
    }
}

fn write_sectors(tx: &mut Transaction, truncate: bool, sectors: &[Sector]) -> Result<(), BlobError> {
    if truncate {
        tx.truncate()?;
    }
    sectors.iter().try_for_each(|sector| tx.write_sector(sector))
}

enum FetchError {
    TipMismatch,
    Mux(MuxError),
}

impl From<MuxError> for FetchError {
    fn from(err: MuxError) -> Self {
        FetchError::Mux(err)
    }
}

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("the stored header is already at this version")]
    AlreadySynchronized,
    #[error("name is locked by another writer")]
    NameLocked,
    #[error("not enough timebank for this update")]
    InsufficientTimebank,
    #[error("no announcing peer served the update in time")]
    SyncTimeout,
    #[error("name is not registered")]
    NameNotFound,
    #[error("key does not own the name")]
    InvalidKey,
    #[error("epoch is older than the stored one")]
    StaleEpoch,
    #[error("nothing to commit")]
    NoSectors,
    #[error("blob would exceed {SECTOR_COUNT} sectors")]
    TooManySectors,
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    KVGet(#[from] KVGetError),
}

#[cfg(test)]
mod tests {
    use indexmap::IndexSet;

    use super::*;
    use crate::{
        config::UpdateQueueConfig,
        kv::{mem_db::MemDB, pluggables::KVGet},
        networking::NETWORK_MAGIC,
        types::header::NameInfo,
    };

    struct Fixture {
        _home: tempfile::TempDir,
        kv: MemDB,
        owner: Keypair,
        updater: Updater<MemDB>,
    }

    fn fixture(timebank: TimebankConfig) -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let mut kv = MemDB::new();
        let owner = Keypair::generate();
        with_write_batch(&mut kv, |wb| {
            wb.set_name_info(&NameInfo {
                name: "foo".into(),
                public_key: owner.public_bytes(),
                import_height: 0,
            });
            wb.set_initial_import_complete();
            Ok::<_, ()>(())
        })
        .unwrap();
        let events = Observable::new();
        let updater = Updater::new(
            UpdaterConfig::default(),
            timebank,
            kv.clone(),
            Arc::new(BlobStore::new(home.path()).unwrap()),
            Arc::new(MultiLocker::new()),
            PeerMuxer::new(Keypair::generate(), NETWORK_MAGIC, events.clone()),
            Arc::new(UpdateQueue::new(&UpdateQueueConfig::default(), kv.clone(), events.clone())),
            events,
        );
        Fixture {
            _home: home,
            kv,
            owner,
            updater,
        }
    }

    fn no_interval() -> TimebankConfig {
        TimebankConfig {
            min_update_interval: std::time::Duration::ZERO,
            ..TimebankConfig::default()
        }
    }

    fn sectors(range: std::ops::Range<u8>) -> Vec<Sector> {
        range.map(Sector::filled).collect()
    }

    #[test]
    fn local_commits_append_and_sign() {
        let f = fixture(no_interval());
        let first = f.updater.commit_local("foo", 0, &sectors(1..4), &f.owner).unwrap();
        assert_eq!(first.sector_size, 3);
        assert!(first.verify_signature(&f.owner.public_bytes()));
        assert_eq!(first.timebank, 512 - 3);

        let second = f.updater.commit_local("foo", 0, &sectors(4..6), &f.owner).unwrap();
        assert_eq!(second.sector_size, 5);
        assert_eq!(
            second.sector_tip_hash,
            tip(&serial_hash_sectors(CryptoHash::ZERO, &sectors(1..6)))
        );
        assert_eq!(second.epoch_start_at, first.epoch_start_at);
        assert_eq!(f.kv.header("foo").unwrap(), Some(second.clone()));
        assert_eq!(f.kv.sector_base("foo").unwrap().unwrap().len(), 5);

        let sector = f.updater.blobs.with_blob("foo", |blob| blob.read_sector(4)).unwrap();
        assert_eq!(sector, Sector::filled(5));
    }

    #[test]
    fn a_new_epoch_rewrites_the_blob() {
        let f = fixture(no_interval());
        f.updater.commit_local("foo", 0, &sectors(1..4), &f.owner).unwrap();
        let header = f.updater.commit_local("foo", 1, &sectors(9..10), &f.owner).unwrap();
        assert_eq!(header.sector_size, 1);

        let (first, second) = f
            .updater
            .blobs
            .with_blob("foo", |blob| Ok((blob.read_sector(0)?, blob.read_sector(1)?)))
            .unwrap();
        assert_eq!(first, Sector::filled(9));
        assert_eq!(second, Sector::zeroed());
        assert!(matches!(
            f.updater.commit_local("foo", 0, &sectors(1..2), &f.owner),
            Err(UpdaterError::StaleEpoch)
        ));
    }

    #[test]
    fn only_the_registered_key_commits() {
        let f = fixture(no_interval());
        assert!(matches!(
            f.updater.commit_local("foo", 0, &sectors(1..2), &Keypair::generate()),
            Err(UpdaterError::InvalidKey)
        ));
        assert!(matches!(
            f.updater.commit_local("bar", 0, &sectors(1..2), &f.owner),
            Err(UpdaterError::NameNotFound)
        ));
    }

    #[test]
    fn a_second_writer_sees_the_name_locked() {
        let f = fixture(no_interval());
        let _held = f.updater.locker.try_write(&"foo".to_string()).unwrap();
        assert!(matches!(
            f.updater.commit_local("foo", 0, &sectors(1..2), &f.owner),
            Err(UpdaterError::NameLocked)
        ));
    }

    #[test]
    fn local_commits_respect_the_timebank() {
        let f = fixture(TimebankConfig::default());
        f.updater.commit_local("foo", 0, &sectors(1..2), &f.owner).unwrap();
        assert!(matches!(
            f.updater.commit_local("foo", 0, &sectors(2..3), &f.owner),
            Err(UpdaterError::InsufficientTimebank)
        ));
    }

    fn queue_item(f: &Fixture, sector_size: u16) -> QueueItem {
        QueueItem {
            name: "foo".into(),
            epoch_height: 0,
            sector_size,
            sector_tip_hash: CryptoHash::new([1; 32]),
            reserved_root: CryptoHash::ZERO,
            signature: f.owner.sign(&CryptoHash::ZERO),
            public_key: f.owner.public_bytes(),
            import_height: 0,
            peer_ids: IndexSet::from([PeerID::new([7; 32])]),
        }
    }

    #[test]
    fn items_for_a_locked_name_are_not_synced() {
        let f = fixture(no_interval());
        f.updater.commit_local("foo", 0, &sectors(1..2), &f.owner).unwrap();
        let held = f.updater.locker.try_write(&"foo".to_string()).unwrap();
        assert!(matches!(
            f.updater.sync_item(&queue_item(&f, 2)),
            Err(UpdaterError::NameLocked)
        ));
        assert_eq!(f.kv.header("foo").unwrap().unwrap().sector_size, 1);

        // The holder commits a version equal to the item before releasing.
        let mut kv = f.kv.clone();
        let mut header = kv.header("foo").unwrap().unwrap();
        header.sector_size = 2;
        put_header(&mut kv, &header, &[CryptoHash::ZERO; 2]).unwrap();
        drop(held);
        assert!(matches!(
            f.updater.sync_item(&queue_item(&f, 2)),
            Err(UpdaterError::AlreadySynchronized)
        ));
    }

    #[test]
    fn items_without_reachable_peers_time_out() {
        let f = fixture(no_interval());
        let mut item = queue_item(&f, 2);
        assert!(matches!(f.updater.sync_item(&item), Err(UpdaterError::SyncTimeout)));
        assert_eq!(f.kv.header("foo").unwrap(), None);

        f.updater.commit_local("foo", 0, &sectors(1..3), &f.owner).unwrap();
        assert!(matches!(
            f.updater.sync_item(&item),
            Err(UpdaterError::AlreadySynchronized)
        ));
        item.sector_size = 1;
        assert!(matches!(
            f.updater.sync_item(&item),
            Err(UpdaterError::AlreadySynchronized)
        ));
    }
}
