/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Admission of announced updates into the work queue.
//!
//! An incoming [`Update`] is checked, in order, for:
//! 1. The name importer having caught up with the registry.
//! 2. A syntactically valid, non-blacklisted name.
//! 3. The name not appearing on an imported ban list.
//! 4. A sector size of at most [`SECTOR_COUNT`].
//! 5. A registered public key for the name.
//! 6. A signature over the seal by that key.
//! 7. Being newer than the stored header: a higher epoch, or the same epoch with more sectors.
//! 8. Merging with a queued update for the same name: a newer one replaces it, the same one adds
//!    the announcing peer, and a different one at the same height is a split brain.
//!
//! The queue is FIFO over names and holds at most one item per name.

use std::{
    collections::HashSet,
    sync::Mutex,
    time::SystemTime,
};

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

use crate::{
    config::UpdateQueueConfig,
    events::{EquivocationDetectedEvent, Event, UpdateEnqueuedEvent},
    kv::{
        pluggables::{KVGetError, KVStore},
        with_write_batch,
    },
    networking::messages::Update,
    types::{
        crypto_primitives::verify,
        data_types::{
            CryptoHash, EpochHeight, PeerID, PublicKeyBytes, SectorSize, SignatureBytes,
            SECTOR_COUNT,
        },
        header::EquivocationProof,
        names::{validate_name, NameError},
    },
    utils::observable::Observable,
};

/// An update waiting to be fetched, with every peer that announced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub sector_tip_hash: CryptoHash,
    pub reserved_root: CryptoHash,
    pub signature: SignatureBytes,
    pub public_key: PublicKeyBytes,
    pub import_height: u32,
    pub peer_ids: IndexSet<PeerID>,
}

impl QueueItem {
    pub fn update(&self) -> Update {
        Update {
            name: self.name.clone(),
            epoch_height: self.epoch_height,
            sector_size: self.sector_size,
            sector_tip_hash: self.sector_tip_hash,
            reserved_root: self.reserved_root,
            signature: self.signature,
        }
    }

    fn version(&self) -> (EpochHeight, SectorSize) {
        (self.epoch_height, self.sector_size)
    }
}

pub struct UpdateQueue<K: KVStore> {
    kv: K,
    max_len: usize,
    blacklist: HashSet<String>,
    items: Mutex<IndexMap<String, QueueItem>>,
    events: Observable<Event>,
}

impl<K: KVStore> UpdateQueue<K> {
    pub fn new(config: &UpdateQueueConfig, kv: K, events: Observable<Event>) -> UpdateQueue<K> {
        UpdateQueue {
            kv,
            max_len: config.max_len,
            blacklist: config.blacklist.iter().cloned().collect(),
            items: Mutex::new(IndexMap::new()),
            events,
        }
    }

    /// Validate `update`, announced by `peer_id`, and queue it for fetching.
    pub fn enqueue(&self, update: &Update, peer_id: PeerID) -> Result<(), UpdateQueueError> {
        if !self.kv.initial_import_complete() {
            return Err(UpdateQueueError::InitialImportIncomplete);
        }
        validate_name(&update.name)?;
        if self.blacklist.contains(&update.name) {
            return Err(NameError::Blacklisted.into());
        }
        if self.kv.is_name_banned(&update.name) {
            return Err(UpdateQueueError::NameBanned);
        }
        if update.sector_size > SECTOR_COUNT {
            return Err(UpdateQueueError::InvalidSectorSize(update.sector_size));
        }
        let info = self
            .kv
            .name_info(&update.name)?
            .ok_or(UpdateQueueError::NameNotFound)?;
        if !verify(&update.seal_hash(), &update.signature, &info.public_key) {
            return Err(UpdateQueueError::InvalidSignature);
        }

        match self.kv.header(&update.name)? {
            Some(header) if update.epoch_height < header.epoch_height => {
                return Err(UpdateQueueError::StaleTimestamp)
            }
            Some(header) if update.epoch_height == header.epoch_height => {
                if update.sector_size == header.sector_size {
                    return Err(UpdateQueueError::IdenticalTimestamp);
                }
                if update.sector_size < header.sector_size {
                    return Err(UpdateQueueError::StaleTimestamp);
                }
            }
            Some(_) | None if update.sector_size == 0 => {
                return Err(UpdateQueueError::EmptyEpoch)
            }
            _ => (),
        }

        let incoming = QueueItem {
            name: update.name.clone(),
            epoch_height: update.epoch_height,
            sector_size: update.sector_size,
            sector_tip_hash: update.sector_tip_hash,
            reserved_root: update.reserved_root,
            signature: update.signature,
            public_key: info.public_key,
            import_height: info.import_height,
            peer_ids: IndexSet::from([peer_id]),
        };

        let mut items = self.items.lock().expect("update queue mutex poisoned");
        match items.get_mut(&update.name) {
            Some(queued) if incoming.version() > queued.version() => {
                *queued = incoming;
            }
            Some(queued) if incoming.version() == queued.version() => {
                if queued.signature != incoming.signature {
                    let proof = EquivocationProof {
                        name: update.name.clone(),
                        a: queued.update().signed_seal(),
                        b: update.signed_seal(),
                    };
                    drop(items);
                    return Err(self.split_brain(proof));
                }
                queued.peer_ids.insert(peer_id);
                return Ok(());
            }
            Some(_) => return Err(UpdateQueueError::StaleTimestamp),
            None => {
                if items.len() >= self.max_len {
                    return Err(UpdateQueueError::UpdateQueueMaxLen);
                }
                items.insert(update.name.clone(), incoming);
            }
        }
        drop(items);

        self.events.emit(Event::UpdateEnqueued(UpdateEnqueuedEvent {
            timestamp: SystemTime::now(),
            name: update.name.clone(),
            epoch_height: update.epoch_height,
            sector_size: update.sector_size,
            announced_by: peer_id,
        }));
        Ok(())
    }

    /// Take the oldest queued item.
    pub fn dequeue(&self) -> Option<QueueItem> {
        self.items
            .lock()
            .expect("update queue mutex poisoned")
            .shift_remove_index(0)
            .map(|(_, item)| item)
    }

    pub fn peek(&self, name: &str) -> Option<QueueItem> {
        self.items
            .lock()
            .expect("update queue mutex poisoned")
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("update queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check and store an equivocation proof received from the network. Returns whether the proof
    /// was new, in which case it should be gossiped onward.
    pub fn accept_equivocation_proof(
        &self,
        proof: &EquivocationProof,
    ) -> Result<bool, UpdateQueueError> {
        validate_name(&proof.name)?;
        let info = self
            .kv
            .name_info(&proof.name)?
            .ok_or(UpdateQueueError::NameNotFound)?;
        if !proof.is_valid(&info.public_key) {
            return Err(UpdateQueueError::InvalidSignature);
        }
        if self.kv.equivocation_proof(&proof.name)?.is_some() {
            return Ok(false);
        }
        self.store_proof(proof);
        Ok(true)
    }

    fn split_brain(&self, proof: EquivocationProof) -> UpdateQueueError {
        // Seals that differ only in signature bytes are not proof of two histories.
        if proof.a.sector_tip_hash == proof.b.sector_tip_hash {
            return UpdateQueueError::SplitBrain(None);
        }
        log::warn!(
            "split brain on {} at epoch {} sector size {}",
            proof.name,
            proof.a.epoch_height,
            proof.a.sector_size
        );
        self.store_proof(&proof);
        UpdateQueueError::SplitBrain(Some(Box::new(proof)))
    }

    fn store_proof(&self, proof: &EquivocationProof) {
        let mut kv = self.kv.clone();
        let _ = with_write_batch(&mut kv, |wb| {
            wb.set_equivocation_proof(proof);
            Ok::<_, ()>(())
        });
        self.events
            .emit(Event::EquivocationDetected(EquivocationDetectedEvent {
                timestamp: SystemTime::now(),
                name: proof.name.clone(),
                epoch_height: proof.a.epoch_height,
                sector_size: proof.a.sector_size,
            }));
    }
}

#[derive(Debug, Error)]
pub enum UpdateQueueError {
    #[error("the initial name import has not completed")]
    InitialImportIncomplete,
    #[error(transparent)]
    InvalidName(#[from] NameError),
    #[error("name is banned")]
    NameBanned,
    #[error("sector size {0} exceeds {SECTOR_COUNT}")]
    InvalidSectorSize(u16),
    #[error("name is not registered")]
    NameNotFound,
    #[error("signature does not match the registered key")]
    InvalidSignature,
    #[error("update is not newer than the stored header")]
    IdenticalTimestamp,
    #[error("update is older than the stored header")]
    StaleTimestamp,
    #[error("a new epoch must carry at least one sector")]
    EmptyEpoch,
    #[error("two different versions were announced at the same height")]
    SplitBrain(Option<Box<EquivocationProof>>),
    #[error("update queue is full")]
    UpdateQueueMaxLen,
    #[error(transparent)]
    KVGet(#[from] KVGetError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv::{mem_db::MemDB, pluggables::KVGet, put_header},
        types::{
            crypto_primitives::Keypair,
            header::{Header, NameInfo},
        },
    };

    struct Fixture {
        kv: MemDB,
        keypair: Keypair,
        queue: UpdateQueue<MemDB>,
    }

    fn fixture(config: UpdateQueueConfig) -> Fixture {
        let mut kv = MemDB::new();
        let keypair = Keypair::generate();
        with_write_batch(&mut kv, |wb| {
            for name in ["foo", "bar", "baz"] {
                wb.set_name_info(&NameInfo {
                    name: name.into(),
                    public_key: keypair.public_bytes(),
                    import_height: 1,
                });
            }
            wb.set_initial_import_complete();
            Ok::<_, ()>(())
        })
        .unwrap();
        let queue = UpdateQueue::new(&config, kv.clone(), Observable::new());
        Fixture { kv, keypair, queue }
    }

    fn signed(keypair: &Keypair, name: &str, epoch: u16, size: u16, tip: u8) -> Update {
        let mut update = Update {
            name: name.into(),
            epoch_height: epoch,
            sector_size: size,
            sector_tip_hash: CryptoHash::new([tip; 32]),
            reserved_root: CryptoHash::ZERO,
            signature: SignatureBytes::new([0; 65]),
        };
        update.signature = keypair.sign(&update.seal_hash());
        update
    }

    fn store_header(kv: &mut MemDB, update: &Update) {
        let header = Header {
            name: update.name.clone(),
            epoch_height: update.epoch_height,
            sector_size: update.sector_size,
            sector_tip_hash: update.sector_tip_hash,
            reserved_root: update.reserved_root,
            signature: update.signature,
            epoch_start_at: 1,
            received_at: 1,
            timebank: 0,
            banned_at: 0,
        };
        put_header(kv, &header, &[]).unwrap();
    }

    fn peer(byte: u8) -> PeerID {
        PeerID::new([byte; 32])
    }

    #[test]
    fn nothing_is_accepted_before_the_initial_import() {
        let mut kv = MemDB::new();
        let queue = UpdateQueue::new(&UpdateQueueConfig::default(), kv.clone(), Observable::new());
        let update = signed(&Keypair::generate(), "foo", 0, 1, 1);
        assert!(matches!(
            queue.enqueue(&update, peer(1)),
            Err(UpdateQueueError::InitialImportIncomplete)
        ));
        with_write_batch(&mut kv, |wb| {
            wb.set_initial_import_complete();
            Ok::<_, ()>(())
        })
        .unwrap();
        assert!(matches!(
            queue.enqueue(&update, peer(1)),
            Err(UpdateQueueError::NameNotFound)
        ));
    }

    #[test]
    fn names_are_checked_before_keys() {
        let Fixture { mut kv, keypair, .. } = fixture(UpdateQueueConfig::default());
        let queue = UpdateQueue::new(
            &UpdateQueueConfig {
                blacklist: vec!["bar".into()],
                ..UpdateQueueConfig::default()
            },
            kv.clone(),
            Observable::new(),
        );
        with_write_batch(&mut kv, |wb| {
            wb.set_name_ban("baz");
            Ok::<_, ()>(())
        })
        .unwrap();

        assert!(matches!(
            queue.enqueue(&signed(&keypair, "Foo", 0, 1, 1), peer(1)),
            Err(UpdateQueueError::InvalidName(NameError::InvalidCharacter('F')))
        ));
        assert!(matches!(
            queue.enqueue(&signed(&keypair, "bar", 0, 1, 1), peer(1)),
            Err(UpdateQueueError::InvalidName(NameError::Blacklisted))
        ));
        assert!(matches!(
            queue.enqueue(&signed(&keypair, "baz", 0, 1, 1), peer(1)),
            Err(UpdateQueueError::NameBanned)
        ));
    }

    #[test]
    fn updates_signed_by_other_keys_are_rejected() {
        let f = fixture(UpdateQueueConfig::default());
        let forged = signed(&Keypair::generate(), "foo", 0, 10, 1);
        assert!(matches!(
            f.queue.enqueue(&forged, peer(1)),
            Err(UpdateQueueError::InvalidSignature)
        ));
        assert!(f.queue.is_empty());
    }

    #[test]
    fn oversized_blobs_are_rejected_before_the_signature_is_checked() {
        let f = fixture(UpdateQueueConfig::default());
        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "foo", 0, 300, 1), peer(1)),
            Err(UpdateQueueError::InvalidSectorSize(300))
        ));
        assert!(matches!(
            f.queue.enqueue(&signed(&Keypair::generate(), "foo", 0, 257, 1), peer(1)),
            Err(UpdateQueueError::InvalidSectorSize(257))
        ));
        assert!(f.queue.is_empty());
        f.queue.enqueue(&signed(&f.keypair, "foo", 0, 256, 1), peer(1)).unwrap();
    }

    #[test]
    fn freshness_is_judged_against_the_stored_header() {
        let mut f = fixture(UpdateQueueConfig::default());
        store_header(&mut f.kv, &signed(&f.keypair, "foo", 1, 100, 1));

        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "foo", 1, 100, 2), peer(1)),
            Err(UpdateQueueError::IdenticalTimestamp)
        ));
        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "foo", 1, 99, 2), peer(1)),
            Err(UpdateQueueError::StaleTimestamp)
        ));
        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "foo", 0, 200, 2), peer(1)),
            Err(UpdateQueueError::StaleTimestamp)
        ));
        f.queue.enqueue(&signed(&f.keypair, "foo", 1, 101, 2), peer(1)).unwrap();
        assert_eq!(f.queue.peek("foo").unwrap().sector_size, 101);
    }

    #[test]
    fn a_new_epoch_may_shrink_but_not_be_empty() {
        let mut f = fixture(UpdateQueueConfig::default());
        store_header(&mut f.kv, &signed(&f.keypair, "foo", 0, 100, 1));
        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "foo", 1, 0, 0), peer(1)),
            Err(UpdateQueueError::EmptyEpoch)
        ));
        f.queue.enqueue(&signed(&f.keypair, "foo", 1, 5, 2), peer(1)).unwrap();
        assert_eq!(f.queue.peek("foo").unwrap().epoch_height, 1);
    }

    #[test]
    fn newer_announcements_replace_queued_ones() {
        let f = fixture(UpdateQueueConfig::default());
        f.queue.enqueue(&signed(&f.keypair, "foo", 0, 10, 1), peer(1)).unwrap();
        f.queue.enqueue(&signed(&f.keypair, "foo", 0, 10, 1), peer(2)).unwrap();
        assert_eq!(f.queue.peek("foo").unwrap().peer_ids.len(), 2);

        f.queue.enqueue(&signed(&f.keypair, "foo", 0, 20, 2), peer(3)).unwrap();
        let item = f.queue.peek("foo").unwrap();
        assert_eq!(item.sector_size, 20);
        assert_eq!(item.peer_ids, IndexSet::from([peer(3)]));

        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "foo", 0, 15, 3), peer(4)),
            Err(UpdateQueueError::StaleTimestamp)
        ));
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn conflicting_announcements_are_a_split_brain() {
        let f = fixture(UpdateQueueConfig::default());
        let first = signed(&f.keypair, "foo", 0, 100, 1);
        let second = signed(&f.keypair, "foo", 0, 100, 2);
        f.queue.enqueue(&first, peer(1)).unwrap();

        let Err(UpdateQueueError::SplitBrain(Some(proof))) = f.queue.enqueue(&second, peer(2)) else {
            panic!("expected a split brain with proof");
        };
        assert!(proof.is_valid(&f.keypair.public_bytes()));
        assert_eq!(f.kv.equivocation_proof("foo").unwrap().as_ref(), Some(&*proof));

        let kept = f.queue.peek("foo").unwrap();
        assert_eq!(kept.sector_tip_hash, first.sector_tip_hash);
        assert_eq!(kept.peer_ids, IndexSet::from([peer(1)]));
    }

    #[test]
    fn the_queue_is_bounded_and_fifo() {
        let f = fixture(UpdateQueueConfig {
            max_len: 2,
            ..UpdateQueueConfig::default()
        });
        f.queue.enqueue(&signed(&f.keypair, "foo", 0, 1, 1), peer(1)).unwrap();
        f.queue.enqueue(&signed(&f.keypair, "bar", 0, 1, 1), peer(1)).unwrap();
        assert!(matches!(
            f.queue.enqueue(&signed(&f.keypair, "baz", 0, 1, 1), peer(1)),
            Err(UpdateQueueError::UpdateQueueMaxLen)
        ));
        assert_eq!(f.queue.dequeue().unwrap().name, "foo");
        assert_eq!(f.queue.dequeue().unwrap().name, "bar");
        assert!(f.queue.dequeue().is_none());
    }

    #[test]
    fn equivocation_proofs_are_stored_once() {
        let f = fixture(UpdateQueueConfig::default());
        let proof = EquivocationProof {
            name: "foo".into(),
            a: signed(&f.keypair, "foo", 0, 100, 1).signed_seal(),
            b: signed(&f.keypair, "foo", 0, 100, 2).signed_seal(),
        };
        assert!(f.queue.accept_equivocation_proof(&proof).unwrap());
        assert!(!f.queue.accept_equivocation_proof(&proof).unwrap());

        let other = Keypair::generate();
        let forged = EquivocationProof {
            name: "bar".into(),
            a: signed(&other, "bar", 0, 100, 1).signed_seal(),
            b: signed(&other, "bar", 0, 100, 2).signed_seal(),
        };
        assert!(matches!(
            f.queue.accept_equivocation_proof(&forged),
            Err(UpdateQueueError::InvalidSignature)
        ));
    }
}
