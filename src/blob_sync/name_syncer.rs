/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Periodic pull-based catch-up.
//!
//! Gossip alone misses updates announced while we were offline. Every
//! [`interval`](NameSyncerConfig::interval) the syncer walks every known name and asks a random
//! sample of peers for anything newer with `UpdateReq`. Any `Update` they return flows through the
//! ordinary update handler into the queue; the syncer then waits for the
//! [`UPDATE_PROCESSED`] event for that name before moving on.
//!
//! Nothing happens while the node has no peers or the initial name import has not completed.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Instant, SystemTime},
};

use crate::{
    config::NameSyncerConfig,
    events::{Event, NameSyncOutcome, NameSyncedEvent, UPDATE_PROCESSED},
    kv::pluggables::KVStore,
    networking::{
        messages::{Message, UpdateReq},
        mux::PeerMuxer,
    },
    types::data_types::{EpochHeight, SectorSize},
    utils::{observable::Observable, sampler::sample, shutdown::sleep_or_shutdown},
};

pub struct NameSyncer<K: KVStore> {
    config: NameSyncerConfig,
    kv: K,
    mux: PeerMuxer,
    events: Observable<Event>,
    stopped: AtomicBool,
}

impl<K: KVStore> NameSyncer<K> {
    pub fn new(
        config: NameSyncerConfig,
        kv: K,
        mux: PeerMuxer,
        events: Observable<Event>,
    ) -> NameSyncer<K> {
        NameSyncer {
            config,
            kv,
            mux,
            events,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn start(self: &Arc<Self>, shutdown_signal: Receiver<()>) -> JoinHandle<()> {
        let syncer = Arc::clone(self);
        thread::spawn(move || loop {
            if sleep_or_shutdown(&shutdown_signal, syncer.config.interval) {
                return;
            }
            syncer.sync_all();
        })
    }

    /// Make an in-progress [`sync_all`](Self::sync_all) return after the names it is currently
    /// working on.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Sync every known name, `workers` names at a time. Returns how many names were attempted.
    pub fn sync_all(&self) -> usize {
        if self.mux.peer_count() == 0 {
            log::debug!("skipping name sync: no peers");
            return 0;
        }
        if !self.kv.initial_import_complete() {
            log::debug!("skipping name sync: initial name import incomplete");
            return 0;
        }
        let names = match self.kv.name_infos() {
            Ok(infos) => infos.into_iter().map(|info| info.name).collect::<Vec<_>>(),
            Err(err) => {
                log::error!("name sync could not list names: {}", err);
                return 0;
            }
        };

        let work = Mutex::new(names.into_iter());
        let attempted = Mutex::new(0usize);
        thread::scope(|scope| {
            for _ in 0..self.config.workers.max(1) {
                scope.spawn(|| loop {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let Some(name) = work.lock().expect("name sync work lock poisoned").next() else {
                        return;
                    };
                    let outcome = self.sync_name(&name);
                    *attempted.lock().expect("name sync counter lock poisoned") += 1;
                    self.events.emit(Event::NameSynced(NameSyncedEvent {
                        timestamp: SystemTime::now(),
                        name,
                        outcome,
                    }));
                });
            }
        });
        let attempted = *attempted.lock().expect("name sync counter lock poisoned");
        attempted
    }

    pub fn sync_name(&self, name: &str) -> NameSyncOutcome {
        let before = self.version(name);
        let req = Message::UpdateReq(UpdateReq {
            name: name.to_string(),
            epoch_height: before.0,
            sector_size: before.1,
        });

        // Subscribe first so a fast commit is not missed.
        let (to_syncer, processed) = mpsc::channel();
        let to_syncer = Mutex::new(to_syncer);
        let watched = name.to_string();
        let subscription = self.events.subscribe(UPDATE_PROCESSED, move |event| {
            if let Event::UpdateProcessed(event) = event {
                if event.name == watched {
                    let _ = to_syncer.lock().expect("name sync channel lock poisoned").send(());
                }
            }
        });

        let peers = sample(&mut rand::thread_rng(), &self.mux.peer_ids(), self.config.sample_size);
        let pending: Vec<_> = peers
            .iter()
            .filter_map(|peer_id| self.mux.request(peer_id, &req).ok())
            .collect();

        let deadline = Instant::now() + self.config.update_response_timeout;
        let (mut answered, mut announced) = (false, false);
        for response in pending {
            match response.wait(deadline) {
                Ok(Message::Update(update)) => {
                    answered = true;
                    announced |= (update.epoch_height, update.sector_size) > before;
                }
                Ok(_) => answered = true,
                Err(_) => (),
            }
        }

        let outcome = if !announced {
            match answered {
                true => NameSyncOutcome::UpToDate,
                false => NameSyncOutcome::NoResponse,
            }
        } else {
            self.await_commit(name, before, &processed)
        };
        self.events.unsubscribe(subscription);
        log::debug!("synced {}: {:?}", name, outcome);
        outcome
    }

    // Wait until the stored version of `name` moves past `before`, re-checking whenever an update
    // for it finishes processing.
    fn await_commit(
        &self,
        name: &str,
        before: (EpochHeight, SectorSize),
        processed: &Receiver<()>,
    ) -> NameSyncOutcome {
        let deadline = Instant::now() + self.config.sync_response_timeout;
        loop {
            if self.version(name) > before {
                return NameSyncOutcome::Updated;
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            match processed.recv_timeout(timeout) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return match self.version(name) > before {
                        true => NameSyncOutcome::Updated,
                        false => NameSyncOutcome::Failed,
                    };
                }
            }
        }
    }

    fn version(&self, name: &str) -> (EpochHeight, SectorSize) {
        match self.kv.header(name) {
            Ok(Some(header)) => (header.epoch_height, header.sector_size),
            _ => (0, 0),
        }
    }
}
