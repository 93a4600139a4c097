/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for starting and stopping a daemon.
//!
//! A node is assembled from a [`NodeSpec`], built with [`NodeSpec::builder`]:
//!
//! ```ignore
//! let node = NodeSpec::builder()
//!     .config(Config::default())
//!     .signing_key(Keypair::generate())
//!     .home("/var/lib/ddrp")
//!     .kv_store(MemDB::new())
//!     .registry(Arc::new(my_registry))
//!     .on_local_commit(|event| println!("committed {}", event.name))
//!     .build()
//!     .start()?;
//! ```
//!
//! [`NodeSpec::start`] wires the subsystems together and spawns their threads:
//! 1. The connection manager's listener and outbound refill threads.
//! 2. The pinger and the peer exchanger.
//! 3. `updater.workers` updater workers draining the update queue.
//! 4. The name syncer and the name importer.
//!
//! The message handlers of the update pipeline, the sector server, the update server and the peer
//! exchanger are registered on the node's [`PeerMuxer`] and run on each peer's receive loop.
//!
//! The returned [`Node`] keeps these threads alive. When it is dropped every thread is signalled
//! to stop and joined, and every peer connection is closed.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
};

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::{
    blob_store::{BlobError, BlobStore},
    blob_sync::{
        self,
        name_syncer::NameSyncer,
        sector_server::SectorServer,
        update_server::UpdateServer,
    },
    config::Config,
    events::*,
    kv::pluggables::KVStore,
    logging::log_event,
    networking::{
        manager::{ConnectionManager, ManagerError},
        mux::PeerMuxer,
        peer_exchanger::{self, start_peer_exchanger},
        pinger::start_pinger,
    },
    registry::{
        ban_list::import_ban_lists, importer::start_name_importer, ImportError, NameRegistry,
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{unix_now, EpochHeight, PeerID, Sector},
        header::Header,
    },
    update::{
        self,
        queue::UpdateQueue,
        updater::{Updater, UpdaterError},
    },
    utils::{multi_locker::MultiLocker, observable::Observable},
};

/// A user-supplied handler for one kind of [event](crate::events).
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Stores all parameters and pluggables required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.config(...)`
    - `.signing_key(...)`
    - `.home(...)`
    - `.kv_store(...)`
    - `.registry(...)`

    Optional:
    - `.on_peer_connected(...)`
    - `.on_peer_disconnected(...)`
    - `.on_update_enqueued(...)`
    - `.on_update_processed(...)`
    - `.on_local_commit(...)`
    - `.on_equivocation_detected(...)`
    - `.on_name_synced(...)`
    - `.on_names_imported(...)`
    - `.on_ban_list_imported(...)`
"))]
pub struct NodeSpec<K: KVStore> {
    // Required parameters
    #[builder(setter(doc = "Set the daemon's [configuration](Config). Required."))]
    config: Config,
    #[builder(setter(doc = "Set the keypair the node signs envelopes with. Its public key determines the node's peer id. Required."))]
    signing_key: Keypair,
    #[builder(setter(into, doc = "Set the directory blobs are stored under. Required."))]
    home: PathBuf,
    #[builder(setter(doc = "Set the implementation of the node's Key-Value store. The argument must implement the [KVStore] trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the naming registry names and their keys are imported from. Required."))]
    registry: Arc<dyn NameRegistry>,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&PeerConnectedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<PeerConnectedEvent>),
    doc = "Register a handler closure to be invoked after a handshake completes and the peer is registered. Optional."))]
    on_peer_connected: Option<HandlerPtr<PeerConnectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PeerDisconnectedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<PeerDisconnectedEvent>),
    doc = "Register a handler closure to be invoked after a peer connection is closed. Optional."))]
    on_peer_disconnected: Option<HandlerPtr<PeerDisconnectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateEnqueuedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<UpdateEnqueuedEvent>),
    doc = "Register a handler closure to be invoked after an announced update passes validation and is queued. Optional."))]
    on_update_enqueued: Option<HandlerPtr<UpdateEnqueuedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateProcessedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<UpdateProcessedEvent>),
    doc = "Register a handler closure to be invoked after a queued update is committed or aborted. Optional."))]
    on_update_processed: Option<HandlerPtr<UpdateProcessedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&LocalCommitEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<LocalCommitEvent>),
    doc = "Register a handler closure to be invoked after the node commits sectors it was given locally. Optional."))]
    on_local_commit: Option<HandlerPtr<LocalCommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EquivocationDetectedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<EquivocationDetectedEvent>),
    doc = "Register a handler closure to be invoked after a name's owner is caught signing two conflicting versions. Optional."))]
    on_equivocation_detected: Option<HandlerPtr<EquivocationDetectedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NameSyncedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<NameSyncedEvent>),
    doc = "Register a handler closure to be invoked after the name syncer finishes with a name. Optional."))]
    on_name_synced: Option<HandlerPtr<NameSyncedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NamesImportedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<NamesImportedEvent>),
    doc = "Register a handler closure to be invoked after new names are imported from the registry. Optional."))]
    on_names_imported: Option<HandlerPtr<NamesImportedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&BanListImportedEvent) + Send + Sync + 'static| Some(Box::new(handler) as HandlerPtr<BanListImportedEvent>),
    doc = "Register a handler closure to be invoked after ban lists are imported. Optional."))]
    on_ban_list_imported: Option<HandlerPtr<BanListImportedEvent>>,
}

impl<K: KVStore> NodeSpec<K> {
    /// Starts all threads and channels associated with running a node, and returns the handles to
    /// them in a [Node] struct.
    pub fn start(self) -> Result<Node<K>, NodeError> {
        let config = self.config;
        let kv = self.kv_store;
        let keypair = self.signing_key;
        let blobs = Arc::new(BlobStore::new(&self.home)?);

        let events = Observable::new();
        if config.log_events {
            for event_name in [
                PEER_CONNECTED,
                PEER_DISCONNECTED,
                UPDATE_ENQUEUED,
                UPDATE_PROCESSED,
                LOCAL_COMMIT,
                EQUIVOCATION_DETECTED,
                NAME_SYNCED,
                NAMES_IMPORTED,
                BAN_LIST_IMPORTED,
            ] {
                events.subscribe(event_name, |event: Event| log_event(&event));
            }
        }
        subscribe_handler(&events, PEER_CONNECTED, self.on_peer_connected, |e| match e {
            Event::PeerConnected(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, PEER_DISCONNECTED, self.on_peer_disconnected, |e| match e {
            Event::PeerDisconnected(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, UPDATE_ENQUEUED, self.on_update_enqueued, |e| match e {
            Event::UpdateEnqueued(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, UPDATE_PROCESSED, self.on_update_processed, |e| match e {
            Event::UpdateProcessed(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, LOCAL_COMMIT, self.on_local_commit, |e| match e {
            Event::LocalCommit(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, EQUIVOCATION_DETECTED, self.on_equivocation_detected, |e| match e {
            Event::EquivocationDetected(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, NAME_SYNCED, self.on_name_synced, |e| match e {
            Event::NameSynced(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, NAMES_IMPORTED, self.on_names_imported, |e| match e {
            Event::NamesImported(e) => Some(e),
            _ => None,
        });
        subscribe_handler(&events, BAN_LIST_IMPORTED, self.on_ban_list_imported, |e| match e {
            Event::BanListImported(e) => Some(e),
            _ => None,
        });

        let mux = PeerMuxer::new(keypair.clone(), config.p2p.magic, events.clone());
        let locker = Arc::new(MultiLocker::new());

        let queue = Arc::new(UpdateQueue::new(&config.update_queue, kv.clone(), events.clone()));
        let updater = Arc::new(Updater::new(
            config.updater.clone(),
            config.timebank.clone(),
            kv.clone(),
            Arc::clone(&blobs),
            Arc::clone(&locker),
            mux.clone(),
            Arc::clone(&queue),
            events.clone(),
        ));
        update::register_handlers(&mux, Arc::clone(&queue));

        let sector_server = Arc::new(SectorServer::new(
            kv.clone(),
            Arc::clone(&blobs),
            Arc::clone(&locker),
            config.sector_server.cache_ttl,
        ));
        blob_sync::sector_server::register_handlers(&mux, sector_server);
        let update_server = Arc::new(UpdateServer::new(kv.clone(), Arc::clone(&locker)));
        blob_sync::update_server::register_handlers(&mux, update_server);
        peer_exchanger::register_handlers(&mux, kv.clone(), config.peer_exchanger.max_peers);

        let mut threads = Vec::new();

        let manager = Arc::new(ConnectionManager::new(
            config.p2p.clone(),
            keypair.clone(),
            mux.clone(),
            kv.clone(),
        ));
        let (listener_shutdown, listener_shutdown_receiver) = mpsc::channel();
        let (refill_shutdown, refill_shutdown_receiver) = mpsc::channel();
        let (listener, refill) =
            manager.start(listener_shutdown_receiver, refill_shutdown_receiver)?;
        threads.push(BackgroundThread::new("listener", listener_shutdown, listener));
        threads.push(BackgroundThread::new("refill", refill_shutdown, refill));

        threads.push(BackgroundThread::spawn("pinger", |shutdown| {
            start_pinger(mux.clone(), config.p2p.ping_interval, shutdown)
        }));
        threads.push(BackgroundThread::spawn("peer exchanger", |shutdown| {
            start_peer_exchanger(mux.clone(), config.peer_exchanger.interval, shutdown)
        }));
        for _ in 0..config.updater.workers {
            threads.push(BackgroundThread::spawn("updater", |shutdown| {
                updater.start_worker(shutdown)
            }));
        }

        let name_syncer = Arc::new(NameSyncer::new(
            config.name_syncer.clone(),
            kv.clone(),
            mux.clone(),
            events.clone(),
        ));
        threads.push(BackgroundThread::spawn("name syncer", |shutdown| {
            name_syncer.start(shutdown)
        }));
        threads.push(BackgroundThread::spawn("name importer", |shutdown| {
            start_name_importer(
                kv.clone(),
                self.registry,
                config.name_importer.clone(),
                events.clone(),
                shutdown,
            )
        }));

        log::info!("node {} started", mux.local_peer_id());
        Ok(Node {
            keypair,
            kv,
            blobs,
            events,
            mux,
            manager,
            updater,
            name_syncer,
            threads,
        })
    }
}

fn subscribe_handler<T: 'static>(
    events: &Observable<Event>,
    event_name: &str,
    handler: Option<HandlerPtr<T>>,
    extract: fn(Event) -> Option<T>,
) {
    if let Some(handler) = handler {
        events.subscribe(event_name, move |event| {
            if let Some(event) = extract(event) {
                handler(&event)
            }
        });
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to open the blob store: {0}")]
    Blob(#[from] BlobError),
    #[error("failed to start networking: {0}")]
    Manager(#[from] ManagerError),
}

struct BackgroundThread {
    name: &'static str,
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundThread {
    fn new(name: &'static str, shutdown: Sender<()>, handle: JoinHandle<()>) -> BackgroundThread {
        BackgroundThread {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    fn spawn(
        name: &'static str,
        start: impl FnOnce(Receiver<()>) -> JoinHandle<()>,
    ) -> BackgroundThread {
        let (shutdown, shutdown_receiver) = mpsc::channel();
        BackgroundThread::new(name, shutdown, start(shutdown_receiver))
    }
}

/// A handle to the background threads of a running node. When this value is dropped, all
/// background threads are gracefully shut down.
pub struct Node<K: KVStore> {
    keypair: Keypair,
    kv: K,
    blobs: Arc<BlobStore>,
    events: Observable<Event>,
    mux: PeerMuxer,
    manager: Arc<ConnectionManager<K>>,
    updater: Arc<Updater<K>>,
    name_syncer: Arc<NameSyncer<K>>,
    threads: Vec<BackgroundThread>,
}

impl<K: KVStore> Node<K> {
    pub fn peer_id(&self) -> PeerID {
        self.keypair.peer_id()
    }

    /// The address the node accepts connections on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.manager.local_addr()
    }

    /// Connect to the node listening at `addr` and return its peer id once the handshake completes.
    pub fn dial(&self, addr: SocketAddr) -> Result<PeerID, ManagerError> {
        self.manager.dial(addr)
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn events(&self) -> &Observable<Event> {
        &self.events
    }

    pub fn mux(&self) -> &PeerMuxer {
        &self.mux
    }

    pub fn queue(&self) -> &Arc<UpdateQueue<K>> {
        self.updater.queue()
    }

    /// Publish `sectors` under `name` as its owner `key`. See [`Updater::commit_local`].
    pub fn commit(
        &self,
        name: &str,
        epoch_height: EpochHeight,
        sectors: &[Sector],
        key: &Keypair,
    ) -> Result<Header, UpdaterError> {
        self.updater.commit_local(name, epoch_height, sectors, key)
    }

    /// Ask peers about every known name now rather than at the next sync tick. Returns how many
    /// names were attempted.
    pub fn sync_names(&self) -> usize {
        self.name_syncer.sync_all()
    }

    /// Apply the ban lists in `lists`. See [`import_ban_lists`].
    pub fn import_ban_lists(&self, lists: &[String]) -> Result<usize, ImportError> {
        let mut kv = self.kv.clone();
        import_ban_lists(&mut kv, lists, unix_now(), &self.events)
    }
}

impl<K: KVStore> Drop for Node<K> {
    fn drop(&mut self) {
        self.name_syncer.stop();
        for thread in &self.threads {
            let _ = thread.shutdown.send(());
        }
        self.mux.shutdown();
        for thread in &mut self.threads {
            if let Some(handle) = thread.handle.take() {
                if handle.join().is_err() {
                    log::error!("{} thread panicked", thread.name);
                }
            }
        }
    }
}
