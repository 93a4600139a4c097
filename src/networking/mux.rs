/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fan-in and fan-out over every authenticated connection.
//!
//! The [`PeerMuxer`] owns the table of live [`Peer`]s. For each registered peer it runs a receive
//! loop that:
//! 1. Checks every envelope against the network magic, the local clock and the peer's id. A
//!    violation closes the connection.
//! 2. Hands responses to whoever is waiting on a matching [`request`](PeerMuxer::request).
//! 3. Dispatches the message, in arrival order, to the handlers registered for its type.
//!
//! Outbound, [`gossip_all`](PeerMuxer::gossip_all) skips peers that already sent or received the
//! same message within [`GOSSIP_TTL`].

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, RwLock,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use thiserror::Error;

use crate::{
    events::{Event, PeerConnectedEvent, PeerDisconnectedEvent},
    types::{
        crypto_primitives::Keypair,
        data_types::{unix_now, CryptoHash, PeerID},
    },
    utils::{observable::Observable, sampler::sample, ttl_cache::TtlCache},
};

use super::{
    envelope::Envelope,
    messages::{Message, MessageType},
    peer::{BandwidthCounter, Direction, Peer, PeerError},
};

/// How long a `(peer, message)` pair is remembered for gossip de-duplication.
pub const GOSSIP_TTL: Duration = Duration::from_secs(5 * 60);

/// How long an unanswered request slot is kept.
const PENDING_TTL: Duration = Duration::from_secs(60);

/// How long the receive loop waits before re-checking for shutdown.
const RECEIVE_POLL: Duration = Duration::from_millis(500);

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub type MessageHandler = Arc<dyn Fn(PeerID, Message) + Send + Sync>;

type PendingKey = (PeerID, MessageType, String);

#[derive(Clone)]
pub struct PeerMuxer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    keypair: Keypair,
    magic: u32,
    table: RwLock<PeerTable>,
    handlers: RwLock<HashMap<MessageType, Vec<MessageHandler>>>,
    seen: TtlCache<(PeerID, CryptoHash), ()>,
    pending: TtlCache<PendingKey, SyncSender<Message>>,
    bandwidth: Arc<BandwidthCounter>,
    events: Observable<Event>,
    shut_down: AtomicBool,
}

#[derive(Default)]
struct PeerTable {
    peers: HashMap<PeerID, Arc<Peer>>,
    by_ip: HashMap<IpAddr, HashSet<PeerID>>,
}

impl PeerMuxer {
    pub fn new(keypair: Keypair, magic: u32, events: Observable<Event>) -> PeerMuxer {
        PeerMuxer {
            inner: Arc::new(MuxInner {
                keypair,
                magic,
                table: RwLock::new(PeerTable::default()),
                handlers: RwLock::new(HashMap::new()),
                seen: TtlCache::new(GOSSIP_TTL),
                pending: TtlCache::new(PENDING_TTL),
                bandwidth: Arc::new(BandwidthCounter::default()),
                events,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_peer_id(&self) -> PeerID {
        self.inner.keypair.peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn magic(&self) -> u32 {
        self.inner.magic
    }

    /// The counter every connection of this muxer reports its traffic to.
    pub fn bandwidth(&self) -> Arc<BandwidthCounter> {
        Arc::clone(&self.inner.bandwidth)
    }

    /* ↓↓↓ Handlers ↓↓↓ */

    /// Register `handler` for messages of type `message_type`. Handlers run on the peer's receive
    /// loop, so they should return quickly.
    pub fn add_handler(
        &self,
        message_type: MessageType,
        handler: impl Fn(PeerID, Message) + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .write()
            .expect("mux handlers lock poisoned")
            .entry(message_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /* ↓↓↓ Peer table ↓↓↓ */

    /// Register an authenticated connection and start its receive loop.
    pub fn add_peer(&self, peer_id: PeerID, peer: Peer) -> Result<(), MuxError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            peer.close();
            return Err(MuxError::ShutDown);
        }
        let peer = Arc::new(peer);
        {
            let mut table = self.inner.table.write().expect("mux table lock poisoned");
            if table.peers.contains_key(&peer_id) {
                peer.close();
                return Err(MuxError::AlreadyConnected(peer_id));
            }
            table.peers.insert(peer_id, Arc::clone(&peer));
            table.by_ip.entry(peer.remote_ip()).or_default().insert(peer_id);
        }

        log::debug!(
            "connected to {} at {} ({:?})",
            peer_id,
            peer.remote_addr(),
            peer.direction()
        );
        self.inner
            .events
            .emit(Event::PeerConnected(PeerConnectedEvent {
                timestamp: SystemTime::now(),
                peer_id,
                ip: peer.remote_ip(),
                direction: peer.direction(),
            }));

        let mux = self.clone();
        thread::spawn(move || mux.receive_loop(peer_id, peer));
        Ok(())
    }

    /// Close and forget the connection to `peer_id`.
    pub fn remove_peer(&self, peer_id: &PeerID) {
        if let Some(peer) = self.peer(peer_id) {
            peer.close();
            self.forget(peer_id, &peer);
        }
    }

    pub fn peer(&self, peer_id: &PeerID) -> Option<Arc<Peer>> {
        self.inner
            .table
            .read()
            .expect("mux table lock poisoned")
            .peers
            .get(peer_id)
            .cloned()
    }

    pub fn is_connected(&self, peer_id: &PeerID) -> bool {
        self.peer(peer_id).is_some()
    }

    pub fn peer_ids(&self) -> Vec<PeerID> {
        self.inner
            .table
            .read()
            .expect("mux table lock poisoned")
            .peers
            .keys()
            .copied()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner
            .table
            .read()
            .expect("mux table lock poisoned")
            .peers
            .len()
    }

    pub fn count_by_direction(&self, direction: Direction) -> usize {
        self.inner
            .table
            .read()
            .expect("mux table lock poisoned")
            .peers
            .values()
            .filter(|peer| peer.direction() == direction)
            .count()
    }

    /// Whether any live connection comes from or goes to `ip`.
    pub fn is_ip_connected(&self, ip: &IpAddr) -> bool {
        self.inner
            .table
            .read()
            .expect("mux table lock poisoned")
            .by_ip
            .get(ip)
            .is_some_and(|peers| !peers.is_empty())
    }

    /* ↓↓↓ Sending ↓↓↓ */

    /// Sign `message` and send it to `peer_id`.
    pub fn send(&self, peer_id: &PeerID, message: &Message) -> Result<(), MuxError> {
        let peer = self.peer(peer_id).ok_or(MuxError::NotConnected(*peer_id))?;
        let envelope = self.seal(message);
        peer.send(&envelope, Instant::now() + SEND_TIMEOUT)
            .map_err(|err| MuxError::Peer(*peer_id, err))
    }

    /// Send `message` to every peer that has not seen it within [`GOSSIP_TTL`]. Returns the
    /// number of peers it was sent to.
    pub fn gossip_all(&self, message: &Message) -> usize {
        let hash = message.hash();
        let envelope = self.seal(message);
        let deadline = Instant::now() + SEND_TIMEOUT;
        let mut sent = 0;
        for (peer_id, peer) in self.snapshot() {
            if !self.inner.seen.insert_if_absent((peer_id, hash), ()) {
                continue;
            }
            match peer.send(&envelope, deadline) {
                Ok(()) => sent += 1,
                Err(err) => log::debug!("gossip to {} failed: {}", peer_id, err),
            }
        }
        sent
    }

    /// Send `message` to up to `k` peers chosen at random. Returns the peers it was sent to.
    pub fn broadcast_random(&self, message: &Message, k: usize) -> Vec<PeerID> {
        let envelope = self.seal(message);
        let deadline = Instant::now() + SEND_TIMEOUT;
        let chosen = sample(&mut rand::thread_rng(), &self.snapshot(), k);
        chosen
            .into_iter()
            .filter_map(|(peer_id, peer)| match peer.send(&envelope, deadline) {
                Ok(()) => Some(peer_id),
                Err(err) => {
                    log::debug!("broadcast to {} failed: {}", peer_id, err);
                    None
                }
            })
            .collect()
    }

    /// Send a request to `peer_id` and return a handle to wait for the matching response.
    pub fn request(&self, peer_id: &PeerID, message: &Message) -> Result<PendingResponse, MuxError> {
        let (request_type, name) = message
            .request_key()
            .ok_or(MuxError::NotARequest(message.message_type()))?;
        let key = (*peer_id, request_type, name);
        let (to_waiter, from_mux) = mpsc::sync_channel(1);
        self.inner.pending.insert(key.clone(), to_waiter);
        if let Err(err) = self.send(peer_id, message) {
            self.inner.pending.remove(&key);
            return Err(err);
        }
        Ok(PendingResponse {
            peer_id: *peer_id,
            receiver: from_mux,
        })
    }

    /// Close every connection and stop dispatching.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner
            .handlers
            .write()
            .expect("mux handlers lock poisoned")
            .clear();
        for (peer_id, peer) in self.snapshot() {
            peer.close();
            self.forget(&peer_id, &peer);
        }
    }

    fn seal(&self, message: &Message) -> Envelope {
        Envelope::seal(self.inner.magic, message, &self.inner.keypair, unix_now())
    }

    fn snapshot(&self) -> Vec<(PeerID, Arc<Peer>)> {
        self.inner
            .table
            .read()
            .expect("mux table lock poisoned")
            .peers
            .iter()
            .map(|(peer_id, peer)| (*peer_id, Arc::clone(peer)))
            .collect()
    }

    // Remove `peer` from the table if it is still the connection registered for `peer_id`.
    fn forget(&self, peer_id: &PeerID, peer: &Arc<Peer>) -> bool {
        let mut table = self.inner.table.write().expect("mux table lock poisoned");
        match table.peers.get(peer_id) {
            Some(current) if Arc::ptr_eq(current, peer) => (),
            _ => return false,
        }
        table.peers.remove(peer_id);
        let ip = peer.remote_ip();
        if let Some(peers) = table.by_ip.get_mut(&ip) {
            peers.remove(peer_id);
            if peers.is_empty() {
                table.by_ip.remove(&ip);
            }
        }
        true
    }

    fn receive_loop(&self, peer_id: PeerID, peer: Arc<Peer>) {
        let reason = loop {
            if self.inner.shut_down.load(Ordering::SeqCst) {
                break PeerError::PeerClosed.to_string();
            }
            let envelope = match peer.receive(Instant::now() + RECEIVE_POLL) {
                Ok(envelope) => envelope,
                Err(PeerError::Timeout) => continue,
                Err(err) => break err.to_string(),
            };
            if let Err(reason) = self.dispatch(peer_id, &envelope) {
                log::warn!("closing {}: {}", peer_id, reason);
                peer.close();
                break reason;
            }
        };

        if self.forget(&peer_id, &peer) {
            log::debug!("disconnected from {}: {}", peer_id, reason);
            self.inner
                .events
                .emit(Event::PeerDisconnected(PeerDisconnectedEvent {
                    timestamp: SystemTime::now(),
                    peer_id,
                    ip: peer.remote_ip(),
                    reason,
                }));
        }
    }

    // Validate and route one envelope. An `Err` is a protocol violation.
    fn dispatch(&self, peer_id: PeerID, envelope: &Envelope) -> Result<(), String> {
        envelope
            .check(self.inner.magic, unix_now(), Some(&peer_id))
            .map_err(|err| err.to_string())?;
        let message = envelope.message().map_err(|err| err.to_string())?;
        if matches!(message, Message::Hello(_) | Message::HelloAck(_)) {
            return Err(format!("unexpected {:?} after handshake", message.message_type()));
        }

        self.inner.seen.insert((peer_id, message.hash()), ());

        if let Some((request_type, name)) = message.response_key() {
            if let Some(waiter) = self.inner.pending.remove(&(peer_id, request_type, name)) {
                let _ = waiter.try_send(message.clone());
            }
        }

        let handlers: Vec<MessageHandler> = self
            .inner
            .handlers
            .read()
            .expect("mux handlers lock poisoned")
            .get(&message.message_type())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(peer_id, message.clone());
        }
        Ok(())
    }
}

/// The waiting end of a [`PeerMuxer::request`].
pub struct PendingResponse {
    peer_id: PeerID,
    receiver: Receiver<Message>,
}

impl PendingResponse {
    pub fn peer_id(&self) -> PeerID {
        self.peer_id
    }

    /// Block until the response arrives or `deadline` passes.
    pub fn wait(self, deadline: Instant) -> Result<Message, MuxError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(MuxError::ResponseTimeout(self.peer_id))
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("not connected to {0}")]
    NotConnected(PeerID),
    #[error("already connected to {0}")]
    AlreadyConnected(PeerID),
    #[error("{0:?} is not a request")]
    NotARequest(MessageType),
    #[error("no response from {0} in time")]
    ResponseTimeout(PeerID),
    #[error("sending to {0} failed: {1}")]
    Peer(PeerID, PeerError),
    #[error("muxer is shut down")]
    ShutDown,
}
