/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Admission control and connection upkeep.
//!
//! The [`ConnectionManager`] decides which connections are allowed to exist:
//! - Inbound connections are accepted by a listener thread. Each is admitted (see
//!   [`admit_inbound`](ConnectionManager::admit_inbound)), handshaken on its own thread, and
//!   registered with the [`PeerMuxer`].
//! - Outbound connections are made by [`dial`](ConnectionManager::dial), and topped up every
//!   refill interval from the seed peers and the stored peer table.
//!
//! Admission holds a [`Ticket`] for the duration of the handshake. The ticket reserves a slot in the
//! direction's semaphore and marks the remote ip as connecting, and releases both on drop.

use std::{
    collections::HashSet,
    io::ErrorKind,
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    sync::{mpsc::Receiver, Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::{
    config::P2PConfig,
    kv::{pluggables::KVStore, with_write_batch},
    types::{
        crypto_primitives::Keypair,
        data_types::{unix_now, PeerID},
        header::PeerInfo,
    },
    utils::{
        semaphore::{Permit, TrySemaphore},
        shutdown::{should_shut_down, sleep_or_shutdown},
    },
};

use super::{
    handshake::{handshake_inbound, handshake_outbound, HandshakeError, Identity},
    mux::{MuxError, PeerMuxer},
    peer::{Direction, Peer, PeerError},
    DEFAULT_PORT,
};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct ConnectionManager<K: KVStore> {
    config: P2PConfig,
    identity: Identity,
    mux: PeerMuxer,
    kv: K,
    connecting: Arc<Mutex<HashSet<IpAddr>>>,
    inbound_slots: Arc<TrySemaphore>,
    outbound_slots: Arc<TrySemaphore>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<K: KVStore> ConnectionManager<K> {
    pub fn new(config: P2PConfig, keypair: Keypair, mux: PeerMuxer, kv: K) -> ConnectionManager<K> {
        let identity = Identity {
            keypair,
            magic: config.magic,
            user_agent: config.user_agent.clone(),
        };
        ConnectionManager {
            inbound_slots: TrySemaphore::new(config.max_pending_inbound),
            outbound_slots: TrySemaphore::new(config.max_pending_outbound),
            config,
            identity,
            mux,
            kv,
            connecting: Arc::new(Mutex::new(HashSet::new())),
            local_addr: Mutex::new(None),
        }
    }

    pub fn mux(&self) -> &PeerMuxer {
        &self.mux
    }

    /// The address the listener is bound to, once [`start`](Self::start) has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr mutex poisoned")
    }

    /// Bind the listener and start the accept and refill threads.
    pub fn start(
        self: &Arc<Self>,
        listen_shutdown: Receiver<()>,
        refill_shutdown: Receiver<()>,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>), ManagerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .map_err(|err| ManagerError::Listen(err.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| ManagerError::Listen(err.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| ManagerError::Listen(err.to_string()))?;
        *self.local_addr.lock().expect("local addr mutex poisoned") = Some(local_addr);
        log::info!("listening on {}", local_addr);

        let manager = Arc::clone(self);
        let listener_thread = thread::spawn(move || manager.accept_loop(listener, listen_shutdown));
        let manager = Arc::clone(self);
        let refill_thread = thread::spawn(move || loop {
            if sleep_or_shutdown(&refill_shutdown, manager.config.refill_interval) {
                return;
            }
            manager.refill_outbound();
        });
        Ok((listener_thread, refill_thread))
    }

    /* ↓↓↓ Admission ↓↓↓ */

    /// Decide whether a connection from `ip` may start a handshake.
    pub fn admit_inbound(&self, ip: IpAddr) -> Result<Ticket, ManagerError> {
        let permit = self
            .inbound_slots
            .try_acquire()
            .ok_or(ManagerError::InboundBusy)?;
        let exempt = self.is_exempt(&ip);
        let ticket = self.reserve(ip, exempt, permit)?;
        if !exempt && self.is_self_ip(&ip) {
            return Err(ManagerError::SelfDial);
        }
        if !exempt && self.is_banned(&ip, Direction::Inbound) {
            return Err(ManagerError::PeerBanned);
        }
        if self.mux.count_by_direction(Direction::Inbound) >= self.config.max_inbound_peers {
            return Err(ManagerError::MaxInbound);
        }
        Ok(ticket)
    }

    /// Decide whether we may dial `ip`.
    pub fn admit_outbound(&self, ip: IpAddr) -> Result<Ticket, ManagerError> {
        let permit = self
            .outbound_slots
            .try_acquire()
            .ok_or(ManagerError::OutboundBusy)?;
        let exempt = self.is_exempt(&ip);
        let ticket = self.reserve(ip, exempt, permit)?;
        if !exempt && self.mux.is_ip_connected(&ip) {
            return Err(ManagerError::AlreadyConnected);
        }
        if !exempt && self.is_self_ip(&ip) {
            return Err(ManagerError::SelfDial);
        }
        if !exempt && self.is_banned(&ip, Direction::Outbound) {
            return Err(ManagerError::PeerBanned);
        }
        if self.mux.count_by_direction(Direction::Outbound) >= self.config.max_outbound_peers {
            return Err(ManagerError::MaxOutbound);
        }
        Ok(ticket)
    }

    /* ↓↓↓ Dialing ↓↓↓ */

    /// Connect to `addr`, handshake, and register the peer. Returns the remote peer id.
    pub fn dial(&self, addr: SocketAddr) -> Result<PeerID, ManagerError> {
        let _ticket = self.admit_outbound(addr.ip())?;

        let result = self.connect_and_handshake(addr);
        let (peer_id, peer) = match result {
            Ok(connected) => connected,
            Err(err) => {
                log::debug!("dial to {} failed: {}", addr, err);
                self.ban(addr.ip(), Direction::Outbound, self.config.failed_dial_ban);
                return Err(err);
            }
        };

        if peer_id == self.identity.keypair.peer_id() {
            peer.close();
            self.ban(addr.ip(), Direction::Outbound, self.config.self_dial_ban);
            return Err(ManagerError::SelfDial);
        }

        self.mux.add_peer(peer_id, peer)?;
        self.record_peer(peer_id, addr.ip(), Some(addr.port()));
        Ok(peer_id)
    }

    fn connect_and_handshake(&self, addr: SocketAddr) -> Result<(PeerID, Peer), ManagerError> {
        let stream = TcpStream::connect_timeout(&addr, self.config.dial_timeout)
            .map_err(|err| ManagerError::Dial(err.to_string()))?;
        let peer = Peer::new(
            stream,
            Direction::Outbound,
            &self.config.peer_config(),
            self.mux.bandwidth(),
        )?;
        let peer_id = handshake_outbound(
            &peer,
            &self.identity,
            Instant::now() + self.config.handshake_timeout,
        )?;
        Ok((peer_id, peer))
    }

    /// Dial candidates until every outbound slot is taken or the candidates run out.
    pub fn refill_outbound(&self) {
        let wanted = self
            .config
            .max_outbound_peers
            .saturating_sub(self.mux.count_by_direction(Direction::Outbound));
        if wanted == 0 {
            return;
        }

        let mut connected = 0;
        for addr in self.candidates() {
            if connected == wanted {
                break;
            }
            match self.dial(addr) {
                Ok(peer_id) => {
                    log::debug!("refilled outbound slot with {} at {}", peer_id, addr);
                    connected += 1;
                }
                Err(ManagerError::MaxOutbound) => break,
                Err(err) => log::debug!("skipping candidate {}: {}", addr, err),
            }
        }
    }

    // Seed peers first, then stored peers, shuffled, skipping anyone already connected.
    fn candidates(&self) -> Vec<SocketAddr> {
        let mut stored: Vec<SocketAddr> = match self.kv.peers() {
            Ok(peers) => peers
                .into_iter()
                .filter(|peer| peer.peer_id != self.identity.keypair.peer_id())
                .filter(|peer| !self.mux.is_connected(&peer.peer_id))
                .map(|peer| SocketAddr::new(peer.ip, peer.port))
                .collect(),
            Err(err) => {
                log::warn!("failed to read the peer table: {}", err);
                Vec::new()
            }
        };
        stored.shuffle(&mut rand::thread_rng());

        let mut seen = HashSet::new();
        self.config
            .seed_addrs()
            .into_iter()
            .chain(stored)
            .filter(|addr| seen.insert(*addr))
            .take(self.config.refill_candidates)
            .collect()
    }

    /* ↓↓↓ Accepting ↓↓↓ */

    fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown_signal: Receiver<()>) {
        loop {
            if should_shut_down(&shutdown_signal) {
                return;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    let ticket = match self.admit_inbound(addr.ip()) {
                        Ok(ticket) => ticket,
                        Err(err) => {
                            log::debug!("rejected inbound connection from {}: {}", addr, err);
                            continue;
                        }
                    };
                    let manager = Arc::clone(&self);
                    thread::spawn(move || {
                        if let Err(err) = manager.accept(stream, addr, ticket) {
                            log::debug!("inbound connection from {} failed: {}", addr, err);
                        }
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr, _ticket: Ticket) -> Result<PeerID, ManagerError> {
        stream
            .set_nonblocking(false)
            .map_err(|err| ManagerError::Dial(err.to_string()))?;
        let peer = Peer::new(
            stream,
            Direction::Inbound,
            &self.config.peer_config(),
            self.mux.bandwidth(),
        )?;
        let peer_id = handshake_inbound(
            &peer,
            &self.identity,
            Instant::now() + self.config.handshake_timeout,
        )?;
        if peer_id == self.identity.keypair.peer_id() {
            peer.close();
            return Err(ManagerError::SelfDial);
        }
        self.mux.add_peer(peer_id, peer)?;
        self.record_peer(peer_id, addr.ip(), None);
        Ok(peer_id)
    }

    /* ↓↓↓ Bookkeeping ↓↓↓ */

    // Upsert the peer record. Inbound connections come from ephemeral ports, so they keep the
    // stored port or fall back to the default one.
    fn record_peer(&self, peer_id: PeerID, ip: IpAddr, port: Option<u16>) {
        let existing = self.kv.peer(&peer_id).ok().flatten();
        let record = PeerInfo {
            peer_id,
            ip,
            port: port
                .or(existing.as_ref().map(|peer| peer.port))
                .unwrap_or(DEFAULT_PORT),
            last_seen: unix_now(),
            verify: true,
            inbound_banned_until: existing.as_ref().map_or(0, |peer| peer.inbound_banned_until),
            outbound_banned_until: existing.as_ref().map_or(0, |peer| peer.outbound_banned_until),
        };
        let mut kv = self.kv.clone();
        let _ = with_write_batch(&mut kv, |wb| {
            wb.set_peer(&record);
            Ok::<_, ()>(())
        });
    }

    fn ban(&self, ip: IpAddr, direction: Direction, duration: Duration) {
        let until = unix_now() + duration.as_secs();
        let mut kv = self.kv.clone();
        let _ = with_write_batch(&mut kv, |wb| {
            match direction {
                Direction::Inbound => wb.set_inbound_ban(&ip, until),
                Direction::Outbound => wb.set_outbound_ban(&ip, until),
            }
            Ok::<_, ()>(())
        });
    }

    fn is_banned(&self, ip: &IpAddr, direction: Direction) -> bool {
        let until = match direction {
            Direction::Inbound => self.kv.inbound_ban_until(ip),
            Direction::Outbound => self.kv.outbound_ban_until(ip),
        };
        until.ok().flatten().is_some_and(|until| until > unix_now())
    }

    fn is_exempt(&self, ip: &IpAddr) -> bool {
        self.config.allow_local_peers && ip.is_loopback()
    }

    fn is_self_ip(&self, ip: &IpAddr) -> bool {
        ip.is_unspecified()
            || ip.is_loopback()
            || self.local_addr().is_some_and(|local| local.ip() == *ip)
    }

    /// Mark `ip` as connecting, failing if it already is. Dropping the ticket clears the mark, so
    /// a later admission check that fails releases it again.
    fn reserve(&self, ip: IpAddr, exempt: bool, permit: Permit) -> Result<Ticket, ManagerError> {
        if !exempt
            && !self
                .connecting
                .lock()
                .expect("connecting set mutex poisoned")
                .insert(ip)
        {
            return Err(ManagerError::AlreadyConnecting);
        }
        Ok(Ticket {
            ip: (!exempt).then_some(ip),
            connecting: Arc::clone(&self.connecting),
            _permit: permit,
        })
    }
}

/// Proof of admission. Holds a handshake slot and the "connecting" mark for one ip.
pub struct Ticket {
    ip: Option<IpAddr>,
    connecting: Arc<Mutex<HashSet<IpAddr>>>,
    _permit: Permit,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.connecting
                .lock()
                .expect("connecting set mutex poisoned")
                .remove(&ip);
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("too many inbound handshakes in progress")]
    InboundBusy,
    #[error("too many outbound dials in progress")]
    OutboundBusy,
    #[error("a connection with this ip is already being set up")]
    AlreadyConnecting,
    #[error("already connected to this ip")]
    AlreadyConnected,
    #[error("refusing to connect to ourselves")]
    SelfDial,
    #[error("ip is banned")]
    PeerBanned,
    #[error("inbound peer limit reached")]
    MaxInbound,
    #[error("outbound peer limit reached")]
    MaxOutbound,
    #[error("failed to listen: {0}")]
    Listen(String),
    #[error("failed to connect: {0}")]
    Dial(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Mux(#[from] MuxError),
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{
        kv::{mem_db::MemDB, pluggables::KVGet},
        utils::observable::Observable,
    };

    fn manager(config: P2PConfig) -> ConnectionManager<MemDB> {
        let keypair = Keypair::generate();
        let mux = PeerMuxer::new(keypair.clone(), config.magic, Observable::new());
        ConnectionManager::new(config, keypair, mux, MemDB::new())
    }

    fn remote() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn one_handshake_per_ip_at_a_time() {
        let manager = manager(P2PConfig::default());
        let ticket = manager.admit_inbound(remote()).unwrap();
        assert_eq!(
            manager.admit_inbound(remote()).err(),
            Some(ManagerError::AlreadyConnecting)
        );
        assert_eq!(
            manager.admit_outbound(remote()).err(),
            Some(ManagerError::AlreadyConnecting)
        );
        drop(ticket);
        assert!(manager.admit_inbound(remote()).is_ok());
    }

    #[test]
    fn racing_admissions_for_one_ip_admit_one() {
        let manager = manager(P2PConfig::default());
        let barrier = std::sync::Barrier::new(8);
        let admitted = std::thread::scope(|s| {
            let racers: Vec<_> = (0..8)
                .map(|i| {
                    let (manager, barrier) = (&manager, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        match i % 2 {
                            0 => manager.admit_inbound(remote()),
                            _ => manager.admit_outbound(remote()),
                        }
                    })
                })
                .collect();
            let results: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();
            results.iter().filter(|r| r.is_ok()).count()
        });
        assert_eq!(admitted, 1);
        assert!(manager.admit_inbound(remote()).is_ok());
    }

    #[test]
    fn handshake_slots_are_bounded() {
        let manager = manager(P2PConfig {
            max_pending_inbound: 1,
            max_pending_outbound: 1,
            ..P2PConfig::default()
        });
        let _inbound = manager.admit_inbound(remote()).unwrap();
        assert_eq!(
            manager.admit_inbound(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))).err(),
            Some(ManagerError::InboundBusy)
        );
        let _outbound = manager.admit_outbound(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))).unwrap();
        assert_eq!(
            manager.admit_outbound(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4))).err(),
            Some(ManagerError::OutboundBusy)
        );
    }

    #[test]
    fn loopback_is_self_unless_local_peers_are_allowed() {
        let strict = manager(P2PConfig::default());
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(strict.admit_inbound(loopback).err(), Some(ManagerError::SelfDial));
        assert_eq!(strict.admit_outbound(loopback).err(), Some(ManagerError::SelfDial));

        let local = manager(P2PConfig {
            allow_local_peers: true,
            ..P2PConfig::default()
        });
        let _a = local.admit_outbound(loopback).unwrap();
        let _b = local.admit_outbound(loopback).unwrap();
    }

    #[test]
    fn banned_ips_are_refused() {
        let manager = manager(P2PConfig::default());
        manager.ban(remote(), Direction::Inbound, Duration::from_secs(60));
        assert_eq!(
            manager.admit_inbound(remote()).err(),
            Some(ManagerError::PeerBanned)
        );
        assert!(manager.admit_outbound(remote()).is_ok());
    }

    #[test]
    fn zero_caps_reject_everything() {
        let manager = manager(P2PConfig {
            max_inbound_peers: 0,
            max_outbound_peers: 0,
            ..P2PConfig::default()
        });
        assert_eq!(manager.admit_inbound(remote()).err(), Some(ManagerError::MaxInbound));
        assert_eq!(manager.admit_outbound(remote()).err(), Some(ManagerError::MaxOutbound));
    }

    #[test]
    fn failed_dials_ban_the_ip_for_an_hour() {
        let manager = manager(P2PConfig {
            allow_local_peers: true,
            dial_timeout: Duration::from_millis(200),
            ..P2PConfig::default()
        });
        // Bind and drop a listener to get a port nobody is listening on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        assert!(matches!(manager.dial(addr), Err(ManagerError::Dial(_))));

        let until = manager.kv.outbound_ban_until(&addr.ip()).unwrap().unwrap();
        assert!(until >= unix_now() + 3500);
    }
}
