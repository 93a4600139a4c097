/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A full-duplex connection to one remote peer.
//!
//! A [`Peer`] wraps a `TcpStream` and moves all socket I/O onto two background threads:
//! 1. The **reader** reads length-prefixed frames, decodes them into [`Envelope`]s, throttles
//!    them through a token bucket, and hands them to [`Peer::receive`] over a bounded channel.
//! 2. The **writer** drains a bounded channel of encoded frames filled by [`Peer::send`].
//!
//! Either thread closes the connection when it hits an error. Once closed, every operation fails
//! with the [close reason](Peer::close_reason).

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    codec::{CodecError, Decode, Encode},
    utils::rate_limiter::TokenBucket,
};

use super::{envelope::Envelope, MAX_MESSAGE_LEN};

/// Number of times [`Peer::send`] retries a full send buffer before giving up.
const SEND_RETRIES: u32 = 10;

#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Frames queued for the writer thread.
    pub send_buffer_len: usize,
    /// Envelopes queued by the reader thread.
    pub recv_buffer_len: usize,
    /// Callers allowed to wait in [`Peer::receive`] at once.
    pub max_pending_receives: usize,
    /// A connection that delivers nothing for this long is closed.
    pub idle_timeout: Duration,
    pub messages_per_second: u32,
    pub message_burst: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            send_buffer_len: 256,
            recv_buffer_len: 256,
            max_pending_receives: 8,
            idle_timeout: Duration::from_secs(60),
            messages_per_second: 64,
            message_burst: 192,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Bytes moved over one or more connections. Shared with whoever wants to observe usage.
#[derive(Debug, Default)]
pub struct BandwidthCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BandwidthUsage {
    pub sent: u64,
    pub received: u64,
}

impl BandwidthCounter {
    pub fn usage(&self) -> BandwidthUsage {
        BandwidthUsage {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

pub struct Peer {
    direction: Direction,
    remote_addr: SocketAddr,
    stream: TcpStream,
    to_writer: Mutex<Option<SyncSender<Vec<u8>>>>,
    from_reader: Mutex<Receiver<Envelope>>,
    pending_receives: AtomicUsize,
    max_pending_receives: usize,
    state: Arc<ConnectionState>,
}

impl Peer {
    /// Take ownership of `stream` and start its reader and writer threads. Traffic is counted in
    /// both this connection's own counter and `shared_bandwidth`.
    pub fn new(
        stream: TcpStream,
        direction: Direction,
        config: &PeerConfig,
        shared_bandwidth: Arc<BandwidthCounter>,
    ) -> Result<Peer, PeerError> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.idle_timeout))?;
        stream.set_write_timeout(Some(config.idle_timeout))?;

        let state = Arc::new(ConnectionState {
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            bandwidth: BandwidthCounter::default(),
            shared_bandwidth,
        });

        let (to_writer, from_main) = mpsc::sync_channel(config.send_buffer_len);
        let (to_main, from_reader) = mpsc::sync_channel(config.recv_buffer_len);

        start_writer(stream.try_clone()?, from_main, Arc::clone(&state));
        start_reader(
            stream.try_clone()?,
            to_main,
            TokenBucket::new(config.messages_per_second, config.message_burst),
            Arc::clone(&state),
        );

        Ok(Peer {
            direction,
            remote_addr,
            stream,
            to_writer: Mutex::new(Some(to_writer)),
            from_reader: Mutex::new(from_reader),
            pending_receives: AtomicUsize::new(0),
            max_pending_receives: config.max_pending_receives,
            state,
        })
    }

    /// Queue `envelope` for the writer thread. A full send buffer is retried with exponential
    /// backoff starting at 1 ms, at most [`SEND_RETRIES`] times and never past `deadline`.
    pub fn send(&self, envelope: &Envelope, deadline: Instant) -> Result<(), PeerError> {
        if let Some(reason) = self.close_reason() {
            return Err(reason);
        }

        let body = envelope.to_bytes();
        if body.len() > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let Some(to_writer) = self
            .to_writer
            .lock()
            .expect("peer writer mutex poisoned")
            .clone()
        else {
            return Err(self.close_reason().unwrap_or(PeerError::PeerClosed));
        };

        let mut backoff = Duration::from_millis(1);
        let mut retries = 0;
        loop {
            match to_writer.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => {
                    return Err(self.close_reason().unwrap_or(PeerError::PeerClosed))
                }
                Err(TrySendError::Full(returned)) => {
                    if retries == SEND_RETRIES || Instant::now() + backoff > deadline {
                        return Err(PeerError::PeerSendBufferFull);
                    }
                    frame = returned;
                    thread::sleep(backoff);
                    backoff *= 2;
                    retries += 1;
                }
            }
        }
    }

    /// Wait for the next envelope until `deadline`.
    pub fn receive(&self, deadline: Instant) -> Result<Envelope, PeerError> {
        let _slot = PendingReceive::take(&self.pending_receives, self.max_pending_receives)?;
        let from_reader = self.from_reader.lock().expect("peer reader mutex poisoned");
        let timeout = deadline.saturating_duration_since(Instant::now());
        match from_reader.recv_timeout(timeout) {
            Ok(envelope) => Ok(envelope),
            Err(RecvTimeoutError::Timeout) => Err(PeerError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.close_reason().unwrap_or(PeerError::PeerClosed))
            }
        }
    }

    /// Close the connection. Calling this more than once has no further effect.
    pub fn close(&self) {
        self.state.close(PeerError::PeerClosed);
        self.to_writer
            .lock()
            .expect("peer writer mutex poisoned")
            .take();
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Why the connection closed, or `None` while it is open.
    pub fn close_reason(&self) -> Option<PeerError> {
        if !self.is_closed() {
            return None;
        }
        self.state
            .close_reason
            .lock()
            .expect("peer close reason mutex poisoned")
            .clone()
    }

    pub fn bandwidth_usage(&self) -> BandwidthUsage {
        self.state.bandwidth.usage()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_addr.port()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close()
    }
}

struct ConnectionState {
    closed: AtomicBool,
    close_reason: Mutex<Option<PeerError>>,
    bandwidth: BandwidthCounter,
    shared_bandwidth: Arc<BandwidthCounter>,
}

impl ConnectionState {
    /// Mark the connection closed. Only the first reason is kept.
    fn close(&self, reason: PeerError) {
        let mut close_reason = self
            .close_reason
            .lock()
            .expect("peer close reason mutex poisoned");
        if close_reason.is_none() {
            *close_reason = Some(reason);
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    fn record_sent(&self, bytes: usize) {
        self.bandwidth.record_sent(bytes);
        self.shared_bandwidth.record_sent(bytes);
    }

    fn record_received(&self, bytes: usize) {
        self.bandwidth.record_received(bytes);
        self.shared_bandwidth.record_received(bytes);
    }
}

struct PendingReceive<'a>(&'a AtomicUsize);

impl<'a> PendingReceive<'a> {
    fn take(counter: &'a AtomicUsize, max: usize) -> Result<PendingReceive<'a>, PeerError> {
        if counter.fetch_add(1, Ordering::SeqCst) >= max {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(PeerError::PeerRecvBufferFull);
        }
        Ok(PendingReceive(counter))
    }
}

impl Drop for PendingReceive<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// Writes frames until the channel closes or the socket fails.
fn start_writer(mut stream: TcpStream, from_main: Receiver<Vec<u8>>, state: Arc<ConnectionState>) {
    thread::spawn(move || {
        while let Ok(frame) = from_main.recv() {
            if let Err(err) = stream.write_all(&frame) {
                state.close(PeerError::from(err));
                break;
            }
            state.record_sent(frame.len());
        }
        let _ = stream.shutdown(Shutdown::Both);
    });
}

// Reads frames until the socket fails, the peer hangs up, or nobody is listening anymore.
fn start_reader(
    mut stream: TcpStream,
    to_main: SyncSender<Envelope>,
    bucket: TokenBucket,
    state: Arc<ConnectionState>,
) {
    thread::spawn(move || {
        let reason = loop {
            let body = match read_frame(&mut stream) {
                Ok(body) => body,
                Err(err) => break err,
            };
            state.record_received(4 + body.len());

            let envelope = match Envelope::from_bytes(&body) {
                Ok(envelope) => envelope,
                Err(err) => break PeerError::Codec(err),
            };

            while !bucket.acquire(Instant::now() + Duration::from_millis(100)) {
                if state.closed.load(Ordering::SeqCst) {
                    break;
                }
            }

            if to_main.send(envelope).is_err() {
                break PeerError::PeerClosed;
            }
        };
        state.close(reason);
        let _ = stream.shutdown(Shutdown::Both);
    });
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, PeerError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(PeerError::MessageTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer closed the connection")]
    PeerHangup,
    #[error("connection closed locally")]
    PeerClosed,
    #[error("connection idle for too long")]
    PeerIdle,
    #[error("send buffer full")]
    PeerSendBufferFull,
    #[error("too many pending receives")]
    PeerRecvBufferFull,
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(usize),
    #[error("malformed envelope: {0}")]
    Codec(CodecError),
    #[error("i/o error ({kind:?}): {message}")]
    Io { kind: ErrorKind, message: String },
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                PeerError::PeerHangup
            }
            ErrorKind::WouldBlock | ErrorKind::TimedOut => PeerError::PeerIdle,
            kind => PeerError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::{
        networking::{messages::Message, NETWORK_MAGIC},
        types::{crypto_primitives::Keypair, data_types::unix_now},
    };

    fn connected_pair(config: &PeerConfig) -> (Peer, Peer) {
        connected_pair_with(config, config)
    }

    fn connected_pair_with(dialer: &PeerConfig, acceptor: &PeerConfig) -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let counter = Arc::new(BandwidthCounter::default());
        (
            Peer::new(dialed, Direction::Outbound, dialer, counter.clone()).unwrap(),
            Peer::new(accepted, Direction::Inbound, acceptor, counter).unwrap(),
        )
    }

    fn ping(keypair: &Keypair) -> Envelope {
        Envelope::seal(NETWORK_MAGIC, &Message::Ping, keypair, unix_now())
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn envelopes_flow_both_ways() {
        let (a, b) = connected_pair(&PeerConfig::default());
        let keypair = Keypair::generate();

        let envelope = ping(&keypair);
        a.send(&envelope, soon()).unwrap();
        assert_eq!(b.receive(soon()).unwrap(), envelope);
        b.send(&envelope, soon()).unwrap();
        assert_eq!(a.receive(soon()).unwrap().message().unwrap(), Message::Ping);

        assert!(a.bandwidth_usage().sent > 0);
        assert_eq!(a.bandwidth_usage().sent, b.bandwidth_usage().received);
        assert_eq!(a.direction(), Direction::Outbound);
        assert_eq!(b.direction(), Direction::Inbound);
    }

    #[test]
    fn local_close_is_idempotent_and_remote_sees_a_hangup() {
        let (a, b) = connected_pair(&PeerConfig::default());
        a.close();
        a.close();
        assert_eq!(a.close_reason(), Some(PeerError::PeerClosed));
        assert_eq!(
            a.send(&ping(&Keypair::generate()), soon()),
            Err(PeerError::PeerClosed)
        );
        assert_eq!(b.receive(soon()), Err(PeerError::PeerHangup));
        assert_eq!(b.close_reason(), Some(PeerError::PeerHangup));
    }

    #[test]
    fn idle_connections_are_closed() {
        let config = PeerConfig {
            idle_timeout: Duration::from_millis(100),
            ..PeerConfig::default()
        };
        // Only b idles out, so a cannot hang up first.
        let (_a, b) = connected_pair_with(&PeerConfig::default(), &config);
        assert_eq!(b.receive(soon()), Err(PeerError::PeerIdle));
        assert_eq!(b.close_reason(), Some(PeerError::PeerIdle));
    }

    #[test]
    fn receive_times_out_without_closing() {
        let (_a, b) = connected_pair(&PeerConfig::default());
        assert_eq!(
            b.receive(Instant::now() + Duration::from_millis(20)),
            Err(PeerError::Timeout)
        );
        assert!(!b.is_closed());
    }

    #[test]
    fn excess_waiters_are_turned_away() {
        let config = PeerConfig {
            max_pending_receives: 1,
            ..PeerConfig::default()
        };
        let (_a, b) = connected_pair(&config);
        let b = Arc::new(b);
        let waiter = {
            let b = Arc::clone(&b);
            thread::spawn(move || b.receive(Instant::now() + Duration::from_millis(500)))
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            b.receive(Instant::now() + Duration::from_millis(10)),
            Err(PeerError::PeerRecvBufferFull)
        );
        assert_eq!(waiter.join().unwrap(), Err(PeerError::Timeout));
    }
}
