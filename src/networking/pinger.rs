//! Keeps quiet connections from hitting the idle timeout.

use std::{
    sync::mpsc::Receiver,
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::utils::shutdown::sleep_or_shutdown;

use super::{messages::Message, mux::PeerMuxer};

pub(crate) fn start_pinger(
    mux: PeerMuxer,
    interval: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if sleep_or_shutdown(&shutdown_signal, interval) {
            return;
        }
        ping_all(&mux);
    })
}

/// Send a `Ping` to every connected peer. Returns how many pings were sent.
pub(crate) fn ping_all(mux: &PeerMuxer) -> usize {
    let mut sent = 0;
    for peer_id in mux.peer_ids() {
        match mux.send(&peer_id, &Message::Ping) {
            Ok(()) => sent += 1,
            Err(err) => log::debug!("ping to {} failed: {}", peer_id, err),
        }
    }
    sent
}
