/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a running [`Node`](crate::node::Node) emits.
//!
//! Events are published on an [`Observable`](crate::utils::observable::Observable) under the name
//! returned by [`Named::event_name`]. An event for a given action indicates that the action has
//! been completed.

use std::{net::IpAddr, time::SystemTime};

use crate::{
    networking::peer::Direction,
    types::data_types::{CryptoHash, EpochHeight, PeerID, SectorSize},
    utils::observable::Named,
};

pub const PEER_CONNECTED: &str = "peer:connected";
pub const PEER_DISCONNECTED: &str = "peer:disconnected";
pub const UPDATE_ENQUEUED: &str = "update:enqueued";
pub const UPDATE_PROCESSED: &str = "update:processed";
pub const LOCAL_COMMIT: &str = "update:local-commit";
pub const EQUIVOCATION_DETECTED: &str = "name:equivocation";
pub const NAME_SYNCED: &str = "name:synced";
pub const NAMES_IMPORTED: &str = "names:imported";
pub const BAN_LIST_IMPORTED: &str = "bans:imported";

#[derive(Clone, Debug)]
pub enum Event {
    // Connection lifecycle.
    PeerConnected(PeerConnectedEvent),
    PeerDisconnected(PeerDisconnectedEvent),
    // Update pipeline.
    UpdateEnqueued(UpdateEnqueuedEvent),
    UpdateProcessed(UpdateProcessedEvent),
    LocalCommit(LocalCommitEvent),
    EquivocationDetected(EquivocationDetectedEvent),
    // Background tasks.
    NameSynced(NameSyncedEvent),
    NamesImported(NamesImportedEvent),
    BanListImported(BanListImportedEvent),
}

impl Named for Event {
    fn event_name(&self) -> &'static str {
        match self {
            Event::PeerConnected(_) => PEER_CONNECTED,
            Event::PeerDisconnected(_) => PEER_DISCONNECTED,
            Event::UpdateEnqueued(_) => UPDATE_ENQUEUED,
            Event::UpdateProcessed(_) => UPDATE_PROCESSED,
            Event::LocalCommit(_) => LOCAL_COMMIT,
            Event::EquivocationDetected(_) => EQUIVOCATION_DETECTED,
            Event::NameSynced(_) => NAME_SYNCED,
            Event::NamesImported(_) => NAMES_IMPORTED,
            Event::BanListImported(_) => BAN_LIST_IMPORTED,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerConnectedEvent {
    pub timestamp: SystemTime,
    pub peer_id: PeerID,
    pub ip: IpAddr,
    pub direction: Direction,
}

#[derive(Clone, Debug)]
pub struct PeerDisconnectedEvent {
    pub timestamp: SystemTime,
    pub peer_id: PeerID,
    pub ip: IpAddr,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct UpdateEnqueuedEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub announced_by: PeerID,
}

/// A queued update left the pipeline, either committed (`outcome` is `Ok`) or aborted.
#[derive(Clone, Debug)]
pub struct UpdateProcessedEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub outcome: Result<(), String>,
}

#[derive(Clone, Debug)]
pub struct LocalCommitEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
    pub sector_tip_hash: CryptoHash,
}

#[derive(Clone, Debug)]
pub struct EquivocationDetectedEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub epoch_height: EpochHeight,
    pub sector_size: SectorSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameSyncOutcome {
    /// No peer had anything newer.
    UpToDate,
    /// A newer version was fetched and committed.
    Updated,
    /// Peers announced something newer but it was not committed in time.
    Failed,
    /// No peer answered.
    NoResponse,
}

#[derive(Clone, Debug)]
pub struct NameSyncedEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub outcome: NameSyncOutcome,
}

#[derive(Clone, Debug)]
pub struct NamesImportedEvent {
    pub timestamp: SystemTime,
    pub count: usize,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct BanListImportedEvent {
    pub timestamp: SystemTime,
    pub count: usize,
}
