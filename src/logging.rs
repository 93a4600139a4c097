/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them with
//! [`Config::log_events`](crate::config::Config::log_events).
//!
//! ddrp_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal, either call [`setup_logger`] or set up another
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [LocalCommit](crate::events::LocalCommitEvent) is printed:
//!
//! ```text
//! LocalCommit, 1701329264, foo, 3, 12, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the name that was committed.
//! - The fourth and fifth values are its new epoch height and sector size.
//! - The sixth value is the first seven characters of the Base64 encoding of the new sector tip hash.

use std::{io, thread, time::SystemTime};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log::{LevelFilter, SetLoggerError};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const PEER_CONNECTED_LOG: &str = "PeerConnected";
pub const PEER_DISCONNECTED_LOG: &str = "PeerDisconnected";

pub const UPDATE_ENQUEUED_LOG: &str = "UpdateEnqueued";
pub const UPDATE_PROCESSED_LOG: &str = "UpdateProcessed";
pub const LOCAL_COMMIT_LOG: &str = "LocalCommit";
pub const EQUIVOCATION_DETECTED_LOG: &str = "EquivocationDetected";

pub const NAME_SYNCED_LOG: &str = "NameSynced";
pub const NAMES_IMPORTED_LOG: &str = "NamesImported";
pub const BAN_LIST_IMPORTED_LOG: &str = "BanListImported";

/// Install a `fern` logger that prints every record at `level` or above to stdout, prefixed with the
/// emitting thread and the record's level.
pub fn setup_logger(level: LevelFilter) -> Result<(), SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{:?}][{}] {}",
                thread::current().id(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(io::stdout())
        .apply()
}

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync>;
}

/// Log `event` with the default logger for its type.
pub(crate) fn log_event(event: &Event) {
    match event {
        Event::PeerConnected(e) => PeerConnectedEvent::get_logger()(e),
        Event::PeerDisconnected(e) => PeerDisconnectedEvent::get_logger()(e),
        Event::UpdateEnqueued(e) => UpdateEnqueuedEvent::get_logger()(e),
        Event::UpdateProcessed(e) => UpdateProcessedEvent::get_logger()(e),
        Event::LocalCommit(e) => LocalCommitEvent::get_logger()(e),
        Event::EquivocationDetected(e) => EquivocationDetectedEvent::get_logger()(e),
        Event::NameSynced(e) => NameSyncedEvent::get_logger()(e),
        Event::NamesImported(e) => NamesImportedEvent::get_logger()(e),
        Event::BanListImported(e) => BanListImportedEvent::get_logger()(e),
    }
}

impl Logger for PeerConnectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |peer_connected_event: &PeerConnectedEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                PEER_CONNECTED_LOG,
                secs_since_unix_epoch(peer_connected_event.timestamp),
                first_seven_base64_chars(&peer_connected_event.peer_id.bytes()),
                peer_connected_event.ip,
                peer_connected_event.direction
            )
        };
        Box::new(logger)
    }
}

impl Logger for PeerDisconnectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |peer_disconnected_event: &PeerDisconnectedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PEER_DISCONNECTED_LOG,
                secs_since_unix_epoch(peer_disconnected_event.timestamp),
                first_seven_base64_chars(&peer_disconnected_event.peer_id.bytes()),
                peer_disconnected_event.ip,
                peer_disconnected_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateEnqueuedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |update_enqueued_event: &UpdateEnqueuedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                UPDATE_ENQUEUED_LOG,
                secs_since_unix_epoch(update_enqueued_event.timestamp),
                update_enqueued_event.name,
                update_enqueued_event.epoch_height,
                update_enqueued_event.sector_size,
                first_seven_base64_chars(&update_enqueued_event.announced_by.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateProcessedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |update_processed_event: &UpdateProcessedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                UPDATE_PROCESSED_LOG,
                secs_since_unix_epoch(update_processed_event.timestamp),
                update_processed_event.name,
                update_processed_event.epoch_height,
                update_processed_event.sector_size,
                match &update_processed_event.outcome {
                    Ok(()) => "committed",
                    Err(reason) => reason.as_str(),
                }
            )
        };
        Box::new(logger)
    }
}

impl Logger for LocalCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |local_commit_event: &LocalCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                LOCAL_COMMIT_LOG,
                secs_since_unix_epoch(local_commit_event.timestamp),
                local_commit_event.name,
                local_commit_event.epoch_height,
                local_commit_event.sector_size,
                first_seven_base64_chars(&local_commit_event.sector_tip_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for EquivocationDetectedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |equivocation_detected_event: &EquivocationDetectedEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EQUIVOCATION_DETECTED_LOG,
                secs_since_unix_epoch(equivocation_detected_event.timestamp),
                equivocation_detected_event.name,
                equivocation_detected_event.epoch_height,
                equivocation_detected_event.sector_size
            )
        };
        Box::new(logger)
    }
}

impl Logger for NameSyncedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |name_synced_event: &NameSyncedEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                NAME_SYNCED_LOG,
                secs_since_unix_epoch(name_synced_event.timestamp),
                name_synced_event.name,
                name_synced_event.outcome
            )
        };
        Box::new(logger)
    }
}

impl Logger for NamesImportedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |names_imported_event: &NamesImportedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                NAMES_IMPORTED_LOG,
                secs_since_unix_epoch(names_imported_event.timestamp),
                names_imported_event.count,
                names_imported_event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for BanListImportedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send + Sync> {
        let logger = |ban_list_imported_event: &BanListImportedEvent| {
            log::info!(
                "{}, {}, {}",
                BAN_LIST_IMPORTED_LOG,
                secs_since_unix_epoch(ban_list_imported_event.timestamp),
                ban_list_imported_event.count
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
