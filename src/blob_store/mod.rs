/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! On-disk storage of blobs.
//!
//! Every blob is a file of exactly [`BLOB_LEN`](crate::types::data_types::BLOB_LEN) bytes: a grid
//! of 256 sectors of 64 KiB each, where sector `i` occupies `[i·SECTOR_LEN, (i+1)·SECTOR_LEN)`.
//! Sectors past a blob's `sector_size` are zero.
//!
//! Blobs are opened through a reference-counted [`BlobStore`] pool and read through [`Blob`].
//! Writes only ever happen inside a [`Transaction`], which works on a temporary clone of the blob
//! file and overwrites the original on [`commit`](Transaction::commit).
//!
//! This module does not coordinate concurrent writers; callers serialize them per name with
//! [`MultiLocker`](crate::utils::multi_locker::MultiLocker).

use std::io;

use thiserror::Error;

pub mod blob;

pub mod paths;

pub mod pool;

pub mod serial_hash;

pub mod transaction;

pub use blob::{Blob, ReadAt};
pub use pool::BlobStore;
pub use transaction::Transaction;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("sector {0} is out of range")]
    SectorOutOfRange(u32),
    #[error("offset {0} is out of range")]
    OffsetOutOfRange(u64),
    #[error("seek to offset {0} is not sector-aligned")]
    UnalignedSeek(u64),
    #[error("seek to offset {offset} would move the cursor backwards from sector {cursor}")]
    BackwardsSeek { offset: u64, cursor: u16 },
    #[error("transaction is closed")]
    TransactionClosed,
    #[error("transaction has removed the blob")]
    TransactionRemoved,
    #[error("blob is closed")]
    BlobClosed,
}

impl BlobError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> BlobError {
        move |source| BlobError::Io { context, source }
    }
}
