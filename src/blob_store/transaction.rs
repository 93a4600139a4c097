/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Copy-on-write transactions over a single blob.
//!
//! ## Lifecycle
//!
//! A transaction starts `Open`. The first read or write clones the blob file into a temporary
//! file; every subsequent operation works on that clone, so readers of the [`Blob`] keep seeing
//! pre-transaction data until [`commit`](Transaction::commit) copies the clone over the original.
//!
//! ```text
//! Open --commit/rollback--> Closed
//! Open --remove--> Removed --commit--> Closed (blob file unlinked)
//!                  Removed --rollback--> Closed
//! ```
//!
//! Once closed every operation fails with [`BlobError::TransactionClosed`]; while removed, reads
//! and writes fail with [`BlobError::TransactionRemoved`].

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use tempfile::NamedTempFile;

use crate::types::data_types::{Sector, SectorSize, BLOB_LEN, SECTOR_COUNT, SECTOR_LEN};

use super::{Blob, BlobError, ReadAt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransactionState {
    Open,
    Removed,
    Closed,
}

pub struct Transaction {
    blob: Arc<Blob>,
    clone: Option<NamedTempFile>,
    cursor: SectorSize,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(blob: Arc<Blob>, sector_size: SectorSize) -> Transaction {
        Transaction {
            blob,
            clone: None,
            cursor: sector_size,
            state: TransactionState::Open,
        }
    }

    pub fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }

    /// Index of the sector the next [`write_sector`](Self::write_sector) writes.
    pub fn cursor(&self) -> SectorSize {
        self.cursor
    }

    pub fn read_sector(&mut self, id: u16) -> Result<Sector, BlobError> {
        self.check_open()?;
        if id >= SECTOR_COUNT {
            return Err(BlobError::SectorOutOfRange(id as u32));
        }
        let mut sector = Sector::zeroed();
        let file = self.clone_file()?;
        file.seek(SeekFrom::Start(id as u64 * SECTOR_LEN as u64))
            .and_then(|_| file.read_exact(sector.bytes_mut()))
            .map_err(BlobError::io("reading sector from transaction clone"))?;
        Ok(sector)
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<ReadAt, BlobError> {
        self.check_open()?;
        if offset > BLOB_LEN {
            return Err(BlobError::OffsetOutOfRange(offset));
        }
        let available = (BLOB_LEN - offset) as usize;
        let mut bytes = vec![0u8; len.min(available)];
        let file = self.clone_file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut bytes))
            .map_err(BlobError::io("reading from transaction clone"))?;
        Ok(ReadAt {
            bytes,
            end_of_data: len > available,
        })
    }

    /// Write `sector` at the cursor and advance the cursor by one.
    pub fn write_sector(&mut self, sector: &Sector) -> Result<(), BlobError> {
        self.check_open()?;
        if self.cursor >= SECTOR_COUNT {
            return Err(BlobError::SectorOutOfRange(self.cursor as u32));
        }
        let offset = self.cursor as u64 * SECTOR_LEN as u64;
        let file = self.clone_file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(sector.bytes()))
            .map_err(BlobError::io("writing sector to transaction clone"))?;
        self.cursor += 1;
        Ok(())
    }

    /// Move the cursor to the sector starting at `offset`. The offset must be sector-aligned and may
    /// not lie before the cursor.
    pub fn seek(&mut self, offset: u64) -> Result<(), BlobError> {
        self.check_open()?;
        if offset % SECTOR_LEN as u64 != 0 {
            return Err(BlobError::UnalignedSeek(offset));
        }
        if offset > BLOB_LEN {
            return Err(BlobError::OffsetOutOfRange(offset));
        }
        let sector = (offset / SECTOR_LEN as u64) as SectorSize;
        if sector < self.cursor {
            return Err(BlobError::BackwardsSeek {
                offset,
                cursor: self.cursor,
            });
        }
        self.cursor = sector;
        Ok(())
    }

    /// Discard everything written so far and continue from an all-zero blob with the cursor at 0.
    pub fn truncate(&mut self) -> Result<(), BlobError> {
        self.check_open()?;
        self.clone = Some(empty_clone(&self.blob)?);
        self.cursor = 0;
        Ok(())
    }

    /// Mark the blob for deletion. The file is unlinked when the transaction commits.
    pub fn remove(&mut self) -> Result<(), BlobError> {
        self.check_open()?;
        self.clone = None;
        self.state = TransactionState::Removed;
        Ok(())
    }

    /// Make the transaction's changes visible to readers of the blob.
    ///
    /// # Panics
    ///
    /// If copying the clone over the original fails midway. The blob file would otherwise be left
    /// half-written with no way to restore it.
    pub fn commit(&mut self) -> Result<(), BlobError> {
        match self.state {
            TransactionState::Closed => return Err(BlobError::TransactionClosed),
            TransactionState::Removed => {
                self.state = TransactionState::Closed;
                return self.blob.unlink();
            }
            TransactionState::Open => {}
        }
        self.state = TransactionState::Closed;
        let Some(mut clone) = self.clone.take() else {
            return Ok(());
        };
        clone
            .as_file_mut()
            .seek(SeekFrom::Start(0))
            .map_err(BlobError::io("rewinding transaction clone"))?;
        let name = self.blob.name().to_string();
        self.blob
            .with_file("committing transaction", |file| {
                file.seek(SeekFrom::Start(0))?;
                let copied = io::copy(&mut clone.as_file_mut().take(BLOB_LEN), file)?;
                file.set_len(BLOB_LEN)?;
                file.sync_data()?;
                Ok(copied)
            })
            .map(|_| ())
            .unwrap_or_else(|err| panic!("failed to commit blob {name}: {err}"));
        Ok(())
    }

    /// Throw away the transaction's changes.
    pub fn rollback(&mut self) -> Result<(), BlobError> {
        if self.state == TransactionState::Closed {
            return Err(BlobError::TransactionClosed);
        }
        self.clone = None;
        self.state = TransactionState::Closed;
        Ok(())
    }

    fn check_open(&self) -> Result<(), BlobError> {
        match self.state {
            TransactionState::Open => Ok(()),
            TransactionState::Removed => Err(BlobError::TransactionRemoved),
            TransactionState::Closed => Err(BlobError::TransactionClosed),
        }
    }

    fn clone_file(&mut self) -> Result<&mut File, BlobError> {
        let clone = match &mut self.clone {
            Some(clone) => clone,
            slot @ None => slot.insert(clone_blob(&self.blob)?),
        };
        Ok(clone.as_file_mut())
    }
}

fn empty_clone(blob: &Blob) -> Result<NamedTempFile, BlobError> {
    let clone =
        NamedTempFile::new_in(blob.tmp_dir()).map_err(BlobError::io("creating transaction clone"))?;
    clone
        .as_file()
        .set_len(BLOB_LEN)
        .map_err(BlobError::io("sizing transaction clone"))?;
    Ok(clone)
}

fn clone_blob(blob: &Blob) -> Result<NamedTempFile, BlobError> {
    let mut clone = empty_clone(blob)?;
    blob.with_file("cloning blob", |file| {
        file.seek(SeekFrom::Start(0))?;
        io::copy(&mut Read::by_ref(file).take(BLOB_LEN), clone.as_file_mut())
    })?;
    Ok(clone)
}
