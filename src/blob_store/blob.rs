/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Read access to a single blob file.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::types::data_types::{Sector, SectorSize, BLOB_LEN, SECTOR_COUNT, SECTOR_LEN};

use super::{BlobError, Transaction};

/// Result of [`Blob::read_at`].
#[derive(Debug, PartialEq, Eq)]
pub struct ReadAt {
    pub bytes: Vec<u8>,
    /// `true` when the read was cut short by the end of the blob.
    pub end_of_data: bool,
}

/// An open blob. All reads go through one file handle guarded by a mutex, so concurrent reads of
/// the same blob never interleave their seeks.
pub struct Blob {
    name: String,
    path: PathBuf,
    tmp_dir: PathBuf,
    file: Mutex<Option<File>>,
}

impl Blob {
    /// Open (creating if needed) the blob file at `path`, making sure it is exactly
    /// [`BLOB_LEN`] bytes long.
    pub(crate) fn open(name: &str, path: PathBuf, tmp_dir: &Path) -> Result<Blob, BlobError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(BlobError::io("creating blob directories"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(BlobError::io("opening blob file"))?;
        let len = file
            .metadata()
            .map_err(BlobError::io("reading blob metadata"))?
            .len();
        if len != BLOB_LEN {
            file.set_len(BLOB_LEN)
                .map_err(BlobError::io("truncating blob file"))?;
        }
        Ok(Blob {
            name: name.to_string(),
            path,
            tmp_dir: tmp_dir.to_path_buf(),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn read_sector(&self, id: u16) -> Result<Sector, BlobError> {
        if id >= SECTOR_COUNT {
            return Err(BlobError::SectorOutOfRange(id as u32));
        }
        let mut sector = Sector::zeroed();
        self.with_file("reading sector", |file| {
            file.seek(SeekFrom::Start(id as u64 * SECTOR_LEN as u64))?;
            file.read_exact(sector.bytes_mut())
        })?;
        Ok(sector)
    }

    /// Read up to `len` bytes starting at `offset`. Reads that cross the end of the blob return the
    /// bytes before the end and set [`ReadAt::end_of_data`].
    pub fn read_at(&self, offset: u64, len: usize) -> Result<ReadAt, BlobError> {
        if offset > BLOB_LEN {
            return Err(BlobError::OffsetOutOfRange(offset));
        }
        let available = (BLOB_LEN - offset) as usize;
        let mut bytes = vec![0u8; len.min(available)];
        self.with_file("reading blob", |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut bytes)
        })?;
        Ok(ReadAt {
            bytes,
            end_of_data: len > available,
        })
    }

    /// Start a transaction whose sector cursor begins at `sector_size`, the number of sectors
    /// currently committed.
    pub fn begin_transaction(self: &Arc<Self>, sector_size: SectorSize) -> Transaction {
        Transaction::new(self.clone(), sector_size)
    }

    /// Release the file handle. Subsequent reads fail with [`BlobError::BlobClosed`].
    pub fn close(&self) {
        self.file.lock().expect("blob mutex poisoned").take();
    }

    pub(crate) fn with_file<T>(
        &self,
        context: &'static str,
        f: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> Result<T, BlobError> {
        let mut file = self.file.lock().expect("blob mutex poisoned");
        let file = file.as_mut().ok_or(BlobError::BlobClosed)?;
        f(file).map_err(BlobError::io(context))
    }

    /// Close the handle and delete the blob file.
    pub(crate) fn unlink(&self) -> Result<(), BlobError> {
        let mut file = self.file.lock().expect("blob mutex poisoned");
        file.take();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::io("removing blob file")(err)),
        }
    }
}
