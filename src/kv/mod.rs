/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable persistence of headers, name infos, peers and bans.
//!
//! Reads go through the typed getters on [`KVGet`](pluggables::KVGet). Writes are grouped into a
//! [`StoreWriteBatch`](write_batch::StoreWriteBatch) and applied atomically with
//! [`with_write_batch`].

pub mod mem_db;

pub mod pluggables;

pub mod variables;

pub mod write_batch;

use std::sync::Mutex;

use crate::types::{data_types::CryptoHash, header::Header};

use self::{
    pluggables::{KVGetError, KVStore},
    write_batch::StoreWriteBatch,
};

static HEADER_COUNT_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` against a fresh write batch and apply the batch if `f` returns `Ok`. On `Err` the batch is
/// discarded and nothing is written.
pub fn with_write_batch<K: KVStore, T, E>(
    kv: &mut K,
    f: impl FnOnce(&mut StoreWriteBatch<K::WriteBatch>) -> Result<T, E>,
) -> Result<T, E> {
    let mut wb = StoreWriteBatch::new();
    let value = f(&mut wb)?;
    kv.write(wb.0);
    Ok(value)
}

/// Atomically store `header` together with its sector base row, bumping the header count when the
/// name had no header before.
///
/// Calls are serialized process-wide so that concurrent writers never read the same count.
pub fn put_header<K: KVStore>(
    kv: &mut K,
    header: &Header,
    sector_base: &[CryptoHash],
) -> Result<(), KVGetError> {
    let _count_guard = HEADER_COUNT_LOCK.lock().expect("header count lock poisoned");
    let is_new = kv.header(&header.name)?.is_none();
    let count = kv.header_count()?;
    with_write_batch(kv, |wb| {
        wb.set_header(header);
        wb.set_sector_base(&header.name, sector_base);
        if is_new {
            wb.set_header_count(count + 1);
        }
        Ok(())
    })
}
