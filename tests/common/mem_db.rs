//! The crate's in-memory [`KVStore`](ddrp_rs::kv::pluggables::KVStore), re-exported for the tests.

pub(crate) use ddrp_rs::kv::mem_db::MemDB;
