/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Where names and their keys come from, and which names are banned.
//!
//! The daemon does not run a blockchain client itself. Instead, the user supplies a
//! [`NameRegistry`], a read-only view of a chain on which names are registered against public
//! keys. The [`importer`] copies confirmed registrations into the KV store, and [`ban_list`]
//! applies operator-published lists of banned names.

pub mod ban_list;

pub mod importer;

use thiserror::Error;

use crate::{kv::pluggables::KVGetError, types::data_types::PublicKeyBytes};

/// A name registered on the naming chain at a given block height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredName {
    pub name: String,
    pub public_key: PublicKeyBytes,
    pub height: u32,
}

/// A read-only view of the chain names are registered on.
///
/// Implementations are called from the importer thread only, and may block.
pub trait NameRegistry: Send + Sync + 'static {
    /// The height of the registry's best block.
    fn height(&self) -> Result<u32, RegistryError>;

    /// Every registration in blocks `from..=to`, in ascending height order.
    fn names_in(&self, from: u32, to: u32) -> Result<Vec<RegisteredName>, RegistryError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("naming registry unavailable: {0}")]
pub struct RegistryError(pub String);

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    KVGet(#[from] KVGetError),
    #[error("unsupported ban list version {0:?}")]
    BanListVersion(String),
}
