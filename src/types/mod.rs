/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple subsystems of the daemon.
//!
//! Types specific to one subsystem, e.g., wire messages, live in that subsystem's own modules.

pub mod crypto_primitives;

pub mod data_types;

pub mod header;

pub mod names;

pub(crate) mod hex_serde;
