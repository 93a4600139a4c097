/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Serving blob data to peers, and pulling updates we missed.
//!
//! - [`sector_server`] answers requests for sectors and sector base rows.
//! - [`update_server`] tells peers about our newer versions of a name.
//! - [`name_syncer`] periodically asks peers about theirs.

pub mod name_syncer;

pub mod sector_server;

pub mod update_server;
