/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Copies confirmed name registrations from the [`NameRegistry`] into the KV store.
//!
//! Registrations are only imported once they are buried `confirmation_depth` blocks deep, and an
//! imported [`NameInfo`] is never overwritten: the first key registered for a name owns it. The
//! first successful import marks the node's initial import as complete, which unblocks the update
//! queue and the name syncer.

use std::{
    sync::{mpsc::Receiver, Arc},
    thread::{self, JoinHandle},
    time::SystemTime,
};

use crate::{
    config::NameImporterConfig,
    events::{Event, NamesImportedEvent},
    kv::{pluggables::KVStore, with_write_batch},
    types::{header::NameInfo, names::validate_name},
    utils::{observable::Observable, shutdown::sleep_or_shutdown},
};

use super::{ImportError, NameRegistry};

pub(crate) fn start_name_importer<K: KVStore>(
    mut kv: K,
    registry: Arc<dyn NameRegistry>,
    config: NameImporterConfig,
    events: Observable<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match import_names(&mut kv, registry.as_ref(), config.confirmation_depth) {
            Ok((count, height)) if count > 0 => {
                events.emit(Event::NamesImported(NamesImportedEvent {
                    timestamp: SystemTime::now(),
                    count,
                    height,
                }))
            }
            Ok(_) => (),
            Err(err) => log::warn!("name import failed: {}", err),
        }
        if sleep_or_shutdown(&shutdown_signal, config.interval) {
            return;
        }
    })
}

/// Import every registration confirmed since the last import. Returns how many names were added
/// and the height imported up to.
pub fn import_names<K: KVStore>(
    kv: &mut K,
    registry: &dyn NameRegistry,
    confirmation_depth: u32,
) -> Result<(usize, u32), ImportError> {
    let last = kv.last_name_import_height()?;
    let complete = kv.initial_import_complete();
    let target = registry.height()?.saturating_sub(confirmation_depth);
    let from = match complete {
        true => last + 1,
        false => 0,
    };
    if complete && from > target {
        return Ok((0, last));
    }

    let mut infos = Vec::new();
    if from <= target {
        for registered in registry.names_in(from, target)? {
            if let Err(err) = validate_name(&registered.name) {
                log::debug!("skipping registered name {:?}: {}", registered.name, err);
                continue;
            }
            let taken = kv.name_info(&registered.name)?.is_some()
                || infos.iter().any(|info: &NameInfo| info.name == registered.name);
            if taken {
                continue;
            }
            infos.push(NameInfo {
                name: registered.name,
                public_key: registered.public_key,
                import_height: registered.height,
            });
        }
    }

    let height = target.max(last);
    with_write_batch(kv, |wb| {
        for info in &infos {
            wb.set_name_info(info);
        }
        wb.set_last_name_import_height(height);
        wb.set_initial_import_complete();
        Ok::<_, ImportError>(())
    })?;
    log::debug!("imported {} names up to height {}", infos.len(), height);
    Ok((infos.len(), height))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        kv::{mem_db::MemDB, pluggables::KVGet},
        registry::{RegisteredName, RegistryError},
        types::data_types::PublicKeyBytes,
    };

    struct FakeRegistry {
        height: Mutex<u32>,
        names: Vec<RegisteredName>,
    }

    impl NameRegistry for FakeRegistry {
        fn height(&self) -> Result<u32, RegistryError> {
            Ok(*self.height.lock().unwrap())
        }

        fn names_in(&self, from: u32, to: u32) -> Result<Vec<RegisteredName>, RegistryError> {
            Ok(self
                .names
                .iter()
                .filter(|n| (from..=to).contains(&n.height))
                .cloned()
                .collect())
        }
    }

    fn registered(name: &str, key: u8, height: u32) -> RegisteredName {
        RegisteredName {
            name: name.into(),
            public_key: PublicKeyBytes::new([key; 33]),
            height,
        }
    }

    #[test]
    fn only_confirmed_names_are_imported() {
        let registry = FakeRegistry {
            height: Mutex::new(20),
            names: vec![registered("foo", 1, 5), registered("bar", 2, 15)],
        };
        let mut kv = MemDB::new();
        assert!(!kv.initial_import_complete());

        assert_eq!(import_names(&mut kv, &registry, 10).unwrap(), (1, 10));
        assert!(kv.initial_import_complete());
        assert_eq!(kv.last_name_import_height().unwrap(), 10);
        assert!(kv.name_info("foo").unwrap().is_some());
        assert!(kv.name_info("bar").unwrap().is_none());

        *registry.height.lock().unwrap() = 30;
        assert_eq!(import_names(&mut kv, &registry, 10).unwrap(), (1, 20));
        assert_eq!(kv.name_info("bar").unwrap().unwrap().import_height, 15);
    }

    #[test]
    fn names_are_never_overwritten() {
        let registry = FakeRegistry {
            height: Mutex::new(10),
            names: vec![registered("foo", 1, 1), registered("foo", 2, 2), registered("foo", 3, 8)],
        };
        let mut kv = MemDB::new();
        import_names(&mut kv, &registry, 5).unwrap();
        *registry.height.lock().unwrap() = 20;
        import_names(&mut kv, &registry, 5).unwrap();
        assert_eq!(
            kv.name_info("foo").unwrap().unwrap().public_key,
            PublicKeyBytes::new([1; 33])
        );
    }

    #[test]
    fn invalid_names_are_skipped() {
        let registry = FakeRegistry {
            height: Mutex::new(10),
            names: vec![registered("-bad", 1, 1), registered("Good", 1, 1), registered("ok", 1, 1)],
        };
        let mut kv = MemDB::new();
        assert_eq!(import_names(&mut kv, &registry, 0).unwrap().0, 1);
        assert!(kv.name_info("ok").unwrap().is_some());
    }

    #[test]
    fn a_short_registry_still_completes_the_initial_import() {
        let registry = FakeRegistry {
            height: Mutex::new(3),
            names: Vec::new(),
        };
        let mut kv = MemDB::new();
        assert_eq!(import_names(&mut kv, &registry, 10).unwrap(), (0, 0));
        assert!(kv.initial_import_complete());
    }
}
