//! A [`NameRegistry`] whose registrations are set by the test.

use std::sync::Mutex;

use ddrp_rs::{
    registry::{NameRegistry, RegisteredName, RegistryError},
    types::data_types::PublicKeyBytes,
};

pub(crate) struct StaticRegistry {
    height: Mutex<u32>,
    names: Mutex<Vec<RegisteredName>>,
}

impl StaticRegistry {
    pub(crate) fn new() -> StaticRegistry {
        StaticRegistry {
            height: Mutex::new(1),
            names: Mutex::new(Vec::new()),
        }
    }

    /// Register `name` to `public_key` at the current height.
    pub(crate) fn register(&self, name: &str, public_key: PublicKeyBytes) {
        let height = *self.height.lock().unwrap();
        self.names.lock().unwrap().push(RegisteredName {
            name: name.into(),
            public_key,
            height,
        });
    }
}

impl NameRegistry for StaticRegistry {
    fn height(&self) -> Result<u32, RegistryError> {
        Ok(*self.height.lock().unwrap())
    }

    fn names_in(&self, from: u32, to: u32) -> Result<Vec<RegisteredName>, RegistryError> {
        Ok(self
            .names
            .lock()
            .unwrap()
            .iter()
            .filter(|name| (from..=to).contains(&name.height))
            .cloned()
            .collect())
    }
}
