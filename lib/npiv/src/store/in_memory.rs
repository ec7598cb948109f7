// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::mgmt::{MetadataStore, VmInstance};

/// VM metadata held in process memory.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    entries: Mutex<BTreeMap<Uuid, BTreeMap<String, String>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists the keys stored for a VM.
    pub fn keys(&self, vm: &VmInstance) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&vm.uuid)
            .map(|kv| kv.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn get(&self, vm: &VmInstance, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(&vm.uuid).and_then(|kv| kv.get(key)).cloned())
    }

    fn set(
        &self,
        vm: &VmInstance,
        key: &str,
        value: String,
    ) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(vm.uuid).or_default().insert(key.to_string(), value);
        Ok(())
    }
}
