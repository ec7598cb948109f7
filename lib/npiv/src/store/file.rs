// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use uuid::Uuid;

use crate::mgmt::{MetadataStore, VmInstance};

type Entries = BTreeMap<Uuid, BTreeMap<String, String>>;

/// VM metadata persisted as a JSON document on the local filesystem.
///
/// Every `set` rewrites the whole document through a temporary file in the
/// same directory, then renames it over the original, so a crash leaves
/// either the old or the new contents in place.
pub struct FileMetadataStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl FileMetadataStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).with_context(|| {
                format!("parsing metadata file {}", path.display())
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => Entries::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading metadata file {}", path.display())
                })
            }
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> anyhow::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, entries)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).with_context(|| {
            format!("replacing metadata file {}", self.path.display())
        })?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
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
        let mut updated = entries.clone();
        updated.entry(vm.uuid).or_default().insert(key.to_string(), value);
        self.persist(&updated)?;
        *entries = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm(name: &str) -> VmInstance {
        VmInstance { uuid: Uuid::new_v4(), name: name.to_string() }
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let vm1 = test_vm("vm-1");
        let vm2 = test_vm("vm-2");

        {
            let store = FileMetadataStore::open(&path).unwrap();
            assert_eq!(store.get(&vm1, "k").unwrap(), None);
            store.set(&vm1, "k", "one".to_string()).unwrap();
            store.set(&vm2, "k", "two".to_string()).unwrap();
            store.set(&vm1, "k", "uno".to_string()).unwrap();
        }

        let store = FileMetadataStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert_eq!(store.get(&vm1, "k").unwrap().as_deref(), Some("uno"));
        assert_eq!(store.get(&vm2, "k").unwrap().as_deref(), Some("two"));
        assert_eq!(store.get(&vm2, "other").unwrap(), None);
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileMetadataStore::open(&path).is_err());
    }
}
