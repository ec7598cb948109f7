// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persists per-fabric NPIV state in the VM's metadata.
//!
//! The VM metadata is the only storage that outlives the calls made by the
//! host framework, and the mapping of virtual to physical ports cannot be
//! recomputed once the virtual ports exist. All fabrics of a VM are kept in a
//! single versioned record under [`FABRICS_KEY`], so the state and port map of
//! a fabric are always written together.
//!
//! Records written by older drivers, one `fabric_state_<F>` key and one
//! `npiv_adpt_wwpns_<F>` key per fabric, are read when no versioned record
//! exists. The next write replaces them with the versioned record.
//!
//! No other module builds metadata keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use npiv_types::{FabricState, PortMapping};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use thiserror::Error;

use crate::mgmt::{MetadataStore, VmInstance};

mod codec;
mod file;
mod in_memory;

pub use codec::{decode_legacy, encode_legacy, DecodeError};
pub use file::FileMetadataStore;
pub use in_memory::InMemoryMetadataStore;

/// Metadata key holding the versioned record of every fabric.
pub const FABRICS_KEY: &str = "npiv_fabrics";

const LEGACY_STATE_PREFIX: &str = "fabric_state";
const LEGACY_PORT_MAP_PREFIX: &str = "npiv_adpt_wwpns";

/// Combination of kind and version identifying the layout of a stored record.
pub type SchemaId = (&'static str, u32);

const FABRICS_SCHEMA: SchemaId = ("npiv-fabrics", 1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store access failed for key {key}")]
    Metadata {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("stored fabric record is corrupt")]
    Decode(#[from] DecodeError),

    #[error("could not serialize fabric record: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// What is known about one fabric of a VM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricRecord {
    /// `None` until the state is first read or written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FabricState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_map: Option<Vec<PortMapping>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FabricsPayload {
    kind: String,
    version: u32,
    fabrics: BTreeMap<String, FabricRecord>,
}

impl FabricsPayload {
    fn new(fabrics: BTreeMap<String, FabricRecord>) -> Self {
        let (kind, version) = FABRICS_SCHEMA;
        Self { kind: kind.to_string(), version, fabrics }
    }

    fn matches(&self, id: SchemaId) -> bool {
        self.kind == id.0 && self.version == id.1
    }
}

/// Typed access to the fabric state of a VM.
pub struct FabricStateStore {
    meta: Arc<dyn MetadataStore>,
    fabric_names: Vec<String>,
    log: Logger,
}

impl FabricStateStore {
    /// Creates a store for the given fabrics. The names are needed to locate
    /// records written in the per-fabric key layout.
    pub fn new(
        meta: Arc<dyn MetadataStore>,
        fabric_names: impl IntoIterator<Item = impl Into<String>>,
        log: Logger,
    ) -> Self {
        Self {
            meta,
            fabric_names: fabric_names.into_iter().map(Into::into).collect(),
            log: log.new(o!("component" => "fabric-state")),
        }
    }

    /// Returns the fabric's state, initializing it to
    /// [`FabricState::Unmapped`] if none was stored.
    pub fn get_state(
        &self,
        vm: &VmInstance,
        fabric: &str,
    ) -> Result<FabricState, StoreError> {
        let mut fabrics = self.load(vm)?;
        let record = fabrics.entry(fabric.to_string()).or_default();
        if let Some(state) = record.state {
            return Ok(state);
        }

        debug!(self.log, "initializing fabric state";
            "vm" => &vm.name, "fabric" => fabric);
        record.state = Some(FabricState::Unmapped);
        self.save(vm, fabrics)?;
        Ok(FabricState::Unmapped)
    }

    pub fn set_state(
        &self,
        vm: &VmInstance,
        fabric: &str,
        state: FabricState,
    ) -> Result<(), StoreError> {
        info!(self.log, "setting fabric state";
            "vm" => &vm.name, "fabric" => fabric, "state" => %state);
        self.update(vm, fabric, |record| record.state = Some(state))
    }

    /// Returns the stored port map, or `None` if the fabric has never been
    /// provisioned for this VM.
    pub fn get_port_map(
        &self,
        vm: &VmInstance,
        fabric: &str,
    ) -> Result<Option<Vec<PortMapping>>, StoreError> {
        let mut fabrics = self.load(vm)?;
        Ok(fabrics.remove(fabric).and_then(|r| r.port_map))
    }

    pub fn set_port_map(
        &self,
        vm: &VmInstance,
        fabric: &str,
        map: &[PortMapping],
    ) -> Result<(), StoreError> {
        debug!(self.log, "storing port map";
            "vm" => &vm.name, "fabric" => fabric, "ports" => map.len());
        self.update(vm, fabric, |record| record.port_map = Some(map.to_vec()))
    }

    /// Returns every stored fabric record without initializing anything.
    pub fn records(
        &self,
        vm: &VmInstance,
    ) -> Result<BTreeMap<String, FabricRecord>, StoreError> {
        self.load(vm)
    }

    fn update(
        &self,
        vm: &VmInstance,
        fabric: &str,
        f: impl FnOnce(&mut FabricRecord),
    ) -> Result<(), StoreError> {
        let mut fabrics = self.load(vm)?;
        f(fabrics.entry(fabric.to_string()).or_default());
        self.save(vm, fabrics)
    }

    fn load(
        &self,
        vm: &VmInstance,
    ) -> Result<BTreeMap<String, FabricRecord>, StoreError> {
        let Some(raw) = self.read(vm, FABRICS_KEY)? else {
            return self.load_legacy(vm);
        };

        let payload: FabricsPayload =
            serde_json::from_str(&raw).map_err(DecodeError::from)?;
        if !payload.matches(FABRICS_SCHEMA) {
            return Err(DecodeError::UnexpectedPayload(
                payload.kind,
                payload.version,
            )
            .into());
        }
        Ok(payload.fabrics)
    }

    fn load_legacy(
        &self,
        vm: &VmInstance,
    ) -> Result<BTreeMap<String, FabricRecord>, StoreError> {
        let mut fabrics = BTreeMap::new();
        for fabric in &self.fabric_names {
            let state = self
                .read(vm, &legacy_key(LEGACY_STATE_PREFIX, fabric))?
                .map(|s| {
                    s.parse::<FabricState>()
                        .map_err(|_| DecodeError::UnknownState(s))
                })
                .transpose()?;
            let port_map = self
                .read(vm, &legacy_key(LEGACY_PORT_MAP_PREFIX, fabric))?
                .map(|s| decode_legacy(&s))
                .transpose()?;

            if state.is_some() || port_map.is_some() {
                info!(self.log, "importing per-fabric metadata";
                    "vm" => &vm.name, "fabric" => fabric);
                fabrics.insert(fabric.clone(), FabricRecord { state, port_map });
            }
        }
        Ok(fabrics)
    }

    fn save(
        &self,
        vm: &VmInstance,
        fabrics: BTreeMap<String, FabricRecord>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&FabricsPayload::new(fabrics))
            .map_err(StoreError::Serialize)?;
        self.meta.set(vm, FABRICS_KEY, raw).map_err(|source| {
            StoreError::Metadata { key: FABRICS_KEY.to_string(), source }
        })
    }

    fn read(
        &self,
        vm: &VmInstance,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        self.meta
            .get(vm, key)
            .map_err(|source| StoreError::Metadata { key: key.to_string(), source })
    }
}

fn legacy_key(prefix: &str, fabric: &str) -> String {
    format!("{prefix}_{fabric}")
}
