// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The NPIV implementation of the Fibre Channel volume adapter.
//!
//! With N_Port ID Virtualization each VM owns its own virtual WWPNs, and the
//! virtual I/O server only passes traffic through. The host framework drives a
//! VM's virtual ports through three calls:
//!
//! 1. [`NpivVolumeAdapter::wwpns`] while building the volume connector. The
//!    first call mints virtual ports for every fabric and parks them on the
//!    management partition, so that their WWPNs are logged into the fabric and
//!    can be zoned before the VM exists.
//! 2. [`NpivVolumeAdapter::connect_volume`] during spawn, which moves the
//!    parked ports to the VM.
//! 3. [`NpivVolumeAdapter::disconnect_volume`] during teardown, which removes
//!    the VM's ports.
//!
//! Each fabric moves through [`FabricState::Unmapped`],
//! [`FabricState::MgmtMapped`] and [`FabricState::InstMapped`]; the state and
//! the port map are kept in the VM's metadata between calls.
//!
//! Callers must serialize operations on any one VM.

use std::collections::BTreeMap;
use std::sync::Arc;

use npiv_types::{virtual_wwpns, FabricState, PortMapping, Wwpn};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};

use crate::config::{ConfigError, FabricConfig};
use crate::error::NpivError;
use crate::mapping;
use crate::mgmt::{
    HostId, ManagementLayer, ManagementPartition, MetadataStore, OwnerHandle,
    TaskStateOracle, VmInstance,
};
use crate::pool;
use crate::store::FabricStateStore;

/// Block device connection info handed over by the host framework.
///
/// The NPIV adapter only logs it; the fabric identity of a VM does not depend
/// on any one volume.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub driver_volume_type: String,

    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default)]
    pub data: ConnectionData,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    /// Initiator WWPN to the target WWPNs it is zoned with.
    #[serde(default)]
    pub initiator_target_map: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub target_discovered: bool,

    #[serde(default)]
    pub volume_id: Option<String>,

    #[serde(default)]
    pub target_lun: Option<u32>,

    #[serde(default)]
    pub access_mode: Option<String>,

    /// Either a single WWN or a list of them, depending on the backend.
    #[serde(default)]
    pub target_wwn: Option<serde_json::Value>,

    #[serde(default)]
    pub qos_specs: Option<serde_json::Value>,
}

impl ConnectionInfo {
    fn volume_id(&self) -> &str {
        self.data
            .volume_id
            .as_deref()
            .or(self.serial.as_deref())
            .unwrap_or("unknown")
    }
}

pub struct NpivVolumeAdapter {
    config: FabricConfig,
    mgmt_partition: Arc<dyn ManagementPartition>,
    store: FabricStateStore,
    tasks: Arc<dyn TaskStateOracle>,
    log: Logger,
}

impl NpivVolumeAdapter {
    pub fn new(
        config: FabricConfig,
        mgmt_partition: Arc<dyn ManagementPartition>,
        metadata: Arc<dyn MetadataStore>,
        tasks: Arc<dyn TaskStateOracle>,
        log: Logger,
    ) -> Self {
        let log = log.new(o!("component" => "npiv"));
        let store = FabricStateStore::new(
            metadata,
            config.fabric_names(),
            log.clone(),
        );
        Self { config, mgmt_partition, store, tasks, log }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Returns the virtual WWPNs of every fabric, which the storage backend
    /// needs in its zone set.
    ///
    /// If any fabric lacks a port map, the maps of all fabrics are rebuilt
    /// from scratch: fresh virtual ports are minted, mapped onto physical
    /// ports, stored, and parked on the management partition wherever the
    /// fabric is still unmapped. Otherwise the stored WWPNs are returned and
    /// nothing changes.
    pub fn wwpns(
        &self,
        mgmt: &dyn ManagementLayer,
        host: &HostId,
        vm: &VmInstance,
    ) -> Result<Vec<Wwpn>, NpivError> {
        let log = self.log.new(o!("vm" => vm.name.clone()));

        // Fabrics are checked against the configuration every time, in case
        // a fabric was added since the VM was first provisioned.
        let mut stored = Vec::new();
        let mut complete = true;
        for fabric in self.config.fabric_names() {
            match self.store.get_port_map(vm, fabric)? {
                Some(map) => stored.extend(virtual_wwpns(&map)),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            debug!(log, "all fabrics already provisioned";
                "wwpns" => stored.len());
            return Ok(stored);
        }

        info!(log, "building NPIV port maps for all fabrics");
        let mut vioses = mgmt
            .read_vios_ports(host)
            .map_err(NpivError::provisioning("read VIOS ports"))?;

        for (fabric, ports) in self.config.fabrics() {
            if mapping::eligible_ports(&vioses, ports).is_empty() {
                return Err(ConfigError::NoEligiblePort {
                    fabric: fabric.to_string(),
                }
                .into());
            }
        }

        let mut wwpns = Vec::new();
        for (fabric, ports) in self.config.fabrics() {
            let pairs =
                pool::build_ports(mgmt, host, self.config.ports_per_fabric())?;
            let port_map =
                mapping::derive_npiv_map(fabric, &vioses, ports, &pairs)?;
            wwpns.extend(virtual_wwpns(&port_map));

            self.store.set_port_map(vm, fabric, &port_map)?;

            // Consecutive fabrics start on different virtual I/O servers.
            vioses.reverse();

            self.add_mgmt_mappings(&log, mgmt, host, vm, fabric, &port_map)?;
        }

        Ok(wwpns)
    }

    /// Maps every fabric's virtual ports to the VM, first removing them from
    /// the management partition where they were parked.
    pub fn connect_volume(
        &self,
        mgmt: &dyn ManagementLayer,
        host: &HostId,
        vm_handle: &OwnerHandle,
        vm: &VmInstance,
        connection_info: &ConnectionInfo,
    ) -> Result<(), NpivError> {
        let log = self.log.new(o!(
            "vm" => vm.name.clone(),
            "volume" => connection_info.volume_id().to_string()
        ));

        for fabric in self.config.fabric_names() {
            let port_map = self.store.get_port_map(vm, fabric)?.ok_or_else(
                || NpivError::MissingPortMap { fabric: fabric.to_string() },
            )?;

            self.remove_mgmt_mappings(&log, mgmt, host, vm, fabric, &port_map)?;

            // Adding a mapping the VM already has is a no-op on the
            // management side, so repeated attaches do not duplicate it.
            info!(log, "adding NPIV mapping for instance"; "fabric" => fabric);
            mgmt.add_port_mappings(host, vm_handle, &port_map)
                .map_err(NpivError::provisioning("add VM port mappings"))?;

            self.store.set_state(vm, fabric, FabricState::InstMapped)?;
        }

        Ok(())
    }

    /// Removes the VM's virtual port mappings for all fabrics in one call.
    ///
    /// Mappings live as long as the VM does, not as long as any volume, so
    /// this only acts while the VM is being deleted or a failed spawn is
    /// being rolled back. Fabric states are left as they are.
    pub fn disconnect_volume(
        &self,
        mgmt: &dyn ManagementLayer,
        host: &HostId,
        vm_handle: &OwnerHandle,
        vm: &VmInstance,
        connection_info: &ConnectionInfo,
    ) -> Result<(), NpivError> {
        let log = self.log.new(o!(
            "vm" => vm.name.clone(),
            "volume" => connection_info.volume_id().to_string()
        ));

        match self.tasks.current_task(vm) {
            Some(task) if task.requires_npiv_teardown() => {
                debug!(log, "tearing down NPIV mappings"; "task" => %task);
            }
            task => {
                info!(log, "keeping NPIV mappings across volume detach";
                    "task" => ?task);
                return Ok(());
            }
        }

        let mut port_maps = Vec::new();
        for fabric in self.config.fabric_names() {
            match self.store.get_port_map(vm, fabric)? {
                Some(map) => port_maps.extend(map),
                None => {
                    debug!(log, "fabric was never mapped"; "fabric" => fabric)
                }
            }
        }
        if port_maps.is_empty() {
            return Ok(());
        }

        info!(log, "removing NPIV mapping for instance";
            "mappings" => port_maps.len());
        mgmt.remove_port_mappings(host, vm_handle, &port_maps)
            .map_err(NpivError::provisioning("remove VM port mappings"))
    }

    /// The name the storage backend uses for this VM's host entry.
    pub fn host_name(&self, vm: &VmInstance) -> String {
        vm.name.clone()
    }

    /// Returns the stored state of each configured fabric without
    /// initializing anything.
    pub fn fabric_states(
        &self,
        vm: &VmInstance,
    ) -> Result<BTreeMap<String, FabricState>, NpivError> {
        let records = self.store.records(vm)?;
        Ok(self
            .config
            .fabric_names()
            .map(|fabric| {
                let state = records
                    .get(fabric)
                    .and_then(|r| r.state)
                    .unwrap_or_default();
                (fabric.to_string(), state)
            })
            .collect())
    }

    /// Returns the stored port map of each configured fabric.
    pub fn port_maps(
        &self,
        vm: &VmInstance,
    ) -> Result<BTreeMap<String, Option<Vec<PortMapping>>>, NpivError> {
        let mut records = self.store.records(vm)?;
        Ok(self
            .config
            .fabric_names()
            .map(|fabric| {
                let map = records.remove(fabric).and_then(|r| r.port_map);
                (fabric.to_string(), map)
            })
            .collect())
    }

    /// Parks a fabric's ports on the management partition if nothing owns
    /// them yet, logging their WWPNs into the physical fabric.
    fn add_mgmt_mappings(
        &self,
        log: &Logger,
        mgmt: &dyn ManagementLayer,
        host: &HostId,
        vm: &VmInstance,
        fabric: &str,
        port_map: &[PortMapping],
    ) -> Result<(), NpivError> {
        let state = self.store.get_state(vm, fabric)?;
        info!(log, "NPIV fabric state"; "fabric" => fabric, "state" => %state);
        if state != FabricState::Unmapped {
            return Ok(());
        }

        let mgmt_handle = self
            .mgmt_partition
            .handle()
            .map_err(NpivError::provisioning("look up management partition"))?;
        info!(log, "adding NPIV mapping with management partition";
            "fabric" => fabric, "mgmt" => %mgmt_handle);
        mgmt.add_port_mappings(host, &mgmt_handle, port_map).map_err(
            NpivError::provisioning("park ports on management partition"),
        )?;

        self.store.set_state(vm, fabric, FabricState::MgmtMapped)?;
        Ok(())
    }

    /// Unparks a fabric's ports from the management partition so that they
    /// can be mapped to the VM.
    fn remove_mgmt_mappings(
        &self,
        log: &Logger,
        mgmt: &dyn ManagementLayer,
        host: &HostId,
        vm: &VmInstance,
        fabric: &str,
        port_map: &[PortMapping],
    ) -> Result<(), NpivError> {
        if self.store.get_state(vm, fabric)? != FabricState::MgmtMapped {
            return Ok(());
        }

        let mgmt_handle = self
            .mgmt_partition
            .handle()
            .map_err(NpivError::provisioning("look up management partition"))?;
        info!(log, "removing NPIV mapping for management partition";
            "fabric" => fabric, "mgmt" => %mgmt_handle);
        mgmt.remove_port_mappings(host, &mgmt_handle, port_map).map_err(
            NpivError::provisioning("unpark ports from management partition"),
        )?;

        self.store.set_state(vm, fabric, FabricState::Unmapped)?;
        Ok(())
    }
}
