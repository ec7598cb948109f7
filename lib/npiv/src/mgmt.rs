// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the collaborators the NPIV adapter drives: the hypervisor
//! management layer, the management partition, the VM metadata store, and the
//! host framework's view of the VM's current task.
//!
//! These are abstracted into traits so the orchestration logic can be tested
//! against mocks, and so the host framework can plug in its own clients.

use std::fmt;

use npiv_types::{PortMapping, TaskState, VirtualPortPair, Wwpn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the physical host whose virtual I/O servers own the ports.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct HostId(pub String);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a partition that can own virtual port mappings: a VM, the
/// management partition, or a virtual I/O server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct OwnerHandle(pub String);

impl fmt::Display for OwnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The host framework's record of a VM.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmInstance {
    pub uuid: Uuid,
    pub name: String,
}

/// A physical Fibre Channel port and its remaining NPIV capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPort {
    pub wwpn: Wwpn,
    pub available_ports: u32,
}

/// The physical ports supplied by one virtual I/O server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViosPorts {
    pub vios: OwnerHandle,
    pub ports: Vec<PhysicalPort>,
}

/// Operations on the hypervisor management API.
///
/// Adding a mapping that already exists, or removing one that does not, must
/// succeed without effect.
#[cfg_attr(test, mockall::automock)]
pub trait ManagementLayer: Send + Sync {
    /// Reads the Fibre Channel port inventory of every virtual I/O server on
    /// the host.
    fn read_vios_ports(&self, host: &HostId) -> anyhow::Result<Vec<ViosPorts>>;

    /// Asks the host to mint one fresh pair of virtual WWPNs.
    fn build_virtual_port_pair(
        &self,
        host: &HostId,
    ) -> anyhow::Result<VirtualPortPair>;

    /// Maps the given virtual ports to `owner` over their physical ports.
    fn add_port_mappings(
        &self,
        host: &HostId,
        owner: &OwnerHandle,
        mappings: &[PortMapping],
    ) -> anyhow::Result<()>;

    /// Removes the given virtual port mappings from `owner`.
    fn remove_port_mappings(
        &self,
        host: &HostId,
        owner: &OwnerHandle,
        mappings: &[PortMapping],
    ) -> anyhow::Result<()>;
}

/// Resolves the identity of the host's management partition, which parks
/// virtual ports before their VM exists.
#[cfg_attr(test, mockall::automock)]
pub trait ManagementPartition: Send + Sync {
    fn handle(&self) -> anyhow::Result<OwnerHandle>;
}

/// The VM's key/value metadata; the only durable storage the driver has.
#[cfg_attr(test, mockall::automock)]
pub trait MetadataStore: Send + Sync {
    fn get(&self, vm: &VmInstance, key: &str) -> anyhow::Result<Option<String>>;

    fn set(&self, vm: &VmInstance, key: &str, value: String)
        -> anyhow::Result<()>;
}

/// Reports the lifecycle task the host framework is running for a VM.
#[cfg_attr(test, mockall::automock)]
pub trait TaskStateOracle: Send + Sync {
    fn current_task(&self, vm: &VmInstance) -> Option<TaskState>;
}
