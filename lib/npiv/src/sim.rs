// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated host management layer, kept entirely in memory.
//!
//! The simulation tracks NPIV capacity of each physical port, mints virtual
//! WWPNs from a fixed prefix and a counter, and records which partition owns
//! each virtual port mapping. Like the real management API, adding a mapping
//! that exists or removing one that does not is a no-op, while mapping a
//! virtual port to a second owner is refused.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context};
use npiv_types::{PortMapping, VirtualPortPair, Wwpn};
use serde::{Deserialize, Serialize};
use slog::{debug, o, Logger};

use crate::mgmt::{
    HostId, ManagementLayer, ManagementPartition, OwnerHandle, PhysicalPort,
    ViosPorts,
};

const WWPN_BITS: u32 = 64;

/// Everything the simulated host remembers. Serializable so that a simulation
/// can outlive the process driving it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    pub vioses: Vec<ViosPorts>,

    /// Next value of the virtual WWPN counter.
    pub next_serial: u64,

    /// Number of virtual port pairs minted so far.
    pub pair_requests: u64,

    pub mappings: BTreeMap<OwnerHandle, BTreeSet<PortMapping>>,
}

impl SimState {
    fn port_mut(&mut self, wwpn: Wwpn) -> Option<&mut PhysicalPort> {
        self.vioses
            .iter_mut()
            .flat_map(|v| v.ports.iter_mut())
            .find(|p| p.wwpn == wwpn)
    }

    fn owner_of(&self, ports: &VirtualPortPair) -> Option<&OwnerHandle> {
        self.mappings.iter().find_map(|(owner, maps)| {
            maps.iter().any(|m| m.virtual_ports == *ports).then_some(owner)
        })
    }
}

pub struct SimulatedHost {
    host: HostId,
    mgmt: OwnerHandle,
    prefix: u64,
    serial_bits: u32,
    state: Mutex<SimState>,
    log: Logger,
}

impl SimulatedHost {
    /// Creates a simulated host. Virtual WWPNs begin with the hex digits of
    /// `wwpn_prefix`; the remaining digits count upward.
    pub fn new(
        host: HostId,
        mgmt: OwnerHandle,
        wwpn_prefix: &str,
        state: SimState,
        log: Logger,
    ) -> anyhow::Result<Self> {
        if wwpn_prefix.is_empty()
            || wwpn_prefix.len() > 12
            || !wwpn_prefix.chars().all(|c| c.is_ascii_hexdigit())
        {
            bail!("WWPN prefix {wwpn_prefix:?} must be 1-12 hex digits");
        }

        let serial_bits = WWPN_BITS - 4 * wwpn_prefix.len() as u32;
        let prefix = u64::from_str_radix(wwpn_prefix, 16)
            .with_context(|| format!("parsing WWPN prefix {wwpn_prefix}"))?
            << serial_bits;

        let log =
            log.new(o!("component" => "sim-host", "host" => host.0.clone()));
        Ok(Self {
            host,
            mgmt,
            prefix,
            serial_bits,
            state: Mutex::new(state),
            log,
        })
    }

    /// Creates a simulated host from the `[host]` and `[[vios]]` sections of
    /// a configuration file. A `saved` state replaces the configured port
    /// inventory.
    pub fn from_config(
        cfg: &npiv_config_toml::Config,
        saved: Option<SimState>,
        log: Logger,
    ) -> anyhow::Result<Self> {
        let host = cfg
            .host
            .as_ref()
            .ok_or_else(|| anyhow!("configuration has no [host] section"))?;

        let state = saved.unwrap_or_else(|| SimState {
            vioses: cfg
                .vioses
                .iter()
                .map(|v| ViosPorts {
                    vios: OwnerHandle(v.name.clone()),
                    ports: v
                        .ports
                        .iter()
                        .map(|p| PhysicalPort {
                            wwpn: p.wwpn,
                            available_ports: p.available_ports,
                        })
                        .collect(),
                })
                .collect(),
            ..Default::default()
        });

        Self::new(
            HostId(host.id.clone()),
            OwnerHandle(host.mgmt_partition.clone()),
            &host.wwpn_prefix,
            state,
            log,
        )
    }

    pub fn host_id(&self) -> &HostId {
        &self.host
    }

    pub fn mgmt_handle(&self) -> &OwnerHandle {
        &self.mgmt
    }

    /// Returns a copy of the simulation state.
    pub fn snapshot(&self) -> SimState {
        self.state.lock().unwrap().clone()
    }

    pub fn mappings(&self, owner: &OwnerHandle) -> Vec<PortMapping> {
        let state = self.state.lock().unwrap();
        state
            .mappings
            .get(owner)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn pair_requests(&self) -> u64 {
        self.state.lock().unwrap().pair_requests
    }

    pub fn available_ports(&self, wwpn: Wwpn) -> Option<u32> {
        self.state.lock().unwrap().port_mut(wwpn).map(|p| p.available_ports)
    }

    /// The virtual WWPNs currently mapped to any owner, and so visible on the
    /// fabric.
    pub fn logged_in(&self) -> BTreeSet<Wwpn> {
        let state = self.state.lock().unwrap();
        state
            .mappings
            .values()
            .flatten()
            .flat_map(|m| m.virtual_ports.wwpns())
            .collect()
    }

    fn check_host(&self, host: &HostId) -> anyhow::Result<()> {
        if *host != self.host {
            bail!("unknown host {host}");
        }
        Ok(())
    }
}

impl ManagementLayer for SimulatedHost {
    fn read_vios_ports(&self, host: &HostId) -> anyhow::Result<Vec<ViosPorts>> {
        self.check_host(host)?;
        Ok(self.state.lock().unwrap().vioses.clone())
    }

    fn build_virtual_port_pair(
        &self,
        host: &HostId,
    ) -> anyhow::Result<VirtualPortPair> {
        self.check_host(host)?;
        let mut state = self.state.lock().unwrap();

        let serial = state.next_serial;
        if (serial + 1) >> self.serial_bits != 0 {
            bail!("virtual WWPN space exhausted");
        }
        state.next_serial = serial + 2;
        state.pair_requests += 1;

        let pair = VirtualPortPair::new(
            Wwpn::from_u64(self.prefix | serial),
            Wwpn::from_u64(self.prefix | (serial + 1)),
        );
        debug!(self.log, "minted virtual port pair"; "pair" => %pair);
        Ok(pair)
    }

    fn add_port_mappings(
        &self,
        host: &HostId,
        owner: &OwnerHandle,
        mappings: &[PortMapping],
    ) -> anyhow::Result<()> {
        self.check_host(host)?;
        let mut state = self.state.lock().unwrap();

        // Apply to a copy so a refused mapping leaves nothing half-done.
        let mut next = state.clone();
        for m in mappings {
            if next.mappings.get(owner).is_some_and(|s| s.contains(m)) {
                continue;
            }
            if let Some(other) = next.owner_of(&m.virtual_ports) {
                let ports = m.virtual_ports;
                bail!("virtual ports {ports} already mapped to {other}");
            }

            let port = next
                .port_mut(m.physical)
                .ok_or_else(|| anyhow!("no physical port {}", m.physical))?;
            if port.available_ports == 0 {
                bail!("physical port {} has no NPIV capacity left", m.physical);
            }
            port.available_ports -= 1;
            next.mappings.entry(owner.clone()).or_default().insert(*m);
        }

        debug!(self.log, "added port mappings";
            "owner" => %owner, "count" => mappings.len());
        *state = next;
        Ok(())
    }

    fn remove_port_mappings(
        &self,
        host: &HostId,
        owner: &OwnerHandle,
        mappings: &[PortMapping],
    ) -> anyhow::Result<()> {
        self.check_host(host)?;
        let mut state = self.state.lock().unwrap();

        for m in mappings {
            let removed = state
                .mappings
                .get_mut(owner)
                .is_some_and(|set| set.remove(m));
            if removed {
                if let Some(port) = state.port_mut(m.physical) {
                    port.available_ports += 1;
                }
            }
        }
        state.mappings.retain(|_, set| !set.is_empty());

        debug!(self.log, "removed port mappings";
            "owner" => %owner, "count" => mappings.len());
        Ok(())
    }
}

impl ManagementPartition for SimulatedHost {
    fn handle(&self) -> anyhow::Result<OwnerHandle> {
        Ok(self.mgmt.clone())
    }
}
