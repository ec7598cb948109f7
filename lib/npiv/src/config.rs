// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validated fabric configuration injected into the NPIV volume adapter.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;

use npiv_types::Wwpn;
use thiserror::Error;

/// Configuration problems. These are always reported before any port is
/// built or any VM metadata is written.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no fabrics are configured")]
    NoFabrics,

    #[error("ports_per_fabric must be at least 1")]
    ZeroPortsPerFabric,

    #[error("fabric name must not be empty")]
    EmptyFabricName,

    #[error("fabric {fabric} has no physical ports")]
    NoPhysicalPorts { fabric: String },

    #[error("physical port {wwpn} listed more than once for fabric {fabric}")]
    DuplicatePhysicalPort { fabric: String, wwpn: Wwpn },

    #[error("no virtual I/O server offers an eligible port for fabric {fabric}")]
    NoEligiblePort { fabric: String },
}

/// The set of fabrics the host is attached to, and how many virtual ports
/// each VM receives on every one of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FabricConfig {
    fabrics: BTreeMap<String, Vec<Wwpn>>,
    ports_per_fabric: NonZeroU32,
}

impl FabricConfig {
    pub fn new(
        fabrics: BTreeMap<String, Vec<Wwpn>>,
        ports_per_fabric: u32,
    ) -> Result<Self, ConfigError> {
        let ports_per_fabric = NonZeroU32::new(ports_per_fabric)
            .ok_or(ConfigError::ZeroPortsPerFabric)?;

        if fabrics.is_empty() {
            return Err(ConfigError::NoFabrics);
        }

        for (fabric, ports) in &fabrics {
            if fabric.is_empty() {
                return Err(ConfigError::EmptyFabricName);
            }
            if ports.is_empty() {
                return Err(ConfigError::NoPhysicalPorts {
                    fabric: fabric.clone(),
                });
            }

            let mut seen = BTreeSet::new();
            for wwpn in ports {
                if !seen.insert(*wwpn) {
                    return Err(ConfigError::DuplicatePhysicalPort {
                        fabric: fabric.clone(),
                        wwpn: *wwpn,
                    });
                }
            }
        }

        Ok(Self { fabrics, ports_per_fabric })
    }

    /// Builds the validated configuration from a parsed TOML file.
    pub fn from_toml(
        cfg: &npiv_config_toml::Config,
    ) -> Result<Self, ConfigError> {
        let fabrics = cfg
            .fabrics
            .iter()
            .map(|(name, fabric)| (name.clone(), fabric.physical_wwpns.clone()))
            .collect();
        Self::new(fabrics, cfg.ports_per_fabric)
    }

    /// Fabric names, in the order every per-fabric loop visits them.
    pub fn fabric_names(&self) -> impl Iterator<Item = &str> {
        self.fabrics.keys().map(String::as_str)
    }

    /// Each fabric paired with the WWPNs of its physical ports.
    pub fn fabrics(&self) -> impl Iterator<Item = (&str, &[Wwpn])> {
        self.fabrics.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn fabric_ports(&self, fabric: &str) -> Option<&[Wwpn]> {
        self.fabrics.get(fabric).map(Vec::as_slice)
    }

    pub fn ports_per_fabric(&self) -> u32 {
        self.ports_per_fabric.get()
    }
}
