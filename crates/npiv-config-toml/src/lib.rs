// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes an NPIV driver config which may be parsed from a TOML file.

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub use npiv_types::Wwpn;

/// Number of virtual ports allocated per VM per fabric when the file does not
/// say otherwise.
pub const DEFAULT_PORTS_PER_FABRIC: u32 = 1;

/// Configuration for the NPIV volume driver.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default = "default_ports_per_fabric")]
    pub ports_per_fabric: u32,

    #[serde(default, rename = "fabric")]
    pub fabrics: BTreeMap<String, Fabric>,

    /// Description of a simulated host, consumed only by the standalone tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,

    #[serde(default, rename = "vios", skip_serializing_if = "Vec::is_empty")]
    pub vioses: Vec<Vios>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports_per_fabric: DEFAULT_PORTS_PER_FABRIC,
            fabrics: BTreeMap::new(),
            host: None,
            vioses: Vec::new(),
        }
    }
}

fn default_ports_per_fabric() -> u32 {
    DEFAULT_PORTS_PER_FABRIC
}

/// A named SAN fabric and the physical ports through which it is reachable.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Fabric {
    #[serde(default)]
    pub physical_wwpns: Vec<Wwpn>,
}

/// Identity of a simulated host.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Host {
    pub id: String,

    #[serde(default = "default_mgmt_partition")]
    pub mgmt_partition: String,

    /// Leading hex digits used when minting virtual WWPNs.
    #[serde(default = "default_wwpn_prefix")]
    pub wwpn_prefix: String,
}

fn default_mgmt_partition() -> String {
    "mgmt".to_string()
}

fn default_wwpn_prefix() -> String {
    "C05076".to_string()
}

/// A simulated virtual I/O server and the physical ports it owns.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Vios {
    pub name: String,

    #[serde(default, rename = "port")]
    pub ports: Vec<ViosPort>,
}

/// A physical Fibre Channel port owned by a [`Vios`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ViosPort {
    pub wwpn: Wwpn,

    /// Remaining NPIV capacity of the port.
    #[serde(default = "default_available_ports")]
    pub available_ports: u32,
}

fn default_available_ports() -> u32 {
    64
}

/// Errors which may be returned when parsing the driver configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config { ..Default::default() };
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
ports_per_fabric = 2

[fabric.A]
physical_wwpns = ["10000090FA1B2C3D", "10:00:00:90:fa:1b:2c:3e"]

[fabric.B]
physical_wwpns = ["10000090FA1B2C40"]

[host]
id = "host-1"

[[vios]]
name = "vios1"

[[vios.port]]
wwpn = "10000090FA1B2C3D"
available_ports = 8

[[vios.port]]
wwpn = "10000090FA1B2C40"
"#;
        let cfg: Config = toml::de::from_str(raw).unwrap();

        assert_eq!(cfg.ports_per_fabric, 2);
        assert_eq!(cfg.fabrics.len(), 2);

        let a = cfg.fabrics.get("A").unwrap();
        assert_eq!(
            a.physical_wwpns,
            vec![
                "10000090FA1B2C3D".parse::<Wwpn>().unwrap(),
                "10000090FA1B2C3E".parse::<Wwpn>().unwrap(),
            ]
        );

        let host = cfg.host.as_ref().unwrap();
        assert_eq!(host.id, "host-1");
        assert_eq!(host.mgmt_partition, "mgmt");
        assert_eq!(host.wwpn_prefix, "C05076");

        assert_eq!(cfg.vioses.len(), 1);
        assert_eq!(cfg.vioses[0].ports.len(), 2);
        assert_eq!(cfg.vioses[0].ports[0].available_ports, 8);
        assert_eq!(cfg.vioses[0].ports[1].available_ports, 64);
    }

    #[test]
    fn ports_per_fabric_defaults() {
        let cfg: Config = toml::de::from_str("[fabric.A]\n").unwrap();
        assert_eq!(cfg.ports_per_fabric, DEFAULT_PORTS_PER_FABRIC);
        assert!(cfg.fabrics.get("A").unwrap().physical_wwpns.is_empty());
    }

    #[test]
    fn bad_wwpn_is_rejected() {
        let raw = r#"
[fabric.A]
physical_wwpns = ["not-a-wwpn"]
"#;
        assert!(toml::de::from_str::<Config>(raw).is_err());
    }
}
