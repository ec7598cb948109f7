// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by other NPIV crates.
//!
//! This crate defines the basic Fibre Channel identities and per-fabric states
//! used by the configuration parser, the core library, and the standalone
//! tool, so that each of them can convert to and from these types without any
//! layering oddities.

use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const WWPN_HEX_DIGITS: usize = 16;

/// Errors produced while parsing a [`Wwpn`] from text.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WwpnParseError {
    #[error("expected 16 hex digits in WWPN {0:?}, got {1}")]
    BadLength(String, usize),

    #[error("invalid hex digit in WWPN {0:?}")]
    BadDigit(String),
}

/// A World Wide Port Name: the 64-bit identity of a Fibre Channel port.
///
/// Parses from 16 hex digits, optionally separated by colons
/// ("10:00:00:90:fa:1b:2c:3d"), and always displays as 16 upper-case digits
/// with no separators.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Wwpn(u64);

impl Wwpn {
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for Wwpn {
    type Err = WwpnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':').collect();
        if digits.len() != WWPN_HEX_DIGITS {
            return Err(WwpnParseError::BadLength(s.to_owned(), digits.len()));
        }

        // from_str_radix tolerates a leading '+', which is not a hex digit.
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WwpnParseError::BadDigit(s.to_owned()));
        }

        u64::from_str_radix(&digits, 16)
            .map(Self)
            .map_err(|_| WwpnParseError::BadDigit(s.to_owned()))
    }
}

impl Display for Wwpn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl Serialize for Wwpn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for Wwpn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// The two WWPNs backing a single virtual Fibre Channel port slot.
///
/// Client adapters are always created in pairs so that the second WWPN can
/// be logged in on a migration target while the first is still in use.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(Serialize, Deserialize)]
pub struct VirtualPortPair {
    pub first: Wwpn,
    pub second: Wwpn,
}

impl VirtualPortPair {
    pub fn new(first: Wwpn, second: Wwpn) -> Self {
        Self { first, second }
    }

    /// Returns both WWPNs in slot order.
    pub fn wwpns(&self) -> [Wwpn; 2] {
        [self.first, self.second]
    }
}

impl Display for VirtualPortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.first, self.second)
    }
}

/// Binds one virtual port slot to the physical port that carries it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(Serialize, Deserialize)]
pub struct PortMapping {
    pub physical: Wwpn,
    pub virtual_ports: VirtualPortPair,
}

impl PortMapping {
    pub fn new(physical: Wwpn, virtual_ports: VirtualPortPair) -> Self {
        Self { physical, virtual_ports }
    }
}

impl Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.physical, self.virtual_ports)
    }
}

/// Collects the virtual WWPNs of a port map, in mapping order.
pub fn virtual_wwpns<'a>(
    map: impl IntoIterator<Item = &'a PortMapping>,
) -> Vec<Wwpn> {
    map.into_iter().flat_map(|m| m.virtual_ports.wwpns()).collect()
}

/// Who currently owns a VM's virtual ports on a given fabric.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FabricState {
    /// No mapping exists for the fabric.
    #[default]
    Unmapped,

    /// The ports are parked on the management partition so that their
    /// WWPNs are logged into the fabric before the VM exists.
    MgmtMapped,

    /// The ports are mapped to the VM itself.
    InstMapped,
}

/// The lifecycle task a VM is currently undergoing, as reported by the host
/// compute framework.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Spawning,
    Deleting,
    ResizeMigrating,
    Rebooting,
    PoweringOff,
    Migrating,
    Other(String),
}

impl TaskState {
    /// Returns `true` if virtual port mappings should be torn down while
    /// the VM is in this task.
    ///
    /// Deletion tears mappings down, as does a roll-back of a failed spawn.
    pub fn requires_npiv_teardown(&self) -> bool {
        matches!(self, TaskState::Deleting | TaskState::Spawning)
    }

    fn as_str(&self) -> &str {
        match self {
            TaskState::Spawning => "spawning",
            TaskState::Deleting => "deleting",
            TaskState::ResizeMigrating => "resize_migrating",
            TaskState::Rebooting => "rebooting",
            TaskState::PoweringOff => "powering-off",
            TaskState::Migrating => "migrating",
            TaskState::Other(s) => s,
        }
    }
}

impl FromStr for TaskState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "spawning" => TaskState::Spawning,
            "deleting" => TaskState::Deleting,
            "resize_migrating" => TaskState::ResizeMigrating,
            "rebooting" => TaskState::Rebooting,
            "powering-off" => TaskState::PoweringOff,
            "migrating" => TaskState::Migrating,
            other => TaskState::Other(other.to_owned()),
        })
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_test::{assert_tokens, Token};

    const TEST_CASES: &[(&str, Result<u64, ()>)] = &[
        ("10000090FA1B2C3D", Ok(0x1000_0090_FA1B_2C3D)),
        ("c05076065a8b0010", Ok(0xC050_7606_5A8B_0010)),
        ("21:00:00:24:ff:64:91:04", Ok(0x2100_0024_FF64_9104)),
        ("0000000000000000", Ok(0)),
        ("10000090FA1B2C3", Err(())),
        ("10000090FA1B2C3D0", Err(())),
        ("10000090FA1B2CXD", Err(())),
        ("+0000090FA1B2C3D", Err(())),
        ("", Err(())),
        ("alas, poor WWPN", Err(())),
    ];

    #[test]
    fn wwpn_from_str() {
        for (input, expected) in TEST_CASES {
            match Wwpn::from_str(input) {
                Ok(wwpn) => assert_eq!(wwpn.as_u64(), expected.unwrap()),
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing WWPN {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn wwpn_displays_normalized() {
        let wwpn: Wwpn = "21:00:00:24:ff:64:91:04".parse().unwrap();
        assert_eq!(wwpn.to_string(), "21000024FF649104");
        assert_eq!(Wwpn::from_u64(0x1).to_string(), "0000000000000001");
    }

    #[test]
    fn wwpn_serialization() {
        let wwpn: Wwpn = "c05076065a8b0010".parse().unwrap();
        assert_tokens(&wwpn, &[Token::Str("C05076065A8B0010")]);

        let de: serde::de::value::StrDeserializer<serde::de::value::Error> =
            serde::de::IntoDeserializer::into_deserializer("not-a-wwpn");
        assert!(Wwpn::deserialize(de).is_err());
    }

    #[test]
    fn fabric_state_names() {
        assert_eq!(FabricState::Unmapped.to_string(), "unmapped");
        assert_eq!(FabricState::MgmtMapped.to_string(), "mgmt_mapped");
        assert_eq!(
            "inst_mapped".parse::<FabricState>().unwrap(),
            FabricState::InstMapped
        );
        assert!("parked".parse::<FabricState>().is_err());
        assert_eq!(
            serde_json::to_string(&FabricState::MgmtMapped).unwrap(),
            "\"mgmt_mapped\""
        );
    }

    #[test]
    fn task_state_teardown() {
        let deleting: TaskState = "deleting".parse().unwrap();
        let spawning: TaskState = "spawning".parse().unwrap();
        let resizing: TaskState = "resize_migrating".parse().unwrap();
        let custom: TaskState = "shelving".parse().unwrap();

        assert!(deleting.requires_npiv_teardown());
        assert!(spawning.requires_npiv_teardown());
        assert!(!resizing.requires_npiv_teardown());
        assert_eq!(custom, TaskState::Other("shelving".to_string()));
        assert!(!custom.requires_npiv_teardown());
        assert_eq!(custom.to_string(), "shelving");
    }

    #[test]
    fn virtual_wwpns_flatten_in_order() {
        let w = |n| Wwpn::from_u64(n);
        let map = [
            PortMapping::new(w(1), VirtualPortPair::new(w(10), w(11))),
            PortMapping::new(w(2), VirtualPortPair::new(w(20), w(21))),
        ];
        assert_eq!(virtual_wwpns(&map), vec![w(10), w(11), w(20), w(21)]);
    }
}
