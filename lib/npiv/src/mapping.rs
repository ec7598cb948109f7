// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derives which physical port carries each virtual port of a fabric.
//!
//! Eligible physical ports (those on the fabric with NPIV capacity left) are
//! gathered per virtual I/O server and then interleaved, so that consecutive
//! virtual ports land on different I/O servers whenever more than one serves
//! the fabric. Callers that derive maps for several fabrics reverse the I/O
//! server order between fabrics; see [`crate::NpivVolumeAdapter::wwpns`].

use npiv_types::{PortMapping, VirtualPortPair, Wwpn};
use thiserror::Error;

use crate::mgmt::{PhysicalPort, ViosPorts};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeriveError {
    #[error("no virtual I/O server offers an eligible port for fabric {fabric}")]
    NoEligiblePort { fabric: String },

    #[error(
        "physical ports for fabric {fabric} ran out of NPIV capacity \
        after {placed} of {requested} virtual ports"
    )]
    CapacityExhausted { fabric: String, placed: usize, requested: usize },
}

/// Returns the physical ports usable for a fabric, interleaved across virtual
/// I/O servers in the order given: the first eligible port of each server,
/// then the second of each, and so on.
pub fn eligible_ports(
    vioses: &[ViosPorts],
    fabric_ports: &[Wwpn],
) -> Vec<PhysicalPort> {
    let per_vios: Vec<Vec<PhysicalPort>> = vioses
        .iter()
        .map(|v| {
            v.ports
                .iter()
                .filter(|p| {
                    p.available_ports > 0 && fabric_ports.contains(&p.wwpn)
                })
                .copied()
                .collect()
        })
        .collect();

    let depth = per_vios.iter().map(Vec::len).max().unwrap_or(0);
    let mut fused = Vec::new();
    for i in 0..depth {
        fused.extend(per_vios.iter().filter_map(|ports| ports.get(i)));
    }
    fused
}

/// Assigns each virtual port pair, in order, to a physical port.
///
/// Ports are handed out round-robin over [`eligible_ports`], skipping any whose
/// capacity has been consumed by earlier pairs of this same derivation.
pub fn derive_npiv_map(
    fabric: &str,
    vioses: &[ViosPorts],
    fabric_ports: &[Wwpn],
    pairs: &[VirtualPortPair],
) -> Result<Vec<PortMapping>, DeriveError> {
    let mut ports = eligible_ports(vioses, fabric_ports);
    if ports.is_empty() {
        return Err(DeriveError::NoEligiblePort { fabric: fabric.to_string() });
    }

    let mut map = Vec::with_capacity(pairs.len());
    let mut cursor = 0;
    for pair in pairs {
        let slot = (0..ports.len())
            .map(|off| (cursor + off) % ports.len())
            .find(|&idx| ports[idx].available_ports > 0)
            .ok_or_else(|| DeriveError::CapacityExhausted {
                fabric: fabric.to_string(),
                placed: map.len(),
                requested: pairs.len(),
            })?;

        ports[slot].available_ports -= 1;
        map.push(PortMapping::new(ports[slot].wwpn, *pair));
        cursor = slot + 1;
    }

    Ok(map)
}
