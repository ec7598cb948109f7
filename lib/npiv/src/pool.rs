// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the pool of virtual ports a VM receives on one fabric.

use npiv_types::VirtualPortPair;

use crate::error::NpivError;
use crate::mgmt::{HostId, ManagementLayer};

/// Requests `count` fresh virtual port pairs from the management layer.
///
/// Each pair costs one management call. The first failure is returned as-is;
/// pairs minted before it are dropped.
pub fn build_ports(
    mgmt: &dyn ManagementLayer,
    host: &HostId,
    count: u32,
) -> Result<Vec<VirtualPortPair>, NpivError> {
    (0..count)
        .map(|_| {
            mgmt.build_virtual_port_pair(host)
                .map_err(NpivError::provisioning("build virtual port pair"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::MockManagementLayer;
    use npiv_types::Wwpn;

    fn pair(n: u64) -> VirtualPortPair {
        VirtualPortPair::new(Wwpn::from_u64(2 * n), Wwpn::from_u64(2 * n + 1))
    }

    #[test]
    fn builds_requested_count() {
        let mut mgmt = MockManagementLayer::new();
        let mut next = 0;
        mgmt.expect_build_virtual_port_pair().times(3).returning(move |_| {
            next += 1;
            Ok(pair(next))
        });

        let host = HostId("host".to_string());
        let ports = build_ports(&mgmt, &host, 3).unwrap();
        assert_eq!(ports, vec![pair(1), pair(2), pair(3)]);
    }

    #[test]
    fn failure_stops_the_pool() {
        let mut mgmt = MockManagementLayer::new();
        let mut calls = 0;
        mgmt.expect_build_virtual_port_pair().times(2).returning(move |_| {
            calls += 1;
            if calls == 2 {
                Err(anyhow::anyhow!("hmc unreachable"))
            } else {
                Ok(pair(calls))
            }
        });

        let host = HostId("host".to_string());
        let err = build_ports(&mgmt, &host, 4).unwrap_err();
        assert!(matches!(
            err,
            NpivError::Provisioning { op: "build virtual port pair", .. }
        ));
    }
}
