// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use npiv::mgmt::{
    HostId, MetadataStore, OwnerHandle, PhysicalPort, TaskStateOracle,
    ViosPorts, VmInstance,
};
use npiv::sim::{SimState, SimulatedHost};
use npiv::store::{FileMetadataStore, InMemoryMetadataStore};
use npiv::{ConnectionInfo, FabricConfig, NpivVolumeAdapter};
use npiv_types::{FabricState, TaskState, Wwpn};
use slog::{o, Logger};
use uuid::Uuid;

const CAPACITY: u32 = 4;

/// Reports whatever task the test last set.
#[derive(Default)]
struct FixedTask(Mutex<Option<TaskState>>);

impl FixedTask {
    fn set(&self, task: Option<TaskState>) {
        *self.0.lock().unwrap() = task;
    }
}

impl TaskStateOracle for FixedTask {
    fn current_task(&self, _vm: &VmInstance) -> Option<TaskState> {
        self.0.lock().unwrap().clone()
    }
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn phys(n: u64) -> Wwpn {
    Wwpn::from_u64(0x1000_0090_fa00_0000 | n)
}

fn vm(name: &str) -> VmInstance {
    VmInstance { uuid: Uuid::new_v4(), name: name.to_string() }
}

/// Two virtual I/O servers, each with one port on fabric A (odd) and one on
/// fabric B (even).
fn sim_host() -> Arc<SimulatedHost> {
    let vios = |name: &str, ports: [u64; 2]| ViosPorts {
        vios: OwnerHandle(name.to_string()),
        ports: ports
            .iter()
            .map(|n| PhysicalPort { wwpn: phys(*n), available_ports: CAPACITY })
            .collect(),
    };
    let state = SimState {
        vioses: vec![vios("vios1", [1, 2]), vios("vios2", [3, 4])],
        ..Default::default()
    };
    let host = SimulatedHost::new(
        HostId("host-1".to_string()),
        OwnerHandle("mgmt".to_string()),
        "C05076",
        state,
        test_logger(),
    )
    .unwrap();
    Arc::new(host)
}

fn fabric_config(ports_per_fabric: u32) -> FabricConfig {
    let fabrics = BTreeMap::from([
        ("A".to_string(), vec![phys(1), phys(3)]),
        ("B".to_string(), vec![phys(2), phys(4)]),
    ]);
    FabricConfig::new(fabrics, ports_per_fabric).unwrap()
}

fn adapter(
    sim: &Arc<SimulatedHost>,
    meta: Arc<dyn MetadataStore>,
    tasks: &Arc<FixedTask>,
) -> NpivVolumeAdapter {
    NpivVolumeAdapter::new(
        fabric_config(2),
        sim.clone(),
        meta,
        tasks.clone(),
        test_logger(),
    )
}

#[test]
fn test_vm_lifecycle() {
    let sim = sim_host();
    let tasks = Arc::new(FixedTask::default());
    let adapter =
        adapter(&sim, Arc::new(InMemoryMetadataStore::new()), &tasks);
    let host = sim.host_id().clone();
    let mgmt = sim.mgmt_handle().clone();
    let inst = vm("vm-1");
    let handle = OwnerHandle(inst.name.clone());
    let conn = ConnectionInfo::default();

    // Two pairs on each of two fabrics.
    let wwpns = adapter.wwpns(sim.as_ref(), &host, &inst).unwrap();
    assert_eq!(wwpns.len(), 8);
    assert_eq!(sim.pair_requests(), 4);
    assert_eq!(sim.mappings(&mgmt).len(), 4);
    let logged_in: BTreeSet<Wwpn> = wwpns.iter().copied().collect();
    assert_eq!(sim.logged_in(), logged_in);
    for port in 1..=4 {
        assert_eq!(sim.available_ports(phys(port)), Some(CAPACITY - 1));
    }

    tasks.set(Some(TaskState::Spawning));
    adapter
        .connect_volume(sim.as_ref(), &host, &handle, &inst, &conn)
        .unwrap();
    assert!(sim.mappings(&mgmt).is_empty());
    assert_eq!(sim.mappings(&handle).len(), 4);
    assert!(adapter
        .fabric_states(&inst)
        .unwrap()
        .values()
        .all(|s| *s == FabricState::InstMapped));

    // Detaching a volume from a running VM keeps its ports.
    tasks.set(None);
    adapter
        .disconnect_volume(sim.as_ref(), &host, &handle, &inst, &conn)
        .unwrap();
    assert_eq!(sim.mappings(&handle).len(), 4);

    tasks.set(Some(TaskState::Deleting));
    adapter
        .disconnect_volume(sim.as_ref(), &host, &handle, &inst, &conn)
        .unwrap();
    assert!(sim.mappings(&handle).is_empty());
    assert!(sim.logged_in().is_empty());
    for port in 1..=4 {
        assert_eq!(sim.available_ports(phys(port)), Some(CAPACITY));
    }
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.json");
    let sim = sim_host();
    let tasks = Arc::new(FixedTask::default());
    let host = sim.host_id().clone();
    let inst = vm("vm-1");

    let first = {
        let meta = Arc::new(FileMetadataStore::open(&path).unwrap());
        let adapter = adapter(&sim, meta, &tasks);
        adapter.wwpns(sim.as_ref(), &host, &inst).unwrap()
    };

    let meta = Arc::new(FileMetadataStore::open(&path).unwrap());
    let adapter = adapter(&sim, meta, &tasks);
    let second = adapter.wwpns(sim.as_ref(), &host, &inst).unwrap();
    assert_eq!(first, second);
    assert_eq!(sim.pair_requests(), 4);
    assert!(adapter
        .fabric_states(&inst)
        .unwrap()
        .values()
        .all(|s| *s == FabricState::MgmtMapped));
}

#[test]
fn test_vms_get_distinct_ports() {
    let sim = sim_host();
    let tasks = Arc::new(FixedTask::default());
    let adapter =
        adapter(&sim, Arc::new(InMemoryMetadataStore::new()), &tasks);
    let host = sim.host_id().clone();

    let one = adapter.wwpns(sim.as_ref(), &host, &vm("vm-1")).unwrap();
    let two = adapter.wwpns(sim.as_ref(), &host, &vm("vm-2")).unwrap();
    assert!(one.iter().all(|w| !two.contains(w)));
    assert_eq!(sim.logged_in().len(), 16);

    // Each port on both servers has carried two of the eight pairs.
    for port in 1..=4 {
        assert_eq!(sim.available_ports(phys(port)), Some(CAPACITY - 2));
    }
}

#[test]
fn test_capacity_exhaustion_is_reported() {
    let sim = sim_host();
    let tasks = Arc::new(FixedTask::default());
    let adapter = NpivVolumeAdapter::new(
        fabric_config(2 * CAPACITY + 1),
        sim.clone(),
        Arc::new(InMemoryMetadataStore::new()),
        tasks,
        test_logger(),
    );
    let host = sim.host_id().clone();

    let err = adapter.wwpns(sim.as_ref(), &host, &vm("vm-1")).unwrap_err();
    assert!(matches!(err, npiv::NpivError::Derive(_)));
    assert!(sim.logged_in().is_empty());
}
