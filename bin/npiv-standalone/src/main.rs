// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use npiv::mgmt::{OwnerHandle, TaskStateOracle, VmInstance};
use npiv::sim::{SimState, SimulatedHost};
use npiv::store::{encode_legacy, FileMetadataStore};
use npiv::{ConnectionInfo, FabricConfig, NpivVolumeAdapter};
use npiv_types::TaskState;
use slog::{info, o, Drain, Logger};
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const HOST_FILE: &str = "host.json";

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Provisions NPIV virtual Fibre Channel ports for VMs on a simulated host
struct Opt {
    /// Fabric and host configuration file
    #[clap(long, action)]
    config: PathBuf,

    /// Directory holding VM metadata and the simulated host's state
    #[clap(long, action)]
    state_dir: PathBuf,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the VM's virtual WWPNs, provisioning them if needed
    Wwpns {
        #[clap(action)]
        vm: String,
    },

    /// Map the VM's virtual ports to the VM
    Connect {
        #[clap(action)]
        vm: String,

        /// JSON connection info supplied by the storage backend
        #[clap(long, action)]
        connection_info: Option<PathBuf>,
    },

    /// Remove the VM's virtual port mappings
    Disconnect {
        #[clap(action)]
        vm: String,

        /// Lifecycle task the VM is going through, e.g. "deleting"
        #[clap(long, action)]
        task: Option<TaskState>,

        /// JSON connection info supplied by the storage backend
        #[clap(long, action)]
        connection_info: Option<PathBuf>,
    },

    /// Print each fabric's state and port map
    Show {
        #[clap(action)]
        vm: String,
    },
}

/// Reports the task given on the command line for every VM.
struct FixedTask(Option<TaskState>);

impl TaskStateOracle for FixedTask {
    fn current_task(&self, _vm: &VmInstance) -> Option<TaskState> {
        self.0.clone()
    }
}

fn build_logger(level: slog::Level) -> (Logger, slog_async::AsyncGuard) {
    let (drain, guard) = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_with_guard()
    } else {
        let drain = slog_bunyan::with_name("npiv-standalone", std::io::stderr())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_with_guard()
    };

    let drain = slog::LevelFilter::new(drain, level).fuse();
    (Logger::root(drain, o!()), guard)
}

/// VM records are keyed by a UUID derived from the name, so that separate
/// invocations address the same VM.
fn vm_instance(name: String) -> VmInstance {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
    VmInstance { uuid, name }
}

fn load_host_state(path: &Path) -> anyhow::Result<Option<SimState>> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .with_context(|| format!("parsing host state {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e)
            .with_context(|| format!("reading host state {}", path.display())),
    }
}

fn save_host_state(path: &Path, state: &SimState) -> anyhow::Result<()> {
    let raw = serde_json::to_vec_pretty(state)?;
    fs::write(path, raw)
        .with_context(|| format!("writing host state {}", path.display()))
}

fn read_connection_info(path: Option<&Path>) -> anyhow::Result<ConnectionInfo> {
    let Some(path) = path else {
        return Ok(ConnectionInfo::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing connection info {}", path.display()))
}

fn run(
    adapter: &NpivVolumeAdapter,
    sim: &SimulatedHost,
    cmd: Command,
    log: &Logger,
) -> anyhow::Result<()> {
    let host = sim.host_id();
    match cmd {
        Command::Wwpns { vm } => {
            let vm = vm_instance(vm);
            for wwpn in adapter.wwpns(sim, host, &vm)? {
                println!("{wwpn}");
            }
        }
        Command::Connect { vm, connection_info } => {
            let vm = vm_instance(vm);
            let conn = read_connection_info(connection_info.as_deref())?;
            let handle = OwnerHandle(adapter.host_name(&vm));
            adapter.connect_volume(sim, host, &handle, &vm, &conn)?;
            info!(log, "connected VM"; "vm" => &vm.name);
        }
        Command::Disconnect { vm, connection_info, .. } => {
            let vm = vm_instance(vm);
            let conn = read_connection_info(connection_info.as_deref())?;
            let handle = OwnerHandle(adapter.host_name(&vm));
            adapter.disconnect_volume(sim, host, &handle, &vm, &conn)?;
            info!(log, "disconnected VM"; "vm" => &vm.name);
        }
        Command::Show { vm } => {
            let vm = vm_instance(vm);
            println!("{} ({})", vm.name, vm.uuid);
            let states = adapter.fabric_states(&vm)?;
            let mut port_maps = adapter.port_maps(&vm)?;
            for (fabric, state) in states {
                let triples = port_maps
                    .remove(&fabric)
                    .flatten()
                    .map(|map| encode_legacy(&map))
                    .unwrap_or_else(|| "-".to_string());
                println!("{fabric}: {state} {triples}");
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let (log, _log_async_guard) = build_logger(opt.log_level);

    let cfg = npiv_config_toml::parse(&opt.config)
        .with_context(|| format!("loading {}", opt.config.display()))?;
    let fabrics = FabricConfig::from_toml(&cfg)
        .context("validating fabric configuration")?;

    fs::create_dir_all(&opt.state_dir).with_context(|| {
        format!("creating state directory {}", opt.state_dir.display())
    })?;
    let host_path = opt.state_dir.join(HOST_FILE);
    let sim = Arc::new(SimulatedHost::from_config(
        &cfg,
        load_host_state(&host_path)?,
        log.clone(),
    )?);
    let meta =
        Arc::new(FileMetadataStore::open(opt.state_dir.join(METADATA_FILE))?);

    let task = match &opt.cmd {
        Command::Disconnect { task, .. } => task.clone(),
        _ => None,
    };
    let adapter = NpivVolumeAdapter::new(
        fabrics,
        sim.clone(),
        meta,
        Arc::new(FixedTask(task)),
        log.clone(),
    );

    // Earlier fabrics may have changed the host before a failure.
    let result = run(&adapter, &sim, opt.cmd, &log);
    save_host_state(&host_path, &sim.snapshot())?;
    result
}
