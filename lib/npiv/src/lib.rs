// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of NPIV virtual Fibre Channel ports for VMs.
//!
//! The entry point is [`NpivVolumeAdapter`], which the host framework calls
//! when building a VM's volume connector and when attaching or detaching its
//! volumes.

pub mod config;
pub mod error;
pub mod mapping;
pub mod mgmt;
pub mod pool;
pub mod sim;
pub mod store;
pub mod volume;

pub use config::{ConfigError, FabricConfig};
pub use error::NpivError;
pub use volume::{ConnectionData, ConnectionInfo, NpivVolumeAdapter};
