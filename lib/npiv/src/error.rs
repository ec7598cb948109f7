// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::config::ConfigError;
use crate::mapping::DeriveError;
use crate::store::StoreError;

/// Errors returned by the NPIV volume adapter.
///
/// None of these are retried internally. Fabrics processed before the failure
/// keep whatever state they had committed; the caller is expected to retry the
/// whole operation, which is idempotent for fabrics that already completed.
#[derive(Debug, Error)]
pub enum NpivError {
    #[error("invalid NPIV configuration")]
    Config(#[from] ConfigError),

    /// A call into the hypervisor management layer failed.
    #[error("management call failed: {op}")]
    Provisioning {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("could not derive NPIV port mapping")]
    Derive(#[from] DeriveError),

    #[error("fabric state store failure")]
    Store(#[from] StoreError),

    /// `connect_volume` ran before `wwpns` provisioned the fabric.
    #[error("no port map is stored for fabric {fabric}")]
    MissingPortMap { fabric: String },
}

impl NpivError {
    pub(crate) fn provisioning(
        op: &'static str,
    ) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| NpivError::Provisioning { op, source }
    }
}
