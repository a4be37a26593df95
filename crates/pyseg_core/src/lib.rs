//! Core logic of the PySeg workflow bridge.
//! Star tables, conversions, stage orchestration and the output catalog
//! live here; the CLI only wires them together.

pub mod catalog;
pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod install;
pub mod logging;
pub mod model;
pub mod mrc;
pub mod protocol;
pub mod runner;
pub mod slices;
pub mod stages;
pub mod star;
pub mod transform;
pub mod viewer;

pub use catalog::{CatalogError, OutputCatalog, OutputSet, RunStatus, SetKind};
pub use config::{PysegAsset, PysegConfig, TomoAcquisition};
pub use convert::{read_particles_star, ConvertError, Particles, ReadContext, StarKind};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use error::ErrorKind;
pub use install::{define_binaries, InstallError, InstallPackage};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{Coordinate3D, SubTomogram, TomoMask, Tomogram};
pub use mrc::{MrcHeaderProbe, VolumeDims, VolumeProbe};
pub use protocol::{run_and_record, run_protocol, Protocol, ProtocolError, ProtocolRegistry};
pub use runner::{JobRunner, JobSpec, ProcessRunner, RunError};
pub use stages::{StageContext, StageError, StageKind};
pub use star::{StarError, StarValue, Table};
pub use transform::transform_from_row;
pub use viewer::{CommandViewerLauncher, ViewerError, ViewerLauncher, VisualizationRequest};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
