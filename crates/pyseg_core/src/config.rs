//! Plugin-level configuration.
//!
//! # Responsibility
//! - Resolve where PySeg is installed and how its environment is activated.
//! - Derive the environment variables every external job inherits.
//!
//! # Invariants
//! - Configuration is immutable once built; each invocation builds its own.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Tool name used for directory and flag-file naming.
pub const PYSEG: &str = "pyseg";
/// Default PySeg release.
pub const DEFAULT_VERSION: &str = "v1.1";
pub const DISPERSE: &str = "disperse";
pub const CFITSIO: &str = "cfitsio";
/// Conda environment created by the installation recipe.
pub const PYSEG_ENV_NAME: &str = "pySeg";

pub const PYSEG_HOME_VAR: &str = "PYSEG_HOME";
pub const PYSEG_ENV_ACTIVATION_VAR: &str = "PYSEG_ENV_ACTIVATION";
pub const CONDA_ACTIVATION_VAR: &str = "CONDA_ACTIVATION_CMD";
pub const EM_ROOT_VAR: &str = "EM_ROOT";

/// Resolved plugin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PysegConfig {
    /// Installation directory, `<em_root>/pyseg-<version>` by default.
    pub home: PathBuf,
    /// Command activating the PySeg conda environment.
    pub env_activation: String,
    /// Command making `conda` available in a non-interactive shell.
    pub conda_activation: String,
    /// Interpreter used to launch the PySeg scripts.
    pub python: String,
    pub version: String,
}

impl PysegConfig {
    /// Builds a configuration for the given installation directory.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            env_activation: format!("conda activate {PYSEG_ENV_NAME}"),
            conda_activation: String::new(),
            python: "python".to_string(),
            version: DEFAULT_VERSION.to_string(),
        }
    }

    /// Reads `PYSEG_HOME`, `PYSEG_ENV_ACTIVATION` and `CONDA_ACTIVATION_CMD`.
    ///
    /// Without `PYSEG_HOME` the home is `<EM_ROOT>/pyseg-<version>`, with
    /// `EM_ROOT` defaulting to `software/em`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`PysegConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = lookup(PYSEG_HOME_VAR)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let em_root = lookup(EM_ROOT_VAR).unwrap_or_else(|| "software/em".to_string());
                default_home(Path::new(&em_root))
            });
        let mut config = Self::new(home);
        if let Some(activation) = lookup(PYSEG_ENV_ACTIVATION_VAR) {
            config.env_activation = activation;
        }
        if let Some(conda) = lookup(CONDA_ACTIVATION_VAR) {
            config.conda_activation = conda;
        }
        config
    }

    /// Path of a file relative to the installation directory.
    pub fn home_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.home.join(relative)
    }

    /// Root of the unpacked PySeg sources.
    pub fn system_dir(&self) -> PathBuf {
        self.home
            .join(format!("pyseg_system-{}", self.version.trim_start_matches('v')))
    }

    pub fn disperse_build_dir(&self) -> PathBuf {
        disperse_build_dir(&self.home)
    }

    /// Absolute path of a bundled script or template.
    pub fn asset(&self, asset: PysegAsset) -> PathBuf {
        self.system_dir().join(asset.relative_path())
    }

    /// Shell prefix run before every PySeg program.
    pub fn activation_prefix(&self) -> String {
        let conda = self.conda_activation.trim();
        let conda = conda.trim_end_matches("&&").trim();
        if conda.is_empty() {
            self.env_activation.clone()
        } else {
            format!("{conda} && {}", self.env_activation)
        }
    }

    /// Environment overrides for PySeg jobs.
    ///
    /// `PATH` gets the DisPerSE binaries prepended to `base_path`;
    /// `PYTHONPATH` points at the PySeg code directory.
    pub fn environ(&self, base_path: Option<&str>) -> BTreeMap<String, String> {
        let bin = self.disperse_build_dir().join("bin");
        let path = match base_path {
            Some(base) if !base.is_empty() => format!("{}:{base}", bin.display()),
            _ => bin.display().to_string(),
        };
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), path);
        env.insert(
            "PYTHONPATH".to_string(),
            self.system_dir().join("code").display().to_string(),
        );
        env
    }
}

/// Files shipped inside the PySeg sources that the stages use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PysegAsset {
    PresegScript,
    GraphsScript,
    FilsScript,
    FilsSources,
    FilsTargets,
    PickingScript,
    PickingSlices,
}

impl PysegAsset {
    /// Location relative to the PySeg system directory.
    pub fn relative_path(self) -> &'static str {
        match self {
            Self::PresegScript => "data/tutorials/synth_sumb/segs/pre_tomos_seg.py",
            Self::GraphsScript => "data/tutorials/synth_sumb/graphs/mb_graph_batch.py",
            Self::FilsScript => "data/tutorials/synth_sumb/fils/mb_fils_network.py",
            Self::FilsSources => "data/tutorials/synth_sumb/fils/in/mb_sources.xml",
            Self::FilsTargets => "data/tutorials/synth_sumb/fils/in/no_mb_targets.xml",
            Self::PickingScript => "data/tutorials/synth_sumb/pick/mb_picking.py",
            Self::PickingSlices => "data/tutorials/synth_sumb/pick/in/mb_ext.xml",
        }
    }
}

/// `<em_root>/pyseg-<version>`.
pub fn default_home(em_root: &Path) -> PathBuf {
    em_root.join(format!("{PYSEG}-{DEFAULT_VERSION}"))
}

pub fn disperse_build_dir(home: &Path) -> PathBuf {
    home.join(format!("{DISPERSE}_build"))
}

/// Immutable acquisition defaults attached to imported tomograms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TomoAcquisition {
    pub angle_min: f64,
    pub angle_max: f64,
    pub step: Option<f64>,
    pub angle_axis1: Option<f64>,
    pub angle_axis2: Option<f64>,
}

impl Default for TomoAcquisition {
    fn default() -> Self {
        Self {
            angle_min: 90.0,
            angle_max: -90.0,
            step: None,
            angle_axis1: None,
            angle_axis2: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PysegAsset, PysegConfig, TomoAcquisition};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_home_under_em_root() {
        let config = PysegConfig::from_lookup(lookup(&[("EM_ROOT", "/opt/em")]));
        assert_eq!(config.home, PathBuf::from("/opt/em/pyseg-v1.1"));
        assert_eq!(config.env_activation, "conda activate pySeg");
    }

    #[test]
    fn explicit_variables_override_defaults() {
        let config = PysegConfig::from_lookup(lookup(&[
            ("PYSEG_HOME", "/data/pyseg"),
            ("PYSEG_ENV_ACTIVATION", "conda activate custom"),
            ("CONDA_ACTIVATION_CMD", ". ~/miniconda3/etc/profile.d/conda.sh &&"),
        ]));
        assert_eq!(config.home, PathBuf::from("/data/pyseg"));
        assert_eq!(
            config.activation_prefix(),
            ". ~/miniconda3/etc/profile.d/conda.sh && conda activate custom"
        );
    }

    #[test]
    fn environ_prepends_disperse_binaries() {
        let config = PysegConfig::new("/p");
        let env = config.environ(Some("/usr/bin"));
        assert_eq!(env["PATH"], "/p/disperse_build/bin:/usr/bin");
        assert_eq!(env["PYTHONPATH"], "/p/pyseg_system-1.1/code");
    }

    #[test]
    fn assets_live_under_the_system_directory() {
        let config = PysegConfig::new("/p");
        assert_eq!(
            config.asset(PysegAsset::PickingSlices),
            PathBuf::from("/p/pyseg_system-1.1/data/tutorials/synth_sumb/pick/in/mb_ext.xml")
        );
    }

    #[test]
    fn acquisition_defaults_span_full_tilt() {
        let acquisition = TomoAcquisition::default();
        assert_eq!(acquisition.angle_min, 90.0);
        assert_eq!(acquisition.angle_max, -90.0);
        assert!(acquisition.step.is_none());
    }
}
