//! Stage orchestrators: preseg, graphs, fils, picking and the combined
//! graphs-fils-picking run.
//!
//! # Responsibility
//! - Stage inputs as star files under `<work_dir>/extra`.
//! - Build and run one PySeg program call per workflow step.
//! - Convert the resulting star tables into output sets.
//!
//! # Invariants
//! - Parameters are validated before any file is touched.
//! - A failed external call aborts the stage; nothing is retried.
//! - Stage state lives in the stage value; there are no globals.

use crate::config::{PysegAsset, PysegConfig};
use crate::convert::ConvertError;
use crate::error::ErrorKind;
use crate::mrc::{MrcError, VolumeProbe};
use crate::runner::{pyseg_job, JobRunner, JobSpec, RunError};
use crate::slices::SlicesError;
use crate::star::StarError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub mod fils;
pub mod gfp;
pub mod graphs;
pub mod picking;
pub mod preseg;

pub use fils::{FilamentGeometry, FilsParams, FilsStage, ThresholdMode};
pub use gfp::{GfpParams, GfpStage};
pub use graphs::{GraphsParams, GraphsStage};
pub use picking::{PickingParams, PickingStage};
pub use preseg::{PresegParams, PresegStage};

/// Directory under the work directory holding every staged file.
pub const EXTRA_DIR: &str = "extra";

/// The stage protocols this plugin offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Preseg,
    Graphs,
    Fils,
    Picking,
    Gfp,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        Self::Preseg,
        Self::Graphs,
        Self::Fils,
        Self::Picking,
        Self::Gfp,
    ];

    /// Registry identifier, e.g. `pyseg.preseg`.
    pub fn id(self) -> &'static str {
        match self {
            Self::Preseg => "pyseg.preseg",
            Self::Graphs => "pyseg.graphs",
            Self::Fils => "pyseg.fils",
            Self::Picking => "pyseg.picking",
            Self::Gfp => "pyseg.gfp",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Preseg => "preseg membranes",
            Self::Graphs => "graphs",
            Self::Fils => "fils",
            Self::Picking => "picking",
            Self::Gfp => "graphs-fils-picking",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }
}

/// Stage failures.
#[derive(Debug)]
pub enum StageError {
    InvalidParams(String),
    Star(StarError),
    Mrc(MrcError),
    Convert(ConvertError),
    Run(RunError),
    Slices(SlicesError),
    Io { path: PathBuf, source: std::io::Error },
    /// An external program finished without writing its expected output.
    MissingOutput(PathBuf),
    UnknownStep(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParams(_) | Self::UnknownStep(_) => ErrorKind::Configuration,
            Self::Star(err) => err.kind(),
            Self::Mrc(err) => err.kind(),
            Self::Convert(err) => err.kind(),
            Self::Run(err) => err.kind(),
            Self::Slices(err) => err.kind(),
            Self::Io { .. } | Self::MissingOutput(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Display for StageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParams(message) => write!(f, "invalid parameters: {message}"),
            Self::Star(err) => write!(f, "{err}"),
            Self::Mrc(err) => write!(f, "{err}"),
            Self::Convert(err) => write!(f, "{err}"),
            Self::Run(err) => write!(f, "{err}"),
            Self::Slices(err) => write!(f, "{err}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::MissingOutput(path) => {
                write!(f, "expected output was not produced: {}", path.display())
            }
            Self::UnknownStep(name) => write!(f, "unknown step `{name}`"),
        }
    }
}

impl Error for StageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Star(err) => Some(err),
            Self::Mrc(err) => Some(err),
            Self::Convert(err) => Some(err),
            Self::Run(err) => Some(err),
            Self::Slices(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StarError> for StageError {
    fn from(value: StarError) -> Self {
        Self::Star(value)
    }
}

impl From<MrcError> for StageError {
    fn from(value: MrcError) -> Self {
        Self::Mrc(value)
    }
}

impl From<ConvertError> for StageError {
    fn from(value: ConvertError) -> Self {
        Self::Convert(value)
    }
}

impl From<RunError> for StageError {
    fn from(value: RunError) -> Self {
        Self::Run(value)
    }
}

impl From<SlicesError> for StageError {
    fn from(value: SlicesError) -> Self {
        Self::Slices(value)
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Everything a stage needs besides its parameters.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub work_dir: &'a Path,
    pub config: &'a PysegConfig,
    pub runner: &'a dyn JobRunner,
    pub probe: &'a dyn VolumeProbe,
}

impl<'a> StageContext<'a> {
    pub fn new(
        work_dir: &'a Path,
        config: &'a PysegConfig,
        runner: &'a dyn JobRunner,
        probe: &'a dyn VolumeProbe,
    ) -> Self {
        Self {
            work_dir,
            config,
            runner,
            probe,
        }
    }

    pub fn extra_dir(&self) -> PathBuf {
        self.work_dir.join(EXTRA_DIR)
    }

    pub fn extra_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.extra_dir().join(relative)
    }

    /// Creates `<work_dir>/extra` and any nested directories given.
    pub fn make_extra_dir(&self, relative: impl AsRef<Path>) -> StageResult<PathBuf> {
        let dir = self.extra_path(relative);
        std::fs::create_dir_all(&dir).map_err(StageError::io(&dir))?;
        Ok(dir)
    }

    /// PySeg python call for `script`, ready for stage flags.
    pub fn pyseg_job(&self, script: PysegAsset) -> JobSpec {
        pyseg_job(self.config, self.config.asset(script))
    }

    pub fn run(&self, spec: &JobSpec) -> StageResult<()> {
        self.runner.run_job(spec).map_err(StageError::from)
    }
}

/// Angstrom to nanometre.
pub(crate) fn to_nm(angstrom: f64) -> f64 {
    angstrom / 10.0
}

/// `-1` disables a PySeg option and is passed through unconverted.
pub(crate) fn to_nm_unless_disabled(angstrom: f64) -> f64 {
    if angstrom == -1.0 {
        angstrom
    } else {
        to_nm(angstrom)
    }
}

pub(crate) fn require_positive(name: &str, value: f64) -> StageResult<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(StageError::InvalidParams(format!(
            "`{name}` must be greater than 0, got {value}"
        )))
    }
}

/// Fails with [`StageError::MissingOutput`] unless `path` exists.
pub(crate) fn expect_output(path: PathBuf) -> StageResult<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(StageError::MissingOutput(path))
    }
}

/// `fil_<sources stem>_to_<targets stem>_net.star`
pub fn fils_output_name(sources: &Path, targets: &Path) -> String {
    format!("fil_{}_to_{}_net.star", file_stem(sources), file_stem(targets))
}

/// `<fils stem>_parts.star`
pub fn picking_output_name(fils_star: &Path) -> String {
    format!("{}_parts.star", file_stem(fils_star))
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{fils_output_name, picking_output_name, to_nm_unless_disabled, StageKind};
    use std::path::Path;

    #[test]
    fn output_names_follow_the_pyseg_convention() {
        let fils = fils_output_name(
            Path::new("/x/in/mb_sources.xml"),
            Path::new("/x/in/no_mb_targets.xml"),
        );
        assert_eq!(fils, "fil_mb_sources_to_no_mb_targets_net.star");
        assert_eq!(
            picking_output_name(Path::new(&fils)),
            "fil_mb_sources_to_no_mb_targets_net_parts.star"
        );
    }

    #[test]
    fn disabled_values_are_not_converted() {
        assert_eq!(to_nm_unless_disabled(-1.0), -1.0);
        assert_eq!(to_nm_unless_disabled(20.0), 2.0);
    }

    #[test]
    fn stage_ids_round_trip() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(StageKind::from_id("pyseg.unknown"), None);
    }
}
