//! Routing of finished graphs, fils and picking runs to the vesicle viewer.
//!
//! # Invariants
//! - The VTI directory is always the `extra` directory of the graphs run
//!   the request descends from.
//! - Only stages with viewable outputs produce a request.

use crate::error::ErrorKind;
use crate::stages::{StageKind, EXTRA_DIR};
use log::{error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Program environment variable read by the CLI.
pub const VIEWER_PROGRAM_VAR: &str = "PYSEG_VIEWER";

/// Which stage the viewer shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerSource {
    FromGraphs,
    FromFils,
    FromPicking,
}

impl ViewerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FromGraphs => "graphs",
            Self::FromFils => "fils",
            Self::FromPicking => "picking",
        }
    }

    pub fn for_stage(kind: StageKind) -> Option<Self> {
        match kind {
            StageKind::Graphs => Some(Self::FromGraphs),
            StageKind::Fils => Some(Self::FromFils),
            StageKind::Picking => Some(Self::FromPicking),
            StageKind::Preseg | StageKind::Gfp => None,
        }
    }
}

/// Vesicles the graphs run was computed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentationInput {
    /// Vesicle crops of a pre-segmentation run.
    PresegVesicles(Vec<String>),
    /// Externally annotated tomo masks.
    TomoMasks(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualizationRequest {
    pub source: ViewerSource,
    pub vti_path: PathBuf,
    pub vesicles: Vec<String>,
    pub are_tomo_masks: bool,
}

impl VisualizationRequest {
    /// Request for a run of `kind` descending from the graphs run in
    /// `graphs_work_dir`.
    ///
    /// Picking always shows the pre-segmentation vesicles.
    pub fn for_stage(
        kind: StageKind,
        graphs_work_dir: &Path,
        input: SegmentationInput,
    ) -> Result<Self, ViewerError> {
        let source = ViewerSource::for_stage(kind).ok_or(ViewerError::NotViewable(kind))?;
        let (vesicles, are_tomo_masks) = match (source, input) {
            (_, SegmentationInput::PresegVesicles(files)) => (files, false),
            (ViewerSource::FromPicking, SegmentationInput::TomoMasks(_)) => {
                return Err(ViewerError::UnsupportedInput(
                    "picking runs can only show pre-segmented vesicles".to_string(),
                ))
            }
            (_, SegmentationInput::TomoMasks(files)) => (files, true),
        };
        if vesicles.is_empty() {
            return Err(ViewerError::NoVesicles);
        }
        Ok(Self {
            source,
            vti_path: graphs_work_dir.join(EXTRA_DIR),
            vesicles,
            are_tomo_masks,
        })
    }

    /// Viewer arguments, vesicle files last.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--source".to_string(),
            self.source.as_str().to_string(),
            "--vti-path".to_string(),
            self.vti_path.display().to_string(),
        ];
        if self.are_tomo_masks {
            args.push("--tomo-masks".to_string());
        }
        args.extend(self.vesicles.iter().cloned());
        args
    }
}

#[derive(Debug)]
pub enum ViewerError {
    NotViewable(StageKind),
    UnsupportedInput(String),
    NoVesicles,
    Launch {
        program: String,
        source: std::io::Error,
    },
}

impl ViewerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Launch { .. } => ErrorKind::ExternalProcess,
            _ => ErrorKind::Configuration,
        }
    }
}

impl Display for ViewerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotViewable(kind) => {
                write!(f, "{} runs have no viewer", kind.label())
            }
            Self::UnsupportedInput(message) => f.write_str(message),
            Self::NoVesicles => f.write_str("no vesicles to show"),
            Self::Launch { program, source } => {
                write!(f, "failed to launch viewer `{program}`: {source}")
            }
        }
    }
}

impl Error for ViewerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Launch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Opens a visualization request.
pub trait ViewerLauncher {
    fn launch(&self, request: &VisualizationRequest) -> Result<(), ViewerError>;
}

/// Spawns a desktop viewer program and returns without waiting.
#[derive(Debug, Clone)]
pub struct CommandViewerLauncher {
    program: String,
}

impl CommandViewerLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ViewerLauncher for CommandViewerLauncher {
    fn launch(&self, request: &VisualizationRequest) -> Result<(), ViewerError> {
        match Command::new(&self.program).args(request.args()).spawn() {
            Ok(child) => {
                info!(
                    "event=viewer_launch module=viewer status=ok program={} source={} vesicles={} pid={}",
                    self.program,
                    request.source.as_str(),
                    request.vesicles.len(),
                    child.id()
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    "event=viewer_launch module=viewer status=error program={} error={}",
                    self.program, source
                );
                Err(ViewerError::Launch {
                    program: self.program.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SegmentationInput, ViewerError, ViewerSource, VisualizationRequest};
    use crate::stages::StageKind;
    use std::path::Path;

    fn vesicles() -> Vec<String> {
        vec!["/w/extra/t_tid_1.mrc".to_string()]
    }

    #[test]
    fn fils_requests_read_the_graphs_extra_dir() {
        let request = VisualizationRequest::for_stage(
            StageKind::Fils,
            Path::new("/runs/graphs"),
            SegmentationInput::TomoMasks(vesicles()),
        )
        .expect("fils is viewable");
        assert_eq!(request.source, ViewerSource::FromFils);
        assert_eq!(request.vti_path, Path::new("/runs/graphs/extra"));
        assert!(request.are_tomo_masks);
        assert_eq!(
            request.args(),
            vec![
                "--source",
                "fils",
                "--vti-path",
                "/runs/graphs/extra",
                "--tomo-masks",
                "/w/extra/t_tid_1.mrc"
            ]
        );
    }

    #[test]
    fn preseg_and_gfp_are_not_viewable() {
        for kind in [StageKind::Preseg, StageKind::Gfp] {
            let err = VisualizationRequest::for_stage(
                kind,
                Path::new("/runs/graphs"),
                SegmentationInput::PresegVesicles(vesicles()),
            )
            .expect_err("no viewer");
            assert!(matches!(err, ViewerError::NotViewable(k) if k == kind));
        }
    }

    #[test]
    fn picking_rejects_tomo_masks() {
        let err = VisualizationRequest::for_stage(
            StageKind::Picking,
            Path::new("/runs/graphs"),
            SegmentationInput::TomoMasks(vesicles()),
        )
        .expect_err("picking needs preseg vesicles");
        assert!(matches!(err, ViewerError::UnsupportedInput(_)));
    }
}
