//! Filament network extraction from the merged membrane graphs.

use super::{
    expect_output, fils_output_name, StageContext, StageError, StageKind, StageResult,
};
use crate::catalog::OutputSet;
use crate::config::PysegAsset;
use crate::protocol::{InputStaging, OutputRegistration, Protocol, Step, StepSequence};
use crate::runner::JobSpec;
use crate::star::merge_star_files;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MERGED_GRAPHS_STAR: &str = "mb_graphs_merged.star";
const STEP_MERGE: &str = "merge_graphs";
const STEP_FILS: &str = "pyseg_fils";

/// Filament orientation with respect to the membrane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    #[default]
    In,
    Out,
}

impl ThresholdMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

fn default_eud() -> [f64; 2] {
    [1.0, 25.0]
}

fn default_len() -> [f64; 2] {
    [1.0, 60.0]
}

fn default_sin() -> [f64; 2] {
    [0.0, 3.0]
}

/// Source-target filament filters, `[min, max]` each.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilamentGeometry {
    #[serde(default)]
    pub th_mode: ThresholdMode,
    /// Euclidean distance between source and target vertices (nm).
    #[serde(default = "default_eud")]
    pub g_rg_eud: [f64; 2],
    /// Geodesic distance through the graph (nm).
    #[serde(default = "default_len")]
    pub g_rg_len: [f64; 2],
    /// Sinuosity, geodesic over euclidean distance.
    #[serde(default = "default_sin")]
    pub g_rg_sin: [f64; 2],
}

impl Default for FilamentGeometry {
    fn default() -> Self {
        Self {
            th_mode: ThresholdMode::default(),
            g_rg_eud: default_eud(),
            g_rg_len: default_len(),
            g_rg_sin: default_sin(),
        }
    }
}

impl FilamentGeometry {
    pub fn validate(&self) -> StageResult<()> {
        for (name, [low, high]) in [
            ("g_rg_eud", self.g_rg_eud),
            ("g_rg_len", self.g_rg_len),
            ("g_rg_sin", self.g_rg_sin),
        ] {
            if low > high {
                return Err(StageError::InvalidParams(format!(
                    "`{name}` range is reversed: [{low}, {high}]"
                )));
            }
        }
        Ok(())
    }
}

/// Filaments job reading `in_star` and writing into `out_dir`.
pub(crate) fn fils_job(
    ctx: &StageContext<'_>,
    in_star: &Path,
    out_dir: &Path,
    sources: &Path,
    targets: &Path,
    geometry: &FilamentGeometry,
) -> JobSpec {
    ctx.pyseg_job(PysegAsset::FilsScript)
        .flag("--inStar", in_star.display())
        .flag("--outDir", out_dir.display())
        .flag("--inSources", sources.display())
        .flag("--inTargets", targets.display())
        .flag("--thMode", geometry.th_mode.as_str())
        .flag_values("--gRgLen", &geometry.g_rg_len)
        .flag_values("--gRgSin", &geometry.g_rg_sin)
        .flag_values("--gRgEud", &geometry.g_rg_eud)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilsParams {
    /// Graph tables of a finished graphs run, in package order.
    pub graph_stars: Vec<PathBuf>,
    /// Sources descriptor; the bundled one when absent.
    #[serde(default)]
    pub sources: Option<PathBuf>,
    /// Targets descriptor; the bundled one when absent.
    #[serde(default)]
    pub targets: Option<PathBuf>,
    #[serde(flatten)]
    pub geometry: FilamentGeometry,
}

impl FilsParams {
    pub fn validate(&self) -> StageResult<()> {
        if self.graph_stars.is_empty() {
            return Err(StageError::InvalidParams(
                "at least one graph star file is required".to_string(),
            ));
        }
        self.geometry.validate()
    }
}

pub struct FilsStage<'a> {
    params: FilsParams,
    ctx: StageContext<'a>,
    sources: PathBuf,
    targets: PathBuf,
    net_star: Option<PathBuf>,
}

impl<'a> FilsStage<'a> {
    pub fn new(params: FilsParams, ctx: StageContext<'a>) -> StageResult<Self> {
        params.validate()?;
        let sources = params
            .sources
            .clone()
            .unwrap_or_else(|| ctx.config.asset(PysegAsset::FilsSources));
        let targets = params
            .targets
            .clone()
            .unwrap_or_else(|| ctx.config.asset(PysegAsset::FilsTargets));
        Ok(Self {
            params,
            ctx,
            sources,
            targets,
            net_star: None,
        })
    }

    pub fn merged_star(&self) -> PathBuf {
        self.ctx.extra_path(MERGED_GRAPHS_STAR)
    }

    /// Filament network table, `extra/fil_<src>_to_<tgt>_net.star`.
    pub fn net_star(&self) -> PathBuf {
        self.ctx
            .extra_path(fils_output_name(&self.sources, &self.targets))
    }

    pub fn merge_graphs(&mut self) -> StageResult<()> {
        merge_star_files(&self.params.graph_stars, self.merged_star())?;
        Ok(())
    }

    pub fn pyseg_fils(&mut self) -> StageResult<()> {
        let spec = fils_job(
            &self.ctx,
            &self.merged_star(),
            &self.ctx.extra_dir(),
            &self.sources,
            &self.targets,
            &self.params.geometry,
        );
        self.ctx.run(&spec)?;
        self.net_star = Some(expect_output(self.net_star())?);
        Ok(())
    }
}

impl InputStaging for FilsStage<'_> {
    fn stage_inputs(&mut self) -> StageResult<()> {
        self.ctx.make_extra_dir("")?;
        Ok(())
    }
}

impl StepSequence for FilsStage<'_> {
    fn steps(&self) -> Vec<Step> {
        vec![
            Step::new(STEP_MERGE),
            Step::new(STEP_FILS).after([STEP_MERGE]),
        ]
    }

    fn run_step(&mut self, name: &str) -> StageResult<()> {
        match name {
            STEP_MERGE => self.merge_graphs(),
            STEP_FILS => self.pyseg_fils(),
            other => Err(StageError::UnknownStep(other.to_string())),
        }
    }
}

impl OutputRegistration for FilsStage<'_> {
    fn outputs(&self) -> Vec<OutputSet> {
        Vec::new()
    }

    fn summary(&self) -> Vec<String> {
        self.net_star
            .iter()
            .map(|path| format!("Filament network written to {}", path.display()))
            .collect()
    }
}

impl Protocol for FilsStage<'_> {
    fn protocol_id(&self) -> &'static str {
        StageKind::Fils.id()
    }
}

#[cfg(test)]
mod tests {
    use super::{FilamentGeometry, FilsParams, ThresholdMode};

    #[test]
    fn geometry_defaults_match_pyseg_tutorial() {
        let params: FilsParams = serde_json::from_value(serde_json::json!({
            "graph_stars": ["extra/out_stars/graphs_001.star"],
            "th_mode": "out"
        }))
        .expect("params parse");
        assert_eq!(params.geometry.th_mode, ThresholdMode::Out);
        assert_eq!(params.geometry.g_rg_eud, [1.0, 25.0]);
        assert_eq!(params.geometry.g_rg_len, [1.0, 60.0]);
        assert_eq!(params.geometry.g_rg_sin, [0.0, 3.0]);
        assert!(params.sources.is_none());
    }

    #[test]
    fn reversed_range_is_rejected() {
        let geometry = FilamentGeometry {
            g_rg_len: [60.0, 1.0],
            ..FilamentGeometry::default()
        };
        assert!(geometry.validate().is_err());
    }
}
