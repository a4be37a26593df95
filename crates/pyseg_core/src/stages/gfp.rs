//! Graphs, filaments and picking in a single run.
//!
//! Each program writes into its own directory under `extra`, and each one
//! reads the previous program's output table.

use super::fils::{fils_job, FilamentGeometry};
use super::picking::picking_job;
use super::{
    expect_output, file_stem, fils_output_name, picking_output_name, require_positive, to_nm,
    StageContext, StageError, StageKind, StageResult,
};
use crate::catalog::{OutputSet, SetKind};
use crate::config::{PysegAsset, TomoAcquisition};
use crate::convert::{read_picking_star, tomograms_from_star};
use crate::model::{Coordinate3D, Tomogram};
use crate::protocol::{InputStaging, OutputRegistration, Protocol, Step, StepSequence};
use crate::star::Table;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const GRAPHS_OUT: &str = "graphs";
pub const FILS_OUT: &str = "fils";
pub const PICKING_OUT: &str = "picking";

const STEP_GRAPHS: &str = "pyseg_graphs";
const STEP_FILS: &str = "pyseg_fils";
const STEP_PICKING: &str = "pyseg_picking";
const STEP_CREATE_OUTPUT: &str = "create_output";

fn one() -> f64 {
    1.0
}

fn default_v_den() -> f64 {
    0.0035
}

fn default_v_ratio() -> f64 {
    4.0
}

fn default_max_len_nm() -> f64 {
    10.0
}

fn default_peak_ns() -> f64 {
    0.5
}

fn default_threads() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GfpParams {
    /// Particles table from the pre-segmentation.
    pub in_star: PathBuf,
    /// Voxel size of the input tomograms (Å).
    #[serde(default = "one")]
    pub pixel_size: f64,
    #[serde(default)]
    pub acquisition: TomoAcquisition,
    #[serde(default = "one")]
    pub s_sig: f64,
    #[serde(default = "default_v_den")]
    pub v_den: f64,
    #[serde(default = "default_v_ratio")]
    pub v_ratio: f64,
    /// Maximum distance to the membrane, already in nm.
    #[serde(default = "default_max_len_nm")]
    pub max_len: f64,
    #[serde(flatten)]
    pub geometry: FilamentGeometry,
    #[serde(default)]
    pub peak_th: f64,
    #[serde(default = "default_peak_ns")]
    pub peak_ns: f64,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl GfpParams {
    pub fn validate(&self) -> StageResult<()> {
        require_positive("pixel_size", self.pixel_size)?;
        require_positive("max_len", self.max_len)?;
        if self.threads == 0 {
            return Err(StageError::InvalidParams(
                "`threads` must be greater than 0".to_string(),
            ));
        }
        self.geometry.validate()
    }
}

pub struct GfpStage<'a> {
    params: GfpParams,
    ctx: StageContext<'a>,
    tomograms: Option<Vec<Tomogram>>,
    coordinates: Vec<Coordinate3D>,
    warning: Option<String>,
}

impl<'a> GfpStage<'a> {
    pub fn new(params: GfpParams, ctx: StageContext<'a>) -> StageResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ctx,
            tomograms: None,
            coordinates: Vec::new(),
            warning: None,
        })
    }

    /// `extra/graphs/<in_star stem>_mb_graph.star`
    pub fn graphs_star(&self) -> PathBuf {
        self.ctx
            .extra_path(GRAPHS_OUT)
            .join(format!("{}_mb_graph.star", file_stem(&self.params.in_star)))
    }

    pub fn fils_star(&self) -> PathBuf {
        self.ctx.extra_path(FILS_OUT).join(fils_output_name(
            &self.ctx.config.asset(PysegAsset::FilsSources),
            &self.ctx.config.asset(PysegAsset::FilsTargets),
        ))
    }

    pub fn picking_star(&self) -> PathBuf {
        self.ctx
            .extra_path(PICKING_OUT)
            .join(picking_output_name(&self.fils_star()))
    }

    pub fn pyseg_graphs(&mut self) -> StageResult<()> {
        let spec = self
            .ctx
            .pyseg_job(PysegAsset::GraphsScript)
            .flag("--inStar", self.params.in_star.display())
            .flag("--outDir", self.ctx.extra_path(GRAPHS_OUT).display())
            .flag("--pixelSize", to_nm(self.params.pixel_size))
            .flag("--sSig", self.params.s_sig)
            .flag("--vDen", self.params.v_den)
            .flag("--veRatio", self.params.v_ratio)
            .flag("--maxLen", self.params.max_len)
            .flag("-j", self.params.threads);
        self.ctx.run(&spec)?;
        expect_output(self.graphs_star())?;
        Ok(())
    }

    pub fn pyseg_fils(&mut self) -> StageResult<()> {
        let spec = fils_job(
            &self.ctx,
            &self.graphs_star(),
            &self.ctx.extra_path(FILS_OUT),
            &self.ctx.config.asset(PysegAsset::FilsSources),
            &self.ctx.config.asset(PysegAsset::FilsTargets),
            &self.params.geometry,
        );
        self.ctx.run(&spec)?;
        expect_output(self.fils_star())?;
        Ok(())
    }

    /// Uses the bundled slices descriptor as is.
    pub fn pyseg_picking(&mut self) -> StageResult<()> {
        let spec = picking_job(
            &self.ctx,
            &self.fils_star(),
            &self.ctx.extra_path(PICKING_OUT),
            &self.ctx.config.asset(PysegAsset::PickingSlices),
            self.params.peak_th,
            self.params.peak_ns,
        );
        self.ctx.run(&spec)?;
        expect_output(self.picking_star())?;
        Ok(())
    }

    /// Builds the tomogram set named by the picking table, then the
    /// coordinates attached to it.
    pub fn create_output(&mut self) -> StageResult<()> {
        let table = Table::read(self.picking_star())?;
        let tomograms = tomograms_from_star(
            &table,
            self.params.pixel_size,
            self.params.acquisition,
            self.ctx.probe,
        )?;
        let converted = read_picking_star(self.picking_star(), &tomograms, true)?;
        info!(
            "event=gfp_output module=stages status=ok tomograms={} coordinates={}",
            tomograms.len(),
            converted.items.len()
        );
        self.coordinates = converted.items;
        self.warning = converted.warning;
        self.tomograms = Some(tomograms);
        Ok(())
    }
}

impl InputStaging for GfpStage<'_> {
    fn stage_inputs(&mut self) -> StageResult<()> {
        for dir in [GRAPHS_OUT, FILS_OUT, PICKING_OUT] {
            self.ctx.make_extra_dir(dir)?;
        }
        Ok(())
    }
}

impl StepSequence for GfpStage<'_> {
    fn steps(&self) -> Vec<Step> {
        vec![
            Step::new(STEP_GRAPHS),
            Step::new(STEP_FILS).after([STEP_GRAPHS]),
            Step::new(STEP_PICKING).after([STEP_FILS]),
            Step::new(STEP_CREATE_OUTPUT).after([STEP_PICKING]),
        ]
    }

    fn run_step(&mut self, name: &str) -> StageResult<()> {
        match name {
            STEP_GRAPHS => self.pyseg_graphs(),
            STEP_FILS => self.pyseg_fils(),
            STEP_PICKING => self.pyseg_picking(),
            STEP_CREATE_OUTPUT => self.create_output(),
            other => Err(StageError::UnknownStep(other.to_string())),
        }
    }
}

impl OutputRegistration for GfpStage<'_> {
    fn outputs(&self) -> Vec<OutputSet> {
        let Some(tomograms) = &self.tomograms else {
            return Vec::new();
        };
        let tomo_set = OutputSet::new(
            "tomograms",
            SetKind::Tomograms,
            self.params.pixel_size,
            tomograms,
        );
        let mut coord_set = OutputSet::new(
            "coordinates",
            SetKind::Coordinates,
            self.params.pixel_size,
            &self.coordinates,
        );
        coord_set.star_file = Some(self.picking_star());
        vec![tomo_set, coord_set]
    }

    fn summary(&self) -> Vec<String> {
        let Some(tomograms) = &self.tomograms else {
            return Vec::new();
        };
        let mut lines = vec![format!(
            "Tomograms = {}, Particles picked = {}",
            tomograms.len(),
            self.coordinates.len()
        )];
        lines.extend(self.warning.clone());
        lines
    }
}

impl Protocol for GfpStage<'_> {
    fn protocol_id(&self) -> &'static str {
        StageKind::Gfp.id()
    }
}

#[cfg(test)]
mod tests {
    use super::GfpParams;

    #[test]
    fn max_len_default_is_in_nanometres() {
        let params: GfpParams = serde_json::from_value(serde_json::json!({
            "in_star": "particles_pre.star"
        }))
        .expect("params parse");
        assert_eq!(params.pixel_size, 1.0);
        assert_eq!(params.max_len, 10.0);
        assert_eq!(params.threads, 4);
        assert_eq!(params.geometry.g_rg_eud, [1.0, 25.0]);
    }
}
