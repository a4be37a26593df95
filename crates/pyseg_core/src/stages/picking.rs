//! Particle picking on a filament network.

use super::{
    expect_output, picking_output_name, require_positive, StageContext, StageError, StageKind,
    StageResult,
};
use crate::catalog::{OutputSet, SetKind};
use crate::config::{PysegAsset, TomoAcquisition};
use crate::convert::{read_picking_star, tomograms_from_files};
use crate::model::{Coordinate3D, Tomogram};
use crate::protocol::{InputStaging, OutputRegistration, Protocol, Step, StepSequence};
use crate::slices::{encode_preseg_area, write_picking_slices, CuttingMode, MEMBRANE_AREA, PRESEG_AREAS};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STEP_PICKING: &str = "pyseg_picking";
const STEP_CREATE_OUTPUT: &str = "create_output";

fn default_box_size() -> u32 {
    20
}

fn default_side() -> usize {
    MEMBRANE_AREA
}

fn default_peak_ns() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickingParams {
    /// Filament network table of a finished fils run.
    pub fils_star: PathBuf,
    /// Tomograms the graphs and filaments were computed on.
    pub tomograms: Vec<String>,
    pub sampling_rate: f64,
    #[serde(default)]
    pub acquisition: TomoAcquisition,
    /// Box size in pixels.
    #[serde(default = "default_box_size")]
    pub box_size: u32,
    /// Index into [`PRESEG_AREAS`].
    #[serde(default = "default_side")]
    pub side: usize,
    #[serde(default)]
    pub cont: CuttingMode,
    /// Percentile of points discarded by density.
    #[serde(default)]
    pub peak_th: f64,
    /// Minimum distance between picked points (nm).
    #[serde(default = "default_peak_ns")]
    pub peak_ns: f64,
}

impl PickingParams {
    pub fn validate(&self) -> StageResult<()> {
        if self.tomograms.is_empty() {
            return Err(StageError::InvalidParams(
                "at least one tomogram is required".to_string(),
            ));
        }
        require_positive("sampling_rate", self.sampling_rate)?;
        if self.side >= PRESEG_AREAS.len() {
            return Err(StageError::InvalidParams(format!(
                "`side` must be below {}, got {}",
                PRESEG_AREAS.len(),
                self.side
            )));
        }
        Ok(())
    }
}

pub struct PickingStage<'a> {
    params: PickingParams,
    ctx: StageContext<'a>,
    tomograms: Vec<Tomogram>,
    coordinates: Option<Vec<Coordinate3D>>,
    warning: Option<String>,
}

impl<'a> PickingStage<'a> {
    pub fn new(params: PickingParams, ctx: StageContext<'a>) -> StageResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ctx,
            tomograms: Vec::new(),
            coordinates: None,
            warning: None,
        })
    }

    /// `extra/<fils stem>_parts.star`
    pub fn picking_star(&self) -> PathBuf {
        self.ctx
            .extra_path(picking_output_name(&self.params.fils_star))
    }

    pub fn coordinates(&self) -> &[Coordinate3D] {
        self.coordinates.as_deref().unwrap_or_default()
    }

    pub fn pyseg_picking(&mut self) -> StageResult<()> {
        let out_dir = self.ctx.extra_dir();
        let slices = write_picking_slices(
            &self.ctx.config.asset(PysegAsset::PickingSlices),
            &out_dir,
            encode_preseg_area(self.params.side),
            self.params.cont,
        )?;
        let spec = picking_job(
            &self.ctx,
            &self.params.fils_star,
            &out_dir,
            &slices,
            self.params.peak_th,
            self.params.peak_ns,
        );
        self.ctx.run(&spec)?;
        expect_output(self.picking_star())?;
        Ok(())
    }

    pub fn create_output(&mut self) -> StageResult<()> {
        let converted = read_picking_star(self.picking_star(), &self.tomograms, true)?;
        info!(
            "event=picking_output module=stages status=ok coordinates={} area={}",
            converted.items.len(),
            PRESEG_AREAS[self.params.side]
        );
        self.warning = converted.warning;
        self.coordinates = Some(converted.items);
        Ok(())
    }
}

/// Picking job reading `fils_star` and writing into `out_dir`.
pub(crate) fn picking_job(
    ctx: &StageContext<'_>,
    fils_star: &Path,
    out_dir: &Path,
    slices: &Path,
    peak_th: f64,
    peak_ns: f64,
) -> crate::runner::JobSpec {
    ctx.pyseg_job(PysegAsset::PickingScript)
        .flag("--inStar", fils_star.display())
        .flag("--outDir", out_dir.display())
        .flag("--slicesFile", slices.display())
        .flag("--peakTh", peak_th)
        .flag("--peakNs", peak_ns)
}

impl InputStaging for PickingStage<'_> {
    fn stage_inputs(&mut self) -> StageResult<()> {
        self.ctx.make_extra_dir("")?;
        self.tomograms = tomograms_from_files(
            &self.params.tomograms,
            self.params.sampling_rate,
            self.params.acquisition,
            self.ctx.probe,
        )?;
        Ok(())
    }
}

impl StepSequence for PickingStage<'_> {
    fn steps(&self) -> Vec<Step> {
        vec![
            Step::new(STEP_PICKING),
            Step::new(STEP_CREATE_OUTPUT).after([STEP_PICKING]),
        ]
    }

    fn run_step(&mut self, name: &str) -> StageResult<()> {
        match name {
            STEP_PICKING => self.pyseg_picking(),
            STEP_CREATE_OUTPUT => self.create_output(),
            other => Err(StageError::UnknownStep(other.to_string())),
        }
    }
}

impl OutputRegistration for PickingStage<'_> {
    fn outputs(&self) -> Vec<OutputSet> {
        let Some(coordinates) = &self.coordinates else {
            return Vec::new();
        };
        let mut set = OutputSet::new(
            "coordinates",
            SetKind::Coordinates,
            self.params.sampling_rate,
            coordinates,
        );
        set.box_size = Some(self.params.box_size);
        set.star_file = Some(self.picking_star());
        vec![set]
    }

    fn summary(&self) -> Vec<String> {
        let Some(coordinates) = &self.coordinates else {
            return Vec::new();
        };
        let mut lines = vec![format!(
            "Picking area = {}, Particles picked = {}",
            PRESEG_AREAS[self.params.side],
            coordinates.len()
        )];
        lines.extend(self.warning.clone());
        lines
    }
}

impl Protocol for PickingStage<'_> {
    fn protocol_id(&self) -> &'static str {
        StageKind::Picking.id()
    }
}
