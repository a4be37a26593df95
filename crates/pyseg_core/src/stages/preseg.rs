//! Membrane pre-segmentation.
//!
//! Runs the PySeg pre-segmentation twice: once on the annotated masks to
//! crop every vesicle, and once more on the vesicles re-centred inside
//! their tomograms. The second pass is pruned before outputs are built.
//!
//! # Invariants
//! - A segmentation whose extent equals its tomogram's is dropped.
//! - With `min_xy` or `min_depth` set, smaller segmentations are dropped.
//! - Dropping a segmentation deletes `<x>_seg.mrc` and its crop `<x>.mrc`.

use super::{
    expect_output, require_positive, to_nm, to_nm_unless_disabled, StageContext, StageError,
    StageKind, StageResult,
};
use crate::catalog::{OutputSet, SetKind};
use crate::config::PysegAsset;
use crate::model::{remove_base_ext, vesicle_id_from_subtomo_name, SubTomogram, TomoMask};
use crate::mrc::{read_label_values, VolumeDims};
use crate::protocol::{InputStaging, OutputRegistration, Protocol, Step, StepSequence};
use crate::runner::JobSpec;
use crate::star::labels::{
    PYSEG_LABEL, PYSEG_OFFSET_X, PYSEG_OFFSET_Y, PYSEG_OFFSET_Z, PYSEG_PSI, PYSEG_ROT,
    PYSEG_TILT, NOT_FOUND, RLN_ORIGIN_X, RLN_ORIGIN_Y, RLN_ORIGIN_Z, SEGMENTATION, TOMOGRAM,
    VESICLE,
};
use crate::star::{StarValue, Table};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const IN_STAR: &str = "inStar.star";
const CENTERED_STAR: &str = "presegVesiclesCentered.star";
const RESULTS_STAR: &str = "presegResults.star";
const PRE_STAR_SUFFIX: &str = "_pre.star";

const STEP_CONVERT_INPUT: &str = "convert_input";
const STEP_PRESEG: &str = "preseg";
const STEP_CENTER: &str = "membrane_center";
const STEP_PRESEG_CENTERED: &str = "preseg_centered";
const STEP_CREATE_OUTPUT: &str = "create_output";

fn default_offset_voxels() -> i64 {
    1
}

fn disabled() -> i64 {
    -1
}

fn default_membrane_thickness() -> f64 {
    40.0
}

/// Pre-segmentation parameters. Lengths are in angstroms unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresegParams {
    /// Annotated segmentations; `vol_name` is the tomogram they annotate.
    pub tomo_masks: Vec<TomoMask>,
    /// Margin in voxels around each cropped vesicle.
    #[serde(default = "default_offset_voxels")]
    pub sp_off_voxels: i64,
    /// Density threshold, `-1` to disable.
    #[serde(default = "disabled")]
    pub sg_threshold: i64,
    /// Minimum component size in voxels, `-1` to disable.
    #[serde(default = "disabled")]
    pub sg_size_threshold: i64,
    /// Full membrane thickness; PySeg receives half of it.
    #[serde(default = "default_membrane_thickness")]
    pub sg_memb_thk: f64,
    /// Neighbourhood kept on each side of the membrane.
    pub sg_memb_neigh: f64,
    /// Minimum width and height in pixels, `-1` to disable.
    #[serde(default = "disabled")]
    pub min_xy: i64,
    /// Minimum depth in pixels, `-1` to disable.
    #[serde(default = "disabled")]
    pub min_depth: i64,
}

impl PresegParams {
    pub fn validate(&self) -> StageResult<()> {
        if self.tomo_masks.is_empty() {
            return Err(StageError::InvalidParams(
                "at least one tomo mask is required".to_string(),
            ));
        }
        if self.sp_off_voxels <= 0 {
            return Err(StageError::InvalidParams(format!(
                "`sp_off_voxels` must be greater than 0, got {}",
                self.sp_off_voxels
            )));
        }
        require_positive("sg_memb_thk", self.sg_memb_thk)?;
        require_positive("sg_memb_neigh", self.sg_memb_neigh)?;
        require_positive("sampling_rate", self.sampling_rate())
    }

    /// Sampling rate of the first mask; the set shares one rate.
    pub fn sampling_rate(&self) -> f64 {
        self.tomo_masks.first().map_or(0.0, |mask| mask.sampling_rate)
    }
}

/// Outputs of a finished pre-segmentation.
#[derive(Debug, Clone, Default)]
pub struct PresegOutputs {
    pub segmentations: Vec<TomoMask>,
    pub vesicles: Vec<SubTomogram>,
    pub results_star: PathBuf,
    pub removed: usize,
}

pub struct PresegStage<'a> {
    params: PresegParams,
    ctx: StageContext<'a>,
    /// Tomogram each mask refers to after MRC conversion.
    tomograms: Vec<String>,
    outputs: Option<PresegOutputs>,
}

impl<'a> PresegStage<'a> {
    pub fn new(params: PresegParams, ctx: StageContext<'a>) -> StageResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ctx,
            tomograms: Vec::new(),
            outputs: None,
        })
    }

    pub fn in_star(&self) -> PathBuf {
        self.ctx.extra_path(IN_STAR)
    }

    pub fn centered_star(&self) -> PathBuf {
        self.ctx.extra_path(CENTERED_STAR)
    }

    /// Star written by the PySeg program for input `in_star`.
    pub fn preseg_output_file(&self, in_star: &Path) -> PathBuf {
        self.ctx.extra_path(format!(
            "{}{PRE_STAR_SUFFIX}",
            remove_base_ext(&in_star.to_string_lossy())
        ))
    }

    /// Star the graphs stage consumes.
    pub fn graphs_input_star(&self) -> PathBuf {
        self.preseg_output_file(&self.centered_star())
    }

    pub fn outputs(&self) -> Option<&PresegOutputs> {
        self.outputs.as_ref()
    }

    /// Writes `inStar.star`: one row per mask and material.
    ///
    /// Tomograms not stored as MRC are converted first.
    pub fn convert_input(&mut self) -> StageResult<()> {
        let mut table = Table::new([TOMOGRAM, VESICLE, PYSEG_LABEL, SEGMENTATION]);
        self.tomograms.clear();
        for mask in &self.params.tomo_masks {
            let tomogram = if mask.vol_name.ends_with(".mrc") {
                mask.vol_name.clone()
            } else {
                let mrc = self
                    .ctx
                    .extra_path(format!("{}.mrc", remove_base_ext(&mask.vol_name)));
                let spec = JobSpec::new("xmipp_image_convert")
                    .flag("-i", &mask.vol_name)
                    .flag("-o", mrc.display())
                    .flag("-t", "vol");
                self.ctx.run(&spec)?;
                mrc.display().to_string()
            };

            for material in materials_list(Path::new(&mask.file_name))? {
                table.add_row(vec![
                    StarValue::from(tomogram.as_str()),
                    StarValue::from(mask.file_name.as_str()),
                    material,
                    StarValue::from(mask.file_name.as_str()),
                ])?;
            }
            self.tomograms.push(tomogram);
        }
        table.write(self.in_star())?;
        Ok(())
    }

    fn preseg_job(&self, in_star: &Path) -> JobSpec {
        self.ctx
            .pyseg_job(PysegAsset::PresegScript)
            .flag("--inStar", in_star.display())
            .flag("--outDir", self.ctx.extra_dir().display())
            .flag("--spOffVoxels", self.params.sp_off_voxels)
            .flag("--sgVoxelSize", to_nm(self.params.sampling_rate()))
            .flag("--sgThreshold", self.params.sg_threshold)
            .flag("--sgSizeThreshold", self.params.sg_size_threshold)
            .flag(
                "--sgMembThk",
                to_nm_unless_disabled(self.params.sg_memb_thk / 2.0),
            )
            .flag("--sgMembNeigh", to_nm_unless_disabled(self.params.sg_memb_neigh))
    }

    pub fn preseg(&mut self) -> StageResult<()> {
        let in_star = self.in_star();
        self.ctx.run(&self.preseg_job(&in_star))?;
        expect_output(self.preseg_output_file(&in_star))?;
        Ok(())
    }

    /// Writes the centred table: vesicle offset plus half its extent.
    pub fn membrane_center(&mut self) -> StageResult<()> {
        let init = Table::read(self.in_star())?;
        let preseg = Table::read(self.preseg_output_file(&self.in_star()))?;

        let mut centered = Table::new([
            TOMOGRAM,
            VESICLE,
            PYSEG_LABEL,
            SEGMENTATION,
            RLN_ORIGIN_X,
            RLN_ORIGIN_Y,
            RLN_ORIGIN_Z,
        ]);
        for (row, pre_row) in init.iter().zip(preseg.iter()) {
            let vesicle = row.text(VESICLE);
            let segmentation = pre_row.text(SEGMENTATION);
            let dims = self.ctx.probe.dimensions(Path::new(&*segmentation))?;
            let (x, y, z) = dims.xyz();
            centered.add_row(vec![
                StarValue::from(&*row.text(TOMOGRAM)),
                StarValue::from(&*vesicle),
                row.get(PYSEG_LABEL)
                    .cloned()
                    .unwrap_or_else(|| StarValue::from(NOT_FOUND)),
                StarValue::from(&*vesicle),
                StarValue::from(pre_row.float_or(PYSEG_OFFSET_X, 0.0) + f64::from(x) / 2.0),
                StarValue::from(pre_row.float_or(PYSEG_OFFSET_Y, 0.0) + f64::from(y) / 2.0),
                StarValue::from(pre_row.float_or(PYSEG_OFFSET_Z, 0.0) + f64::from(z) / 2.0),
            ])?;
        }
        centered.write(self.centered_star())?;
        Ok(())
    }

    pub fn preseg_centered(&mut self) -> StageResult<()> {
        let in_star = self.centered_star();
        self.ctx.run(&self.preseg_job(&in_star))?;
        expect_output(self.preseg_output_file(&in_star))?;
        Ok(())
    }

    /// Prunes degenerate segmentations and builds the output sets.
    pub fn create_output(&mut self) -> StageResult<()> {
        let sampling_rate = self.params.sampling_rate();
        let final_table = Table::read(self.graphs_input_star())?;
        let mut results = Table::new([
            TOMOGRAM,
            VESICLE,
            SEGMENTATION,
            PYSEG_ROT,
            PYSEG_TILT,
            PYSEG_PSI,
            PYSEG_OFFSET_X,
            PYSEG_OFFSET_Y,
            PYSEG_OFFSET_Z,
        ]);
        let mut outputs = PresegOutputs {
            results_star: self.ctx.extra_path(RESULTS_STAR),
            ..PresegOutputs::default()
        };

        for row in final_table.iter() {
            let tomogram = row.text(TOMOGRAM);
            let vesicle = row.text(VESICLE);
            let segmentation = row.text(SEGMENTATION);
            let tomo_dims = self.ctx.probe.dimensions(Path::new(&*tomogram))?;
            let dims = self.ctx.probe.dimensions(Path::new(&*vesicle))?;

            if let Some(reason) =
                prune_reason(dims, tomo_dims, self.params.min_xy, self.params.min_depth)
            {
                remove_vesicle_files(Path::new(&*segmentation))?;
                let (x, y, z) = dims.xyz();
                info!(
                    "event=preseg_prune module=stages status=ok reason={} file={} size={}x{}x{}",
                    reason, segmentation, x, y, z
                );
                outputs.removed += 1;
                continue;
            }

            let class_id = vesicle_id_from_subtomo_name(&vesicle).parse::<i64>().ok();
            outputs.segmentations.push(TomoMask {
                file_name: segmentation.to_string(),
                vol_name: vesicle.to_string(),
                class_id,
                sampling_rate,
            });
            let mut subtomo = SubTomogram::new(vesicle.to_string(), tomogram.to_string(), sampling_rate);
            subtomo.class_id = class_id;
            outputs.vesicles.push(subtomo);
            results.append_row(&row);
        }

        results.write(&outputs.results_star)?;
        info!(
            "event=preseg_output module=stages status=ok vesicles={} removed={}",
            outputs.vesicles.len(),
            outputs.removed
        );
        self.outputs = Some(outputs);
        Ok(())
    }
}

/// Why a segmentation of extent `dims` inside a tomogram of extent
/// `tomo_dims` is dropped, if it is.
pub fn prune_reason(
    dims: VolumeDims,
    tomo_dims: VolumeDims,
    min_xy: i64,
    min_depth: i64,
) -> Option<&'static str> {
    if dims.xyz() == tomo_dims.xyz() {
        return Some("whole_tomogram");
    }
    if min_xy > 0 || min_depth > 0 {
        let (x, y, z) = dims.xyz();
        let (x, y, z) = (i64::from(x), i64::from(y), i64::from(z));
        if x < min_xy || y < min_xy || z < min_depth {
            return Some("below_min_size");
        }
    }
    None
}

/// Deletes a segmentation and the un-segmented crop next to it.
pub fn remove_vesicle_files(segmentation: &Path) -> StageResult<()> {
    std::fs::remove_file(segmentation).map_err(StageError::io(segmentation))?;
    let crop = PathBuf::from(
        segmentation
            .to_string_lossy()
            .replace("_seg.mrc", ".mrc"),
    );
    if crop != segmentation {
        std::fs::remove_file(&crop).map_err(StageError::io(&crop))?;
    }
    Ok(())
}

/// Material indices annotated for `vesicle`.
///
/// Read from `<vesicle stem>.txt` (`"i1,i2,...\n"`, duplicates collapsed)
/// when present, otherwise from the distinct values of the label volume.
pub fn materials_list(vesicle: &Path) -> StageResult<Vec<StarValue>> {
    let materials_file = vesicle.with_extension("txt");
    if materials_file.exists() {
        info!(
            "event=preseg_materials module=stages status=ok source=file file={}",
            materials_file.display()
        );
        let text =
            std::fs::read_to_string(&materials_file).map_err(StageError::io(&materials_file))?;
        let unique: BTreeSet<&str> = text
            .split([',', '\n', '\r'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .collect();
        let mut values: Vec<StarValue> = unique.into_iter().map(StarValue::parse).collect();
        values.sort_by(|a, b| match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => a.to_string().cmp(&b.to_string()),
        });
        return Ok(values);
    }

    let values = read_label_values(vesicle)?;
    info!(
        "event=preseg_materials module=stages status=ok source=volume file={} count={}",
        vesicle.display(),
        values.len()
    );
    Ok(values.into_iter().map(StarValue::Int).collect())
}

impl InputStaging for PresegStage<'_> {
    fn stage_inputs(&mut self) -> StageResult<()> {
        self.ctx.make_extra_dir("")?;
        Ok(())
    }
}

impl StepSequence for PresegStage<'_> {
    fn steps(&self) -> Vec<Step> {
        vec![
            Step::new(STEP_CONVERT_INPUT),
            Step::new(STEP_PRESEG).after([STEP_CONVERT_INPUT]),
            Step::new(STEP_CENTER).after([STEP_PRESEG]),
            Step::new(STEP_PRESEG_CENTERED).after([STEP_CENTER]),
            Step::new(STEP_CREATE_OUTPUT).after([STEP_PRESEG_CENTERED]),
        ]
    }

    fn run_step(&mut self, name: &str) -> StageResult<()> {
        match name {
            STEP_CONVERT_INPUT => self.convert_input(),
            STEP_PRESEG => self.preseg(),
            STEP_CENTER => self.membrane_center(),
            STEP_PRESEG_CENTERED => self.preseg_centered(),
            STEP_CREATE_OUTPUT => self.create_output(),
            other => Err(StageError::UnknownStep(other.to_string())),
        }
    }
}

impl OutputRegistration for PresegStage<'_> {
    fn outputs(&self) -> Vec<OutputSet> {
        let Some(outputs) = &self.outputs else {
            return Vec::new();
        };
        let sampling_rate = self.params.sampling_rate();
        let mut vesicles = OutputSet::new(
            "vesicles",
            SetKind::SubTomograms,
            sampling_rate,
            &outputs.vesicles,
        );
        vesicles.star_file = Some(outputs.results_star.clone());
        let mut segmentations = OutputSet::new(
            "segmentations",
            SetKind::TomoMasks,
            sampling_rate,
            &outputs.segmentations,
        );
        segmentations.star_file = Some(outputs.results_star.clone());
        vec![vesicles, segmentations]
    }

    fn summary(&self) -> Vec<String> {
        match &self.outputs {
            Some(outputs) if outputs.removed > 0 => vec![format!(
                "Number of segmentations removed by size filtering was {}",
                outputs.removed
            )],
            _ => Vec::new(),
        }
    }
}

impl Protocol for PresegStage<'_> {
    fn protocol_id(&self) -> &'static str {
        StageKind::Preseg.id()
    }
}

#[cfg(test)]
mod tests {
    use super::{prune_reason, remove_vesicle_files, PresegParams};
    use crate::mrc::VolumeDims;

    #[test]
    fn whole_tomogram_segmentations_are_pruned() {
        let tomo = VolumeDims::new(100, 100, 50, 1);
        assert_eq!(prune_reason(tomo, tomo, -1, -1), Some("whole_tomogram"));
        assert_eq!(prune_reason(VolumeDims::new(20, 20, 10, 1), tomo, -1, -1), None);
    }

    #[test]
    fn size_filter_applies_only_when_enabled() {
        let tomo = VolumeDims::new(100, 100, 50, 1);
        let small = VolumeDims::new(8, 30, 30, 1);
        assert_eq!(prune_reason(small, tomo, 10, -1), Some("below_min_size"));
        assert_eq!(prune_reason(small, tomo, -1, -1), None);
        let shallow = VolumeDims::new(30, 30, 4, 1);
        assert_eq!(prune_reason(shallow, tomo, -1, 5), Some("below_min_size"));
    }

    #[test]
    fn removing_a_segmentation_also_removes_its_crop() {
        let dir = tempfile::tempdir().expect("temp dir");
        let seg = dir.path().join("t_tid_1_seg.mrc");
        let crop = dir.path().join("t_tid_1.mrc");
        std::fs::write(&seg, b"seg").expect("write seg");
        std::fs::write(&crop, b"crop").expect("write crop");
        remove_vesicle_files(&seg).expect("remove");
        assert!(!seg.exists());
        assert!(!crop.exists());
    }

    #[test]
    fn params_require_positive_thickness_and_masks() {
        let params: PresegParams = serde_json::from_value(serde_json::json!({
            "tomo_masks": [],
            "sg_memb_neigh": 20.0
        }))
        .expect("params parse");
        assert_eq!(params.sp_off_voxels, 1);
        assert_eq!(params.sg_memb_thk, 40.0);
        assert!(params.validate().is_err());
    }
}
