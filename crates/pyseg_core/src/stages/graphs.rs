//! Membrane graphs, one PySeg job per package of vesicles.
//!
//! # Invariants
//! - Packages are independent; each job's result is moved to
//!   `extra/out_stars/<package name>` before another job can overwrite it.
//! - The cleanup step runs only after every package step.

use super::{
    expect_output, file_stem, require_positive, to_nm, StageContext, StageError, StageKind,
    StageResult,
};
use crate::catalog::OutputSet;
use crate::config::PysegAsset;
use crate::protocol::{InputStaging, OutputRegistration, Protocol, Step, StepSequence};
use crate::runner::JobSpec;
use crate::star::labels::SEGMENTATION;
use crate::star::{split_star_file, Table, DEFAULT_SPLIT_PREFIX};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const IN_STARS_DIR: &str = "in_stars";
pub const OUT_STARS_DIR: &str = "out_stars";
const SUBSET_STAR: &str = "inSegVesicles.star";
const GRAPH_SUFFIX: &str = "_mb_graph.star";
const DISPERSE_DIR_PREFIX: &str = "disperse_";
const STEP_REMOVE_UNUSED: &str = "remove_unused_files";

fn default_pkg_size() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_s_sig() -> f64 {
    1.0
}

fn default_v_den() -> f64 {
    0.0035
}

fn default_v_ratio() -> f64 {
    4.0
}

fn default_bin_threads() -> usize {
    2
}

/// Graph construction parameters. Lengths are in angstroms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphsParams {
    /// Centred pre-segmentation table.
    pub in_star: PathBuf,
    pub sampling_rate: f64,
    /// Segmentations kept after a subset; `None` keeps every row.
    #[serde(default)]
    pub segmentations: Option<Vec<String>>,
    /// Vesicles handed to one PySeg call.
    #[serde(default = "default_pkg_size")]
    pub vesicle_pkg_size: usize,
    /// Delete the DisPerSE intermediate directories when done.
    #[serde(default = "default_true")]
    pub keep_only_req_files: bool,
    #[serde(default = "default_s_sig")]
    pub s_sig: f64,
    /// Vertex density within membranes (nm³).
    #[serde(default = "default_v_den")]
    pub v_den: f64,
    #[serde(default = "default_v_ratio")]
    pub v_ratio: f64,
    /// Maximum distance to the membrane.
    pub max_len: f64,
    /// Threads of each PySeg call.
    #[serde(default = "default_bin_threads")]
    pub bin_threads: usize,
}

impl GraphsParams {
    pub fn validate(&self) -> StageResult<()> {
        require_positive("sampling_rate", self.sampling_rate)?;
        require_positive("max_len", self.max_len)?;
        if self.vesicle_pkg_size == 0 {
            return Err(StageError::InvalidParams(
                "`vesicle_pkg_size` must be greater than 0".to_string(),
            ));
        }
        if self.bin_threads == 0 {
            return Err(StageError::InvalidParams(
                "`bin_threads` must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct GraphsStage<'a> {
    params: GraphsParams,
    ctx: StageContext<'a>,
    packages: Vec<PathBuf>,
    finished: bool,
}

impl<'a> GraphsStage<'a> {
    pub fn new(params: GraphsParams, ctx: StageContext<'a>) -> StageResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ctx,
            packages: Vec::new(),
            finished: false,
        })
    }

    /// Package tables written by input staging.
    pub fn packages(&self) -> &[PathBuf] {
        &self.packages
    }

    pub fn out_stars_dir(&self) -> PathBuf {
        self.ctx.extra_path(OUT_STARS_DIR)
    }

    /// Graph tables produced so far, in package order.
    pub fn graph_stars(&self) -> Vec<PathBuf> {
        let out_dir = self.out_stars_dir();
        self.packages
            .iter()
            .filter_map(|pkg| pkg.file_name())
            .map(|name| out_dir.join(name))
            .filter(|path| path.exists())
            .collect()
    }

    /// Writes `inSegVesicles.star` when the selection is a strict subset.
    ///
    /// Rows follow the selection order. Returns the table to split.
    fn manage_in_star(&self) -> StageResult<PathBuf> {
        let Some(selected) = &self.params.segmentations else {
            return Ok(self.params.in_star.clone());
        };
        let table = Table::read(&self.params.in_star)?;
        if selected.len() == table.len() {
            return Ok(self.params.in_star.clone());
        }

        info!(
            "event=graphs_subset module=stages status=ok selected={} rows={}",
            selected.len(),
            table.len()
        );
        let by_segmentation: HashMap<String, usize> = table
            .iter()
            .enumerate()
            .map(|(index, row)| (row.text(SEGMENTATION).into_owned(), index))
            .collect();
        let mut subset = Table::new(table.column_names().iter().cloned());
        for segmentation in selected {
            let row = by_segmentation
                .get(segmentation)
                .and_then(|&index| table.row(index))
                .ok_or_else(|| {
                    StageError::InvalidParams(format!(
                        "segmentation `{segmentation}` is not in {}",
                        self.params.in_star.display()
                    ))
                })?;
            subset.append_row(&row);
        }
        let out_star = self.ctx.extra_path(SUBSET_STAR);
        subset.write(&out_star)?;
        Ok(out_star)
    }

    fn graphs_job(&self, package: &Path) -> JobSpec {
        self.ctx
            .pyseg_job(PysegAsset::GraphsScript)
            .flag("--inStar", package.display())
            .flag("--outDir", self.ctx.extra_dir().display())
            .flag("--pixelSize", to_nm(self.params.sampling_rate))
            .flag("--sSig", self.params.s_sig)
            .flag("--vDen", self.params.v_den)
            .flag("--veRatio", self.params.v_ratio)
            .flag("--maxLen", to_nm(self.params.max_len))
            .flag("-j", self.params.bin_threads)
    }

    /// Runs one package and moves its graph table to `out_stars`.
    pub fn graphs_package(&mut self, package: &Path) -> StageResult<()> {
        self.ctx.run(&self.graphs_job(package))?;
        let produced =
            expect_output(self.ctx.extra_path(format!("{}{GRAPH_SUFFIX}", file_stem(package))))?;
        let target = self
            .out_stars_dir()
            .join(package.file_name().unwrap_or_default());
        std::fs::rename(&produced, &target).map_err(StageError::io(&target))?;
        Ok(())
    }

    /// Deletes `extra/disperse_*` unless intermediate files are kept.
    pub fn remove_unused_files(&mut self) -> StageResult<()> {
        if self.params.keep_only_req_files {
            let extra = self.ctx.extra_dir();
            let entries = std::fs::read_dir(&extra).map_err(StageError::io(&extra))?;
            for entry in entries {
                let entry = entry.map_err(StageError::io(&extra))?;
                let path = entry.path();
                let is_disperse = entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(DISPERSE_DIR_PREFIX);
                if is_disperse && path.is_dir() {
                    std::fs::remove_dir_all(&path).map_err(StageError::io(&path))?;
                    info!(
                        "event=graphs_cleanup module=stages status=ok removed={}",
                        path.display()
                    );
                }
            }
        }
        self.finished = true;
        Ok(())
    }
}

impl InputStaging for GraphsStage<'_> {
    fn stage_inputs(&mut self) -> StageResult<()> {
        let in_dir = self.ctx.make_extra_dir(IN_STARS_DIR)?;
        self.ctx.make_extra_dir(OUT_STARS_DIR)?;
        let in_star = self.manage_in_star()?;
        self.packages = split_star_file(
            &in_star,
            &in_dir,
            self.params.vesicle_pkg_size,
            DEFAULT_SPLIT_PREFIX,
        )?;
        Ok(())
    }
}

impl StepSequence for GraphsStage<'_> {
    fn steps(&self) -> Vec<Step> {
        let package_steps: Vec<Step> = self
            .packages
            .iter()
            .map(|pkg| Step::new(file_stem(pkg)))
            .collect();
        let cleanup = Step::new(STEP_REMOVE_UNUSED)
            .after(package_steps.iter().map(|step| step.name.clone()));
        package_steps.into_iter().chain([cleanup]).collect()
    }

    fn run_step(&mut self, name: &str) -> StageResult<()> {
        if name == STEP_REMOVE_UNUSED {
            return self.remove_unused_files();
        }
        let package = self
            .packages
            .iter()
            .find(|pkg| file_stem(pkg) == name)
            .cloned()
            .ok_or_else(|| StageError::UnknownStep(name.to_string()))?;
        self.graphs_package(&package)
    }
}

impl OutputRegistration for GraphsStage<'_> {
    /// Graphs stay on disk for the filaments stage; nothing is registered.
    fn outputs(&self) -> Vec<OutputSet> {
        Vec::new()
    }

    fn summary(&self) -> Vec<String> {
        if self.finished {
            vec!["Graphs were correctly generated.".to_string()]
        } else {
            Vec::new()
        }
    }
}

impl Protocol for GraphsStage<'_> {
    fn protocol_id(&self) -> &'static str {
        StageKind::Graphs.id()
    }
}
