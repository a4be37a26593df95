#![allow(dead_code)]

use pyseg_core::mrc::{MrcError, VolumeDims, VolumeProbe};
use pyseg_core::runner::{JobRunner, JobSpec, RunError};
use pyseg_core::star::{StarValue, Table};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Runs nothing; records every job and lets the test fabricate outputs.
pub struct RecordingRunner {
    calls: RefCell<Vec<JobSpec>>,
    on_run: Box<dyn Fn(&JobSpec)>,
}

impl RecordingRunner {
    pub fn new(on_run: impl Fn(&JobSpec) + 'static) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            on_run: Box::new(on_run),
        }
    }

    pub fn calls(&self) -> Vec<JobSpec> {
        self.calls.borrow().clone()
    }
}

impl JobRunner for RecordingRunner {
    fn run_job(&self, spec: &JobSpec) -> Result<(), RunError> {
        self.calls.borrow_mut().push(spec.clone());
        (self.on_run)(spec);
        Ok(())
    }
}

/// Always exits with status 1.
pub struct FailingRunner;

impl JobRunner for FailingRunner {
    fn run_job(&self, spec: &JobSpec) -> Result<(), RunError> {
        Err(RunError::NonZeroExit {
            program: spec.program.clone(),
            code: Some(1),
        })
    }
}

/// Dimensions looked up by path.
#[derive(Default)]
pub struct FixedProbe {
    dims: HashMap<PathBuf, VolumeDims>,
}

impl FixedProbe {
    pub fn with(mut self, path: impl Into<PathBuf>, (x, y, z): (u32, u32, u32)) -> Self {
        self.dims.insert(path.into(), VolumeDims::new(x, y, z, 1));
        self
    }
}

impl VolumeProbe for FixedProbe {
    fn dimensions(&self, path: &Path) -> Result<VolumeDims, MrcError> {
        self.dims.get(path).copied().ok_or_else(|| MrcError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no fixture dims"),
        })
    }
}

/// Input star path of a PySeg job.
pub fn in_star(spec: &JobSpec) -> PathBuf {
    PathBuf::from(spec.flag_value("--inStar").expect("job has --inStar"))
}

/// Output directory of a PySeg job.
pub fn out_dir(spec: &JobSpec) -> PathBuf {
    PathBuf::from(spec.flag_value("--outDir").expect("job has --outDir"))
}

pub fn stem(path: &Path) -> String {
    path.file_stem().unwrap().to_string_lossy().into_owned()
}

pub fn text(value: impl AsRef<str>) -> StarValue {
    StarValue::from(value.as_ref())
}

/// Writes a picking table with one particle per `(tomogram, vesicle, x)`.
pub fn write_picking_table(path: &Path, rows: &[(&str, &str, f64)]) {
    let mut table = Table::new(pyseg_core::star::labels::PICKING_LABELS.iter().copied());
    for (tomogram, vesicle, x) in rows {
        table
            .add_row(vec![
                text(tomogram),
                text(vesicle),
                text(vesicle.replace(".mrc", "_seg.mrc")),
                StarValue::from(*x),
                StarValue::from(20.0),
                StarValue::from(30.0),
                StarValue::from(10.0),
                StarValue::from(45.0),
                StarValue::from(-30.0),
            ])
            .unwrap();
    }
    table.write(path).unwrap();
}

pub const SLICES_TEMPLATE: &str = r#"<?xml version="1.0"?>
<mb_slices>
  <mb_slice>
    <name>mb_ext</name>
    <side>1</side>
    <cont>+</cont>
  </mb_slice>
</mb_slices>
"#;
