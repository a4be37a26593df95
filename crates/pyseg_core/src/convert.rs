//! Star rows to host entities.
//!
//! # Responsibility
//! - Turn RELION sub-tomogram tables and PySeg picking tables into entities.
//! - Build the tomogram set referenced by a picking table.
//!
//! # Invariants
//! - Missing columns never fail a conversion: numeric fields default to 0,
//!   text fields to `NOT_FOUND`, and one warning lists every missing label.
//! - Coordinates are attached to tomograms by file base-name match.

use crate::config::TomoAcquisition;
use crate::model::{
    base_name, vesicle_id_from_subtomo_name, Coordinate3D, SubTomogram, Tomogram,
};
use crate::mrc::{has_mrc_extension, manage_dims, MrcError, VolumeProbe};
use crate::star::labels::{
    CLASS_NUMBER, COORD_X, COORD_Y, COORD_Z, NOT_FOUND, PICKING_LABELS, PSI_PRIOR,
    RELION_TOMO_LABELS, SUBTOMO_NAME, TILT_PRIOR, TOMO_NAME,
};
use crate::star::{StarError, Table};
use crate::transform::{transform_from_row, volume_origin};
use log::warn;
use nalgebra::Matrix4;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Which star layout a file follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarKind {
    RelionSubtomo,
    PysegPicking,
}

impl StarKind {
    pub fn expected_labels(self) -> &'static [&'static str] {
        match self {
            Self::RelionSubtomo => RELION_TOMO_LABELS,
            Self::PysegPicking => PICKING_LABELS,
        }
    }
}

/// Conversion failures. Missing columns are not among them.
#[derive(Debug)]
pub enum ConvertError {
    Star(StarError),
    Mrc(MrcError),
}

impl ConvertError {
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            Self::Star(err) => err.kind(),
            Self::Mrc(err) => err.kind(),
        }
    }
}

impl Display for ConvertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Star(err) => write!(f, "{err}"),
            Self::Mrc(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ConvertError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Star(err) => Some(err),
            Self::Mrc(err) => Some(err),
        }
    }
}

impl From<StarError> for ConvertError {
    fn from(value: StarError) -> Self {
        Self::Star(value)
    }
}

impl From<MrcError> for ConvertError {
    fn from(value: MrcError) -> Self {
        Self::Mrc(value)
    }
}

/// User-visible warning for the labels of `kind` absent from `table`.
///
/// Returns `None` when every expected label is present.
pub fn missing_columns_warning(table: &Table, kind: StarKind) -> Option<String> {
    let missing = table.missing_columns(kind.expected_labels());
    if missing.is_empty() {
        return None;
    }
    let listed = missing
        .iter()
        .map(|label| format!("*{label}*"))
        .collect::<Vec<_>>()
        .join("  ");
    Some(format!(
        "Columns {listed}\nwere not found in the star file provided.\n\
         The corresponding numerical values will be considered as 0."
    ))
}

/// Entities converted from one star file plus the missing-column warning.
#[derive(Debug, Clone)]
pub struct Converted<T> {
    pub items: Vec<T>,
    pub warning: Option<String>,
    pub table: Table,
}

/// Converts a RELION sub-tomogram table.
///
/// Origins come from each sub-tomogram's own header through `probe`.
pub fn star_to_subtomograms(
    table: &Table,
    sampling_rate: f64,
    invert: bool,
    probe: &dyn VolumeProbe,
) -> Result<Vec<SubTomogram>, ConvertError> {
    let mut out = Vec::with_capacity(table.len());
    for row in table.iter() {
        let vol_name = row.text(TOMO_NAME).into_owned();
        let file_name = row.text(SUBTOMO_NAME).into_owned();
        let transform = transform_from_row(&row, invert).unwrap_or_else(Matrix4::identity);

        let group_id = Some(vesicle_id_from_subtomo_name(&file_name));
        let coordinate = Coordinate3D {
            x: row.float_or(COORD_X, 0.0),
            y: row.float_or(COORD_Y, 0.0),
            z: row.float_or(COORD_Z, 0.0),
            transform,
            vol_id: None,
            vol_name: vol_name.clone(),
            group_id,
        };

        let dims = probe.dimensions(Path::new(&file_name))?;
        let z = manage_dims(&file_name, dims);
        let mut subtomo = SubTomogram::new(file_name, vol_name, sampling_rate);
        subtomo.class_id = Some(row.int_or(CLASS_NUMBER, 0));
        subtomo.transform = transform;
        subtomo.origin = volume_origin((dims.x, dims.y, z), sampling_rate);
        subtomo.tilt_prior = row.float_or(TILT_PRIOR, 0.0);
        subtomo.psi_prior = row.float_or(PSI_PRIOR, 0.0);
        subtomo.coordinate = Some(coordinate);
        out.push(subtomo);
    }
    Ok(out)
}

/// Converts a PySeg picking table into coordinates attached to `tomograms`.
///
/// Rows whose tomogram matches no entry of `tomograms` are skipped.
pub fn star_to_coordinates(table: &Table, tomograms: &[Tomogram], invert: bool) -> Vec<Coordinate3D> {
    let mut out = Vec::new();
    for (vol_id, tomo) in tomograms.iter().enumerate() {
        let tomo_base = base_name(&tomo.file_name);
        for row in table.iter() {
            let row_tomo = row.text(TOMO_NAME);
            if base_name(&row_tomo) != tomo_base {
                continue;
            }
            out.push(Coordinate3D {
                x: row.float_or(COORD_X, 0.0),
                y: row.float_or(COORD_Y, 0.0),
                z: row.float_or(COORD_Z, 0.0),
                transform: transform_from_row(&row, invert).unwrap_or_else(Matrix4::identity),
                vol_id: Some(vol_id),
                vol_name: tomo.file_name.clone(),
                group_id: Some(vesicle_id_from_subtomo_name(&row.text(SUBTOMO_NAME))),
            });
        }
    }
    out
}

/// Builds the tomogram set referenced by the `rlnMicrographName` column.
///
/// Names are processed in sorted order; see [`tomograms_from_files`].
pub fn tomograms_from_star(
    table: &Table,
    sampling_rate: f64,
    acquisition: TomoAcquisition,
    probe: &dyn VolumeProbe,
) -> Result<Vec<Tomogram>, ConvertError> {
    let names: BTreeSet<String> = table
        .iter()
        .map(|row| row.text(TOMO_NAME).into_owned())
        .filter(|name| name.as_str() != NOT_FOUND)
        .collect();
    tomograms_from_files(names, sampling_rate, acquisition, probe)
}

/// One tomogram per volume stored in each file.
///
/// MRC image stacks count as a single volume whose depth is the stack size.
pub fn tomograms_from_files<I, S>(
    files: I,
    sampling_rate: f64,
    acquisition: TomoAcquisition,
    probe: &dyn VolumeProbe,
) -> Result<Vec<Tomogram>, ConvertError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for file_name in files {
        let file_name = file_name.as_ref();
        let dims = probe.dimensions(Path::new(file_name))?;
        let (z, n) = if has_mrc_extension(file_name) && dims.z == 1 && dims.n != 1 {
            (dims.n, 1)
        } else {
            (dims.z, dims.n)
        };
        let origin = volume_origin((dims.x, dims.y, z), sampling_rate);
        for index in 1..=n {
            out.push(Tomogram {
                file_name: file_name.to_string(),
                index,
                sampling_rate,
                origin,
                acquisition,
            });
        }
    }
    Ok(out)
}

/// Reads a RELION sub-tomogram star file.
pub fn read_subtomograms_star(
    path: impl AsRef<Path>,
    sampling_rate: f64,
    invert: bool,
    probe: &dyn VolumeProbe,
) -> Result<Converted<SubTomogram>, ConvertError> {
    let table = Table::read(path)?;
    let items = star_to_subtomograms(&table, sampling_rate, invert, probe)?;
    let warning = log_warning(missing_columns_warning(&table, StarKind::RelionSubtomo));
    Ok(Converted {
        items,
        warning,
        table,
    })
}

/// Reads a picking star file into coordinates attached to `tomograms`.
pub fn read_picking_star(
    path: impl AsRef<Path>,
    tomograms: &[Tomogram],
    invert: bool,
) -> Result<Converted<Coordinate3D>, ConvertError> {
    let table = Table::read(path)?;
    let items = star_to_coordinates(&table, tomograms, invert);
    let warning = log_warning(missing_columns_warning(&table, StarKind::PysegPicking));
    Ok(Converted {
        items,
        warning,
        table,
    })
}

/// Entities read from a star file of either layout.
#[derive(Debug, Clone)]
pub enum Particles {
    SubTomograms(Vec<SubTomogram>),
    Coordinates(Vec<Coordinate3D>),
}

impl Particles {
    pub fn len(&self) -> usize {
        match self {
            Self::SubTomograms(items) => items.len(),
            Self::Coordinates(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inputs shared by both star layouts.
#[derive(Clone, Copy)]
pub struct ReadContext<'a> {
    pub sampling_rate: f64,
    pub invert: bool,
    /// Parent tomograms for picking tables.
    pub tomograms: &'a [Tomogram],
    pub probe: &'a dyn VolumeProbe,
}

/// Reads `path` as `kind`, returning the entities and the missing-column
/// warning, if any.
pub fn read_particles_star(
    path: impl AsRef<Path>,
    kind: StarKind,
    ctx: &ReadContext<'_>,
) -> Result<(Particles, Option<String>), ConvertError> {
    match kind {
        StarKind::RelionSubtomo => {
            let converted =
                read_subtomograms_star(path, ctx.sampling_rate, ctx.invert, ctx.probe)?;
            Ok((Particles::SubTomograms(converted.items), converted.warning))
        }
        StarKind::PysegPicking => {
            let converted = read_picking_star(path, ctx.tomograms, ctx.invert)?;
            Ok((Particles::Coordinates(converted.items), converted.warning))
        }
    }
}

fn log_warning(warning: Option<String>) -> Option<String> {
    if let Some(message) = &warning {
        warn!(
            "event=star_convert module=convert status=warning message={}",
            message.replace('\n', " ")
        );
    }
    warning
}
