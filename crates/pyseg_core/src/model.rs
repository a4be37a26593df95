//! Host-model entities produced from PySeg tables.
//!
//! # Invariants
//! - Entities are plain values; nothing is mutated after conversion.
//! - Coordinates are stored in the bottom-left-corner convention used by the
//!   star files.

use crate::config::TomoAcquisition;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A tomogram, or one volume of a multi-volume file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tomogram {
    pub file_name: String,
    /// 1-based index inside the file.
    pub index: u32,
    pub sampling_rate: f64,
    /// Origin shifts, `-dim/2 * sampling_rate` on each axis.
    pub origin: [f64; 3],
    pub acquisition: TomoAcquisition,
}

/// A 3-D position with orientation attached to a tomogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub transform: Matrix4<f64>,
    /// Index of the parent tomogram in its set, when attached.
    pub vol_id: Option<usize>,
    /// Parent tomogram file.
    pub vol_name: String,
    /// Vesicle the coordinate was picked from.
    pub group_id: Option<String>,
}

/// A sub-volume (vesicle crop or particle) with its alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTomogram {
    pub file_name: String,
    pub vol_name: String,
    pub sampling_rate: f64,
    pub class_id: Option<i64>,
    pub transform: Matrix4<f64>,
    pub origin: [f64; 3],
    pub coordinate: Option<Coordinate3D>,
    pub tilt_prior: f64,
    pub psi_prior: f64,
}

impl SubTomogram {
    /// Untransformed sub-volume with identity alignment.
    pub fn new(file_name: impl Into<String>, vol_name: impl Into<String>, sampling_rate: f64) -> Self {
        Self {
            file_name: file_name.into(),
            vol_name: vol_name.into(),
            sampling_rate,
            class_id: None,
            transform: Matrix4::identity(),
            origin: [0.0; 3],
            coordinate: None,
            tilt_prior: 0.0,
            psi_prior: 0.0,
        }
    }
}

/// A segmented vesicle mask referring to its un-segmented crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomoMask {
    /// Segmentation (label) volume.
    pub file_name: String,
    /// Volume the mask annotates.
    pub vol_name: String,
    pub class_id: Option<i64>,
    pub sampling_rate: f64,
}

const SPLIT_PATTERN: &str = "_split_";
const TID_PATTERN: &str = "_tid_";
const ID_PATTERN: &str = "_id_";

/// Extracts the vesicle index PySeg embeds in sub-volume file names.
///
/// Names look like `<tomo>_tid_<n>.mrc`, or `<tomo>_id_<n>_split_<m>.mrc`
/// when vesicles were sliced. Directory and extension are ignored. A missing
/// start marker counts as found at -1, so the id starts `len(marker) - 1`
/// characters into the name, and a start past the end yields "".
pub fn vesicle_id_from_subtomo_name(subtomo_name: &str) -> String {
    let base = remove_base_ext(subtomo_name);
    if let Some(end) = base.find(SPLIT_PATTERN) {
        let start = marker_end(base, ID_PATTERN);
        base.get(start..end).unwrap_or_default().to_string()
    } else {
        let start = marker_end(base, TID_PATTERN);
        base[start..].to_string()
    }
}

/// Byte offset just past the first `marker`, or past the first
/// `marker.len() - 1` characters when it is absent.
fn marker_end(base: &str, marker: &str) -> usize {
    match base.find(marker) {
        Some(pos) => pos + marker.len(),
        None => base
            .char_indices()
            .nth(marker.chars().count() - 1)
            .map_or(base.len(), |(pos, _)| pos),
    }
}

/// File name without directory and last extension.
pub fn remove_base_ext(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// File name without directory.
pub fn base_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}
