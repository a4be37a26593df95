//! Column labels shared with the PySeg command-line programs.

/// Sentinel returned for text lookups of absent columns.
pub const NOT_FOUND: &str = "NOT_FOUND";

/// Tomogram the record belongs to.
pub const TOMO_NAME: &str = "rlnMicrographName";
/// Sub-tomogram (or vesicle crop) file.
pub const SUBTOMO_NAME: &str = "rlnImageName";
pub const COORD_X: &str = "rlnCoordinateX";
pub const COORD_Y: &str = "rlnCoordinateY";
pub const COORD_Z: &str = "rlnCoordinateZ";
pub const ROT: &str = "rlnAngleRot";
pub const TILT: &str = "rlnAngleTilt";
pub const PSI: &str = "rlnAnglePsi";
pub const TILT_PRIOR: &str = "rlnAngleTiltPrior";
pub const PSI_PRIOR: &str = "rlnAnglePsiPrior";
pub const SHIFT_X: &str = "rlnOriginX";
pub const SHIFT_Y: &str = "rlnOriginY";
pub const SHIFT_Z: &str = "rlnOriginZ";
pub const CLASS_NUMBER: &str = "rlnClassNumber";

/// PySeg aliases of the RELION names, used by the pre-segmentation tables.
pub const TOMOGRAM: &str = TOMO_NAME;
pub const VESICLE: &str = SUBTOMO_NAME;
/// Centre of the vesicle inside its tomogram, written before the centred
/// pre-segmentation pass.
pub const RLN_ORIGIN_X: &str = SHIFT_X;
pub const RLN_ORIGIN_Y: &str = SHIFT_Y;
pub const RLN_ORIGIN_Z: &str = SHIFT_Z;

/// Segmented label volume produced by pre-segmentation.
pub const SEGMENTATION: &str = "psSegImage";
/// Material (sub-region) index of a segmentation.
pub const PYSEG_LABEL: &str = "psSegLabel";
pub const PYSEG_OFFSET_X: &str = "psSegOffX";
pub const PYSEG_OFFSET_Y: &str = "psSegOffY";
pub const PYSEG_OFFSET_Z: &str = "psSegOffZ";
pub const PYSEG_ROT: &str = "psSegRot";
pub const PYSEG_TILT: &str = "psSegTilt";
pub const PYSEG_PSI: &str = "psSegPsi";

/// Columns expected in a RELION sub-tomogram table.
pub const RELION_TOMO_LABELS: &[&str] = &[
    TOMO_NAME,
    COORD_X,
    COORD_Y,
    COORD_Z,
    SUBTOMO_NAME,
    ROT,
    TILT,
    PSI,
    TILT_PRIOR,
    PSI_PRIOR,
    SHIFT_X,
    SHIFT_Y,
    SHIFT_Z,
    CLASS_NUMBER,
];

/// Columns expected in a PySeg picking table.
pub const PICKING_LABELS: &[&str] = &[
    TOMO_NAME,
    VESICLE,
    SEGMENTATION,
    COORD_X,
    COORD_Y,
    COORD_Z,
    ROT,
    TILT,
    PSI,
];
