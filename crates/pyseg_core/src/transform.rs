//! Rigid-body alignment transforms built from star rows.
//!
//! # Responsibility
//! - Build the 4x4 alignment matrix attached to sub-tomograms and coordinates.
//!
//! # Invariants
//! - Angles are negated before building the ZYZ rotation, compensating the
//!   opposite handedness of the PySeg/RELION angles.
//! - With `invert`, shifts are negated, inserted and the whole matrix is
//!   inverted. Without it shifts are inserted as-is and nothing is inverted.
//!   This asymmetry is a fixed contract checked against reference values.

use crate::star::labels::{PSI, ROT, SHIFT_X, SHIFT_Y, SHIFT_Z, TILT};
use crate::star::Row;
use nalgebra::{Matrix3, Matrix4, Vector3};

/// Euler angles in degrees, RELION naming.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EulerAngles {
    pub rot: f64,
    pub tilt: f64,
    pub psi: f64,
}

impl EulerAngles {
    pub fn new(rot: f64, tilt: f64, psi: f64) -> Self {
        Self { rot, tilt, psi }
    }

    /// Reads `rlnAngleRot/Tilt/Psi`, defaulting absent values to 0.
    pub fn from_row(row: &Row<'_>) -> Self {
        Self::new(
            row.float_or(ROT, 0.0),
            row.float_or(TILT, 0.0),
            row.float_or(PSI, 0.0),
        )
    }
}

/// Reads `rlnOriginX/Y/Z`, defaulting absent values to 0.
pub fn shifts_from_row(row: &Row<'_>) -> Vector3<f64> {
    Vector3::new(
        row.float_or(SHIFT_X, 0.0),
        row.float_or(SHIFT_Y, 0.0),
        row.float_or(SHIFT_Z, 0.0),
    )
}

/// Static-frame ZYZ Euler matrix for angles `(ai, aj, ak)` in radians.
///
/// Axis order is Z (first), Y, Z with odd parity, so the angles enter with
/// their sign flipped.
pub fn euler_matrix_szyz(ai: f64, aj: f64, ak: f64) -> Matrix4<f64> {
    // firstaxis = z, parity odd, repetition, static frame.
    let (i, j, k) = (2, 1, 0);
    let (ai, aj, ak) = (-ai, -aj, -ak);
    let (si, sj, sk) = (ai.sin(), aj.sin(), ak.sin());
    let (ci, cj, ck) = (ai.cos(), aj.cos(), ak.cos());
    let (cc, cs) = (ci * ck, ci * sk);
    let (sc, ss) = (si * ck, si * sk);

    let mut m = Matrix4::identity();
    m[(i, i)] = cj;
    m[(i, j)] = sj * si;
    m[(i, k)] = sj * ci;
    m[(j, i)] = sj * sk;
    m[(j, j)] = -cj * ss + cc;
    m[(j, k)] = -cj * cs - sc;
    m[(k, i)] = -sj * ck;
    m[(k, j)] = cj * sc + cs;
    m[(k, k)] = cj * cc - ss;
    m
}

/// Builds the alignment matrix for one record.
///
/// Returns `None` only if `invert` is set and the composed matrix is
/// singular, which cannot happen for finite angles and shifts.
pub fn build_transform(
    angles: EulerAngles,
    shifts: Vector3<f64>,
    invert: bool,
) -> Option<Matrix4<f64>> {
    let rad = Vector3::new(angles.rot, angles.tilt, angles.psi).map(|deg| -deg.to_radians());
    let mut m = euler_matrix_szyz(rad[0], rad[1], rad[2]);
    if invert {
        m[(0, 3)] = -shifts[0];
        m[(1, 3)] = -shifts[1];
        m[(2, 3)] = -shifts[2];
        m.try_inverse()
    } else {
        m[(0, 3)] = shifts[0];
        m[(1, 3)] = shifts[1];
        m[(2, 3)] = shifts[2];
        Some(m)
    }
}

/// Builds the alignment matrix from the angle and shift columns of a row.
pub fn transform_from_row(row: &Row<'_>, invert: bool) -> Option<Matrix4<f64>> {
    build_transform(EulerAngles::from_row(row), shifts_from_row(row), invert)
}

/// Upper-left 3x3 rotation block.
pub fn rotation_block(m: &Matrix4<f64>) -> Matrix3<f64> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Origin transform for a volume: `-dim/2 * sampling_rate` on each axis.
pub fn volume_origin(dims: (u32, u32, u32), sampling_rate: f64) -> [f64; 3] {
    [
        f64::from(dims.0) / -2.0 * sampling_rate,
        f64::from(dims.1) / -2.0 * sampling_rate,
        f64::from(dims.2) / -2.0 * sampling_rate,
    ]
}

/// Row-major flattening used for persistence.
pub fn to_row_major(m: &Matrix4<f64>) -> [f64; 16] {
    let mut out = [0.0; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[r * 4 + c] = m[(r, c)];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{build_transform, euler_matrix_szyz, rotation_block, volume_origin, EulerAngles};
    use nalgebra::{Matrix3, Matrix4, Vector3};

    const EPS: f64 = 1e-9;

    fn assert_close(a: &Matrix4<f64>, b: &Matrix4<f64>) {
        assert!((a - b).abs().max() < EPS, "matrices differ:\n{a}\n{b}");
    }

    #[test]
    fn zero_angles_give_pure_translation() {
        let m = build_transform(EulerAngles::default(), Vector3::new(1.0, 2.0, 3.0), false)
            .expect("no inversion");
        let mut expected = Matrix4::identity();
        expected[(0, 3)] = 1.0;
        expected[(1, 3)] = 2.0;
        expected[(2, 3)] = 3.0;
        assert_close(&m, &expected);
    }

    #[test]
    fn single_z_rotation_matches_negated_angle() {
        // Only rot set: rotation about z by -rot after the handedness flip.
        let m = build_transform(EulerAngles::new(90.0, 0.0, 0.0), Vector3::zeros(), false)
            .expect("no inversion");
        let r = rotation_block(&m);
        let expected = Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        assert!((r - expected).abs().max() < EPS, "unexpected rotation:\n{r}");
    }

    #[test]
    fn rotation_block_is_orthonormal() {
        let m = euler_matrix_szyz(0.3, -1.2, 2.5);
        let r = rotation_block(&m);
        assert!((r.transpose() * r - Matrix3::identity()).abs().max() < EPS);
        assert!((r.determinant() - 1.0).abs() < EPS);
    }

    #[test]
    fn inverted_transform_is_inverse_of_negated_shift_transform() {
        let angles = EulerAngles::new(32.0, -71.5, 140.25);
        let shifts = Vector3::new(4.5, -2.0, 11.0);

        let inverted = build_transform(angles, shifts, true).expect("invertible");
        let reference = build_transform(angles, -shifts, false)
            .expect("no inversion")
            .try_inverse()
            .expect("invertible");
        assert_close(&inverted, &reference);

        // The inverted form is not simply the inverse of the non-inverted one.
        let naive = build_transform(angles, shifts, false)
            .expect("no inversion")
            .try_inverse()
            .expect("invertible");
        assert!((inverted - naive).abs().max() > 1e-3);
    }

    #[test]
    fn inverted_rotation_is_transpose() {
        let angles = EulerAngles::new(10.0, 20.0, 30.0);
        let plain = build_transform(angles, Vector3::zeros(), false).expect("no inversion");
        let inverted = build_transform(angles, Vector3::zeros(), true).expect("invertible");
        assert!(
            (rotation_block(&inverted) - rotation_block(&plain).transpose())
                .abs()
                .max()
                < EPS
        );
    }

    #[test]
    fn volume_origin_is_centered() {
        assert_eq!(volume_origin((100, 50, 20), 2.0), [-100.0, -50.0, -20.0]);
    }
}
