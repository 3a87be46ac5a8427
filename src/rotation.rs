//! Rotation angles of an affine matrix and the inverse construction.
//!
//! The decomposition follows Spencer W. Thomas, "Decomposing a matrix into
//! simple transformations", Graphics Gems II (1991): scales and shears are
//! peeled off the linear part with Gram-Schmidt and the remaining rotation
//! `R = Rz * Ry * Rx` is split into angles about each axis. Shears are
//! discarded. Both the initial and the rescue mis-registration check use
//! this convention.

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::enums::Axis;
use crate::error::{AlignError, AlignResult};
use crate::matrix::AffineMatrix;

const GIMBAL_EPSILON: f64 = 1e-8;
const DEGENERATE_SCALE: f64 = 1e-12;

/// Rotation angles in degrees about the x, y and z axes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RotationTriple {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl RotationTriple {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn max_abs(&self) -> f64 {
        self.x.abs().max(self.y.abs()).max(self.z.abs())
    }

    /// Axes whose absolute angle is strictly greater than `threshold_deg`.
    pub fn axes_exceeding(&self, threshold_deg: f64) -> Vec<Axis> {
        Axis::ALL
            .into_iter()
            .filter(|axis| self.get(*axis).abs() > threshold_deg)
            .collect()
    }

    pub fn exceeds(&self, threshold_deg: f64) -> bool {
        self.max_abs() > threshold_deg
    }
}

/// Scales, translations and rotations recovered from an affine matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decomposition {
    /// Per-axis scale; a reflection is folded into the x scale as a sign.
    pub scales: Vector3<f64>,
    pub translations: Vector3<f64>,
    pub rotations: RotationTriple,
}

/// Decomposes `matrix` into scales, translations and rotation angles.
pub fn decompose(matrix: &AffineMatrix) -> AlignResult<Decomposition> {
    // Work on the transposed linear part: its rows are the matrix columns.
    let linear = matrix.linear().transpose();
    let m1: Vector3<f64> = linear.row(0).transpose();
    let m2: Vector3<f64> = linear.row(1).transpose();
    let m3: Vector3<f64> = linear.row(2).transpose();

    let mut sx = m1.norm();
    let m1 = normalize(m1, sx, Axis::X)?;

    let m2 = m2 - m1.dot(&m2) * m1;
    let sy = m2.norm();
    let m2 = normalize(m2, sy, Axis::Y)?;

    let m3 = m3 - m1.dot(&m3) * m1 - m2.dot(&m3) * m2;
    let sz = m3.norm();
    let m3 = normalize(m3, sz, Axis::Z)?;

    let mut rotation = Matrix3::from_rows(&[m1.transpose(), m2.transpose(), m3.transpose()]);
    if rotation.determinant() < 0.0 {
        let flipped = -rotation.row(0);
        rotation.set_row(0, &flipped);
        sx = -sx;
    }

    Ok(Decomposition {
        scales: Vector3::new(sx, sy, sz),
        translations: matrix.translation(),
        rotations: rotation_angles(&rotation.transpose()),
    })
}

/// Rotation angles of `matrix` in degrees.
pub fn rotation_angles_deg(matrix: &AffineMatrix) -> AlignResult<RotationTriple> {
    decompose(matrix).map(|decomposition| decomposition.rotations)
}

fn normalize(row: Vector3<f64>, length: f64, axis: Axis) -> AlignResult<Vector3<f64>> {
    if !length.is_finite() || length < DEGENERATE_SCALE {
        return Err(AlignError::MalformedMatrix(format!(
            "linear part has no extent along {axis}"
        )));
    }
    Ok(row / length)
}

/// Splits a pure rotation `R = Rz * Ry * Rx` into angles in degrees.
fn rotation_angles(rotation: &Matrix3<f64>) -> RotationTriple {
    let cos_y = (rotation[(0, 0)].powi(2) + rotation[(1, 0)].powi(2)).sqrt();

    let (x, y, z) = if cos_y.abs() < GIMBAL_EPSILON {
        (
            (-rotation[(1, 2)]).atan2(rotation[(1, 1)]),
            (-rotation[(2, 0)]).atan2(cos_y),
            0.0,
        )
    } else {
        (
            rotation[(2, 1)].atan2(rotation[(2, 2)]),
            (-rotation[(2, 0)]).atan2(cos_y),
            rotation[(1, 0)].atan2(rotation[(0, 0)]),
        )
    };

    RotationTriple::new(x.to_degrees(), y.to_degrees(), z.to_degrees())
}

/// Builds `Rz * Ry * Rx` from angles in degrees.
pub fn rotation_matrix(angles: RotationTriple) -> Matrix3<f64> {
    let (sx, cx) = angles.x.to_radians().sin_cos();
    let (sy, cy) = angles.y.to_radians().sin_cos();
    let (sz, cz) = angles.z.to_radians().sin_cos();

    #[rustfmt::skip]
    let rx = Matrix3::new(
        1.0, 0.0, 0.0,
        0.0, cx, -sx,
        0.0, sx, cx,
    );
    #[rustfmt::skip]
    let ry = Matrix3::new(
        cy, 0.0, sy,
        0.0, 1.0, 0.0,
        -sy, 0.0, cy,
    );
    #[rustfmt::skip]
    let rz = Matrix3::new(
        cz, -sz, 0.0,
        sz, cz, 0.0,
        0.0, 0.0, 1.0,
    );

    rz * ry * rx
}

/// Composes `offset * post_rotate * rotate * pre_rotate * scale`.
///
/// When `origin` is given the rotation is performed about it; the origin is
/// expressed in scaled coordinates.
pub fn compose(
    scales: Vector3<f64>,
    offsets: Vector3<f64>,
    rotations: RotationTriple,
    origin: Option<Vector3<f64>>,
) -> AffineMatrix {
    let scale = Matrix4::new_nonuniform_scaling(&scales);
    let offset = Matrix4::new_translation(&offsets);
    let rotate = rotation_matrix(rotations).to_homogeneous();

    let (pre_rotate, post_rotate) = match origin {
        Some(origin) => (
            Matrix4::new_translation(&(-origin)),
            Matrix4::new_translation(&origin),
        ),
        None => (Matrix4::identity(), Matrix4::identity()),
    };

    AffineMatrix::from_matrix(offset * post_rotate * rotate * pre_rotate * scale)
}

/// A pure rotation about the world origin.
pub fn rotation_affine(angles: RotationTriple) -> AffineMatrix {
    compose(Vector3::repeat(1.0), Vector3::zeros(), angles, None)
}
