//! Bounding-box extent of a volume after an affine transform.

use nalgebra::Point3;

use crate::enums::{Axis, BoxInset, BoxOrigin};
use crate::error::{AlignError, AlignResult};
use crate::matrix::AffineMatrix;
use crate::volume::VolumeMeta;

// Floating-point slack before rounding a slice count up.
const CEIL_TOLERANCE: f64 = 1e-9;

/// Low and high world coordinate of the transformed box along one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisBounds {
    pub lo: f64,
    pub hi: f64,
}

impl AxisBounds {
    pub fn extent(&self) -> f64 {
        self.hi - self.lo
    }
}

fn validated(meta: &VolumeMeta) -> AlignResult<()> {
    meta.validate().map_err(AlignError::ExtentComputation)
}

/// The eight corners of the physical box covered by `meta`, in mm.
pub fn box_corners(meta: &VolumeMeta, origin: BoxOrigin) -> [Point3<f64>; 8] {
    inset_box_corners(meta, origin, BoxInset::Neither, 0.0)
}

/// Like [`box_corners`], with the `inset` faces moved inwards by
/// `offset_voxels` voxels along every axis.
pub fn inset_box_corners(
    meta: &VolumeMeta,
    origin: BoxOrigin,
    inset: BoxInset,
    offset_voxels: f64,
) -> [Point3<f64>; 8] {
    let start = |axis: Axis| match origin {
        BoxOrigin::Corner => 0.0,
        BoxOrigin::Centre => -0.5 * meta.pixdim(axis),
    };
    let shift = |axis: Axis, applies: bool| {
        if applies {
            offset_voxels * meta.pixdim(axis)
        } else {
            0.0
        }
    };
    let lo = |axis: Axis| start(axis) + shift(axis, inset.low());
    let hi = |axis: Axis| start(axis) + meta.fov(axis) - shift(axis, inset.high());

    let mut corners = [Point3::origin(); 8];
    for (i, corner) in corners.iter_mut().enumerate() {
        let pick = |bit: usize, axis: Axis| if i & bit == 0 { lo(axis) } else { hi(axis) };
        *corner = Point3::new(pick(4, Axis::X), pick(2, Axis::Y), pick(1, Axis::Z));
    }
    corners
}

/// Bounds of the transformed box along every axis, in x, y, z order.
pub fn axis_bounds(
    meta: &VolumeMeta,
    matrix: &AffineMatrix,
    origin: BoxOrigin,
) -> AlignResult<[AxisBounds; 3]> {
    inset_axis_bounds(meta, matrix, origin, BoxInset::Neither, 0.0)
}

/// Bounds of the transformed box with the `inset` faces pulled in by
/// `offset_voxels` voxels before transforming.
pub fn inset_axis_bounds(
    meta: &VolumeMeta,
    matrix: &AffineMatrix,
    origin: BoxOrigin,
    inset: BoxInset,
    offset_voxels: f64,
) -> AlignResult<[AxisBounds; 3]> {
    validated(meta)?;
    if !offset_voxels.is_finite() || offset_voxels < 0.0 {
        return Err(AlignError::ExtentComputation(format!(
            "inset offset is {offset_voxels} voxels"
        )));
    }

    let mut bounds = [AxisBounds {
        lo: f64::INFINITY,
        hi: f64::NEG_INFINITY,
    }; 3];
    for corner in inset_box_corners(meta, origin, inset, offset_voxels) {
        let moved = matrix.transform_point(&corner);
        for (axis_bounds, value) in bounds.iter_mut().zip(moved.coords.iter()) {
            axis_bounds.lo = axis_bounds.lo.min(*value);
            axis_bounds.hi = axis_bounds.hi.max(*value);
        }
    }
    Ok(bounds)
}

/// Voxel count needed along `axis` so the transformed volume is not clipped.
///
/// The physical extent of `reference` after `matrix` is divided by
/// `target_pixdim` and rounded up. The result is never smaller than the
/// reference's own voxel count along `axis`.
///
/// # Example
///
/// ```
/// use acpc_align::{extent::transformed_dim, AffineMatrix, Axis, VolumeMeta};
///
/// let meta = VolumeMeta::new([256, 256, 180], [1.0, 1.0, 1.0]);
/// let dim = transformed_dim(&meta, &AffineMatrix::identity(), Axis::Z, 1.0).unwrap();
/// assert_eq!(dim, 180);
/// ```
pub fn transformed_dim(
    reference: &VolumeMeta,
    matrix: &AffineMatrix,
    axis: Axis,
    target_pixdim: f64,
) -> AlignResult<usize> {
    if !target_pixdim.is_finite() || target_pixdim <= 0.0 {
        return Err(AlignError::ExtentComputation(format!(
            "target pixdim is {target_pixdim}"
        )));
    }

    let bounds = axis_bounds(reference, matrix, BoxOrigin::Corner)?;
    let extent_mm = bounds[axis.index()].extent();
    if !extent_mm.is_finite() {
        return Err(AlignError::ExtentComputation(format!(
            "transformed extent along {axis} is {extent_mm}"
        )));
    }

    let slices = (extent_mm / target_pixdim - CEIL_TOLERANCE).ceil().max(0.0) as usize;
    Ok(slices.max(reference.dim(axis)))
}
