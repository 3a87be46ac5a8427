use std::ops::Range;

use ndarray::{Array2, Array3, ArrayView2, Axis as ArrayAxis, s};
use serde::{Deserialize, Serialize};

use crate::enums::Axis;
use crate::error::{AlignError, AlignResult};

/// Voxel counts (`dim1..dim3`) and voxel sizes in mm (`pixdim1..pixdim3`),
/// both in x, y, z order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeMeta {
    pub dim: [usize; 3],
    pub pixdim: [f64; 3],
}

impl VolumeMeta {
    pub fn new(dim: [usize; 3], pixdim: [f64; 3]) -> Self {
        Self { dim, pixdim }
    }

    pub fn dim(&self, axis: Axis) -> usize {
        self.dim[axis.index()]
    }

    pub fn pixdim(&self, axis: Axis) -> f64 {
        self.pixdim[axis.index()]
    }

    /// Field of view along `axis` in mm.
    pub fn fov(&self, axis: Axis) -> f64 {
        self.dim(axis) as f64 * self.pixdim(axis)
    }

    pub fn with_dim(mut self, axis: Axis, dim: usize) -> Self {
        self.dim[axis.index()] = dim;
        self
    }

    pub fn with_pixdim(mut self, axis: Axis, pixdim: f64) -> Self {
        self.pixdim[axis.index()] = pixdim;
        self
    }

    /// Rejects empty grids and non-positive or non-finite voxel sizes.
    pub fn validate(&self) -> Result<(), String> {
        for axis in Axis::ALL {
            if self.dim(axis) == 0 {
                return Err(format!("dim along {axis} is zero"));
            }
            let pixdim = self.pixdim(axis);
            if !pixdim.is_finite() || pixdim <= 0.0 {
                return Err(format!("pixdim along {axis} is {pixdim}"));
            }
        }
        Ok(())
    }
}

/// A box of voxel indices, half-open along each axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub x: Range<usize>,
    pub y: Range<usize>,
    pub z: Range<usize>,
}

impl Region {
    /// A square of `2 * half_width` voxels around the in-plane centre of one
    /// depth slice, clamped to the grid.
    pub fn central_square(meta: &VolumeMeta, slice: usize, half_width: usize) -> Self {
        let centred = |dim: usize| {
            let centre = dim / 2;
            centre.saturating_sub(half_width)..(centre + half_width).min(dim)
        };
        Self {
            x: centred(meta.dim[0]),
            y: centred(meta.dim[1]),
            z: slice..slice + 1,
        }
    }

    fn is_empty(&self) -> bool {
        self.x.is_empty() || self.y.is_empty() || self.z.is_empty()
    }

    fn fits(&self, meta: &VolumeMeta) -> bool {
        self.x.end <= meta.dim[0] && self.y.end <= meta.dim[1] && self.z.end <= meta.dim[2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionStats {
    pub min: f32,
    pub max: f32,
}

/// An in-memory voxel grid. `data` is laid out as (depth, height, width),
/// i.e. indexed `[z, y, x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub pixdim: [f64; 3],
}

impl Volume {
    pub fn new(data: Array3<f32>, pixdim: [f64; 3]) -> Self {
        Self { data, pixdim }
    }

    pub fn zeros(meta: &VolumeMeta) -> Self {
        let [x, y, z] = meta.dim;
        Self::new(Array3::zeros((z, y, x)), meta.pixdim)
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn meta(&self) -> VolumeMeta {
        let (depth, height, width) = self.dim();
        VolumeMeta::new([width, height, depth], self.pixdim)
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn get_slice_from_axis(&self, index: usize, axis: Axis) -> Option<ArrayView2<'_, f32>> {
        if index >= self.meta().dim(axis) {
            return None;
        }
        let slice = match axis {
            Axis::Z => self.data.slice(s![index, .., ..]),
            Axis::Y => self.data.slice(s![.., index, ..]),
            Axis::X => self.data.slice(s![.., .., index]),
        };
        Some(slice)
    }

    pub fn region_stats(&self, region: &Region) -> AlignResult<RegionStats> {
        if region.is_empty() || !region.fits(&self.meta()) {
            return Err(AlignError::VolumeStore(format!(
                "region {region:?} is empty or outside a {:?} grid",
                self.meta().dim
            )));
        }
        let view = self.data.slice(s![
            region.z.clone(),
            region.y.clone(),
            region.x.clone()
        ]);
        let (min, max) = view.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY),
            |(min, max), &v| (min.min(v), max.max(v)),
        );
        Ok(RegionStats { min, max })
    }

    /// Mean along depth of the volume with everything outside
    /// `[start, start + count)` zeroed. Like a whole-volume mean reducer it
    /// divides by the full depth, not by `count`.
    pub fn masked_depth_mean(&self, start: usize, count: usize) -> AlignResult<Array2<f32>> {
        let (depth, _, _) = self.dim();
        if count == 0 || start + count > depth {
            return Err(AlignError::VolumeStore(format!(
                "depth range {start}..{} outside a volume of depth {depth}",
                start + count
            )));
        }
        let sum = self
            .data
            .slice(s![start..start + count, .., ..])
            .sum_axis(ArrayAxis(0));
        Ok(sum / depth as f32)
    }

    /// Stacks 2D layers along depth; layer `i` becomes slice `i`.
    pub fn stack_layers(layers: &[Array2<f32>], pixdim: [f64; 3]) -> AlignResult<Self> {
        let views: Vec<ArrayView2<'_, f32>> = layers.iter().map(|layer| layer.view()).collect();
        let data = ndarray::stack(ArrayAxis(0), &views)
            .map_err(|e| AlignError::VolumeStore(format!("cannot stack layers: {e}")))?;
        Ok(Self::new(data, pixdim))
    }
}
