use tracing::debug;

use crate::enums::Axis;
use crate::matrix::AffineMatrix;
use crate::volume::VolumeMeta;

/// In-plane axes whose translation is corrected.
const CENTERED_AXES: [Axis; 2] = [Axis::X, Axis::Y];

/// Re-centres content after resampling into a canvas with a different field
/// of view.
///
/// Resampling anchors the lower corner of the grid, so a larger canvas leaves
/// the image off-centre. The correction adds half the field-of-view
/// difference to the x and y translations; z and the homogeneous row pass
/// through. The offset depends only on the two grids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenteringAdjuster {
    offset: [f64; 2],
}

impl CenteringAdjuster {
    pub fn new(reference: &VolumeMeta, output: &VolumeMeta) -> Self {
        let offset = CENTERED_AXES.map(|axis| (reference.fov(axis) - output.fov(axis)) / 2.0);
        Self { offset }
    }

    /// Translation added along x and y, in mm.
    pub fn offset(&self) -> [f64; 2] {
        self.offset
    }

    pub fn apply(&self, matrix: &AffineMatrix) -> AffineMatrix {
        let translation = matrix.translation();
        let centered = CENTERED_AXES
            .iter()
            .zip(self.offset)
            .fold(*matrix, |acc, (axis, offset)| {
                acc.with_translation_component(*axis, translation[axis.index()] + offset)
            });
        debug!(offset_x = self.offset[0], offset_y = self.offset[1], "Centered matrix");
        centered
    }
}
