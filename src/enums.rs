use std::fmt;

use serde::{Deserialize, Serialize};

/// Principal volume axis. `Z` is the depth axis slabs are cut along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Acquisition class of the input volume. Selects the template-specific
/// intensity cleanup and the intended slab thickness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Modality {
    T1,
    T2,
    Flair,
    Ct,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Modality::T1 => "T1",
            Modality::T2 => "T2",
            Modality::Flair => "FLAIR",
            Modality::Ct => "CT",
        };
        f.write_str(name)
    }
}

/// Where the bounding box of a voxel grid starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoxOrigin {
    /// Voxel indices address voxel corners; the box spans `[0, dim * pixdim]`.
    #[default]
    Corner,
    /// Voxel indices address voxel centres; the box is shifted by half a voxel.
    Centre,
}

/// Which faces of a voxel box are pulled inwards by a small offset.
///
/// Insetting keeps a face that lands exactly on a voxel boundary from being
/// counted as the next voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoxInset {
    #[default]
    Neither,
    Low,
    High,
    Both,
}

impl BoxInset {
    pub fn low(self) -> bool {
        matches!(self, BoxInset::Low | BoxInset::Both)
    }

    pub fn high(self) -> bool {
        matches!(self, BoxInset::High | BoxInset::Both)
    }
}

/// States of a single alignment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Initial,
    Cropped,
    Registered,
    RotationChecked,
    Retrying,
    Sized,
    Centered,
    Finalized,
    Failed,
}

impl PipelineState {
    /// Whether a run in this state may move to `next`.
    ///
    /// The only way back is `Retrying -> Registered`; the orchestrator takes
    /// it at most once per run.
    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Initial, Cropped)
            | (Cropped, Registered)
            | (Registered, RotationChecked)
            | (RotationChecked, Retrying)
            | (RotationChecked, Sized)
            | (Retrying, Registered)
            | (Sized, Centered)
            | (Sized, Finalized)
            | (Centered, Finalized) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
