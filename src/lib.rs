//! # ACPC alignment library
//!
//! This crate holds the decision-making core of an anterior/posterior
//! commissure (ACPC) alignment pipeline for 3D brain volumes. Registration,
//! resampling, cropping and brain extraction are delegated to an external
//! [`RegistrationEngine`]; this library decides what to do with the results:
//!
//!  - Decompose a registration matrix into per-axis rotation angles and
//!    detect implausible rotations
//!  - Retry registration once on a brain-extracted volume when the rotation
//!    is out of range
//!  - Size the output canvas so the rotated volume is not clipped
//!  - Optionally re-centre the content in the enlarged canvas
//!  - Collapse the aligned volume into thickness-matched mean slabs, in
//!    parallel using rayon
//!
//! Volumes are addressed by path through a [`VolumeStore`]. Depth index 0 is
//! the inferior end of the head; background lies above it.
//!
//! # Roadmap
//!
//!  - NIfTI-backed volume store
//!  - Engine adapter driving FSL command line tools
//!
//! # Examples
//!
//! ## Reading rotation angles from a registration matrix
//!
//! ```
//! # use acpc_align::{AffineMatrix, rotation::rotation_angles_deg};
//! let matrix: AffineMatrix = "1 0 0 0\n0 0 -1 0\n0 1 0 0\n0 0 0 1"
//!     .parse()
//!     .expect("should have parsed matrix");
//! let angles = rotation_angles_deg(&matrix).expect("should have decomposed matrix");
//! assert!((angles.x - 90.0).abs() < 1e-9);
//! ```
//!
//! ## Running an alignment
//!
//! ```no_run
//! # use acpc_align::{AlignmentConfig, AlignmentOrchestrator, AlignmentRequest, MemoryVolumeStore, Modality, RegistrationEngine};
//! # fn align<E: RegistrationEngine>(engine: E) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AlignmentConfig::default().with_slab_thickness(Modality::T2, 5.0);
//! let orchestrator = AlignmentOrchestrator::new(config, engine, MemoryVolumeStore::new())?;
//! let request = AlignmentRequest::new("t2.nii.gz", "mni_t2.nii.gz", Modality::T2, "work")
//!     .with_centering(true);
//! let outcome = orchestrator.run(&request)?;
//! println!("aligned volume at {}", outcome.aligned.display());
//! # Ok(())
//! # }
//! ```

pub mod centering;
pub mod config;
pub mod engine;
pub mod enums;
pub mod error;
pub mod extent;
pub mod matrix;
pub mod orchestrator;
pub mod probe;
pub mod rotation;
pub mod slab;
pub mod store;
pub mod volume;

pub use centering::CenteringAdjuster;
pub use config::{AlignmentConfig, ProbeConfig};
pub use engine::{RegistrationEngine, TimeoutEngine};
pub use enums::{Axis, BoxInset, BoxOrigin, Modality, PipelineState};
pub use error::{AlignError, AlignResult, PipelineFailure};
pub use matrix::AffineMatrix;
pub use orchestrator::{AlignmentOrchestrator, AlignmentOutcome, AlignmentRequest};
pub use probe::{BackgroundProbe, RoiBackgroundProbe};
pub use rotation::RotationTriple;
pub use slab::{SlabGenerator, SlabPlan, SlabPlanner};
pub use store::{MemoryVolumeStore, VolumeStore};
pub use volume::{Volume, VolumeMeta};
