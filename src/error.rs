use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::enums::PipelineState;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("Malformed affine matrix: {0}")]
    MalformedMatrix(String),

    #[error("Affine matrix is not invertible")]
    SingularMatrix,

    #[error("Registration engine failed during {operation}: {message}")]
    RegistrationEngine {
        operation: &'static str,
        message: String,
    },

    #[error("Registration engine timed out during {operation} after {timeout:?}")]
    EngineTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("No non-background slice found in volume")]
    EmptyVolume,

    #[error("Cannot compute extent: {0}")]
    ExtentComputation(String),

    #[error("Volume not found: {}", .0.display())]
    VolumeNotFound(PathBuf),

    #[error("Volume store error: {0}")]
    VolumeStore(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AlignError {
    pub fn engine(operation: &'static str, message: impl Into<String>) -> Self {
        AlignError::RegistrationEngine {
            operation,
            message: message.into(),
        }
    }
}

pub type AlignResult<T> = Result<T, AlignError>;

/// An alignment run that ended in [`PipelineState::Failed`].
///
/// `trace` lists every state the run entered, ending with `Failed`.
#[derive(Debug, Error)]
#[error("Alignment failed: {error}")]
pub struct PipelineFailure {
    pub trace: Vec<PipelineState>,
    #[source]
    pub error: AlignError,
}

impl PipelineFailure {
    /// The last state reached before the run failed.
    pub fn last_completed(&self) -> PipelineState {
        self.trace
            .iter()
            .rev()
            .copied()
            .find(|state| *state != PipelineState::Failed)
            .unwrap_or(PipelineState::Initial)
    }
}
