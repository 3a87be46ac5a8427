//! The registration engine contract.
//!
//! Registration, resampling, cropping and brain extraction are performed by
//! an external engine. Every call is synchronous and blocking; the engine
//! reads and writes volumes by path inside the run's working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::warn;

use crate::error::{AlignError, AlignResult};
use crate::matrix::AffineMatrix;

pub trait RegistrationEngine {
    /// 12-DOF registration of `moving` onto `fixed`, searching rotations
    /// within `±search_range_deg` about each axis.
    fn register(
        &self,
        moving: &Path,
        fixed: &Path,
        search_range_deg: f64,
    ) -> AlignResult<AffineMatrix>;

    /// Nearest 6-DOF (rotation + translation) equivalent of `matrix`.
    fn rigid_approximation(&self, matrix: &AffineMatrix) -> AlignResult<AffineMatrix>;

    fn extract_brain(&self, volume: &Path, output: &Path) -> AlignResult<()>;

    /// Resamples `volume` onto the grid of `target_grid` using `matrix` as
    /// the pre-transform.
    fn resample(
        &self,
        volume: &Path,
        target_grid: &Path,
        matrix: &AffineMatrix,
        output: &Path,
    ) -> AlignResult<()>;

    /// Crops the field of view around the brain. Returns the transform from
    /// the cropped grid back to the full one.
    fn crop_to_brain(&self, volume: &Path, output: &Path) -> AlignResult<AffineMatrix>;

    /// Sets negative intensities to zero.
    fn clip_negative(&self, volume: &Path, output: &Path) -> AlignResult<()>;
}

impl<E: RegistrationEngine + ?Sized> RegistrationEngine for Arc<E> {
    fn register(
        &self,
        moving: &Path,
        fixed: &Path,
        search_range_deg: f64,
    ) -> AlignResult<AffineMatrix> {
        (**self).register(moving, fixed, search_range_deg)
    }

    fn rigid_approximation(&self, matrix: &AffineMatrix) -> AlignResult<AffineMatrix> {
        (**self).rigid_approximation(matrix)
    }

    fn extract_brain(&self, volume: &Path, output: &Path) -> AlignResult<()> {
        (**self).extract_brain(volume, output)
    }

    fn resample(
        &self,
        volume: &Path,
        target_grid: &Path,
        matrix: &AffineMatrix,
        output: &Path,
    ) -> AlignResult<()> {
        (**self).resample(volume, target_grid, matrix, output)
    }

    fn crop_to_brain(&self, volume: &Path, output: &Path) -> AlignResult<AffineMatrix> {
        (**self).crop_to_brain(volume, output)
    }

    fn clip_negative(&self, volume: &Path, output: &Path) -> AlignResult<()> {
        (**self).clip_negative(volume, output)
    }
}

/// Wraps an engine so every call is bounded by a wall-clock timeout.
///
/// Calls run on tokio's blocking pool. An expired call is a hard failure;
/// the engine itself cannot be interrupted, so the abandoned call is left to
/// finish in the background. Must not be used from within an async context.
///
/// Without a timeout, calls go straight to the wrapped engine on the
/// calling thread.
pub struct TimeoutEngine<E> {
    inner: Arc<E>,
    timeout: Option<Duration>,
    runtime: Option<Runtime>,
}

impl<E> TimeoutEngine<E>
where
    E: RegistrationEngine + Send + Sync + 'static,
{
    pub fn new(engine: E, timeout: Duration) -> AlignResult<Self> {
        Self::bounded(engine, Some(timeout))
    }

    /// Bounds calls by `timeout` when one is given, as read from
    /// [`AlignmentConfig::engine_timeout`](crate::AlignmentConfig::engine_timeout).
    pub fn bounded(engine: E, timeout: Option<Duration>) -> AlignResult<Self> {
        let runtime = match timeout {
            Some(_) => Some(Builder::new_current_thread().enable_time().build()?),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(engine),
            timeout,
            runtime,
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn call<T, F>(&self, operation: &'static str, f: F) -> AlignResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&E) -> AlignResult<T> + Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return f(&*self.inner);
        };
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| AlignError::engine(operation, "runtime already shut down"))?;
        let inner = Arc::clone(&self.inner);

        runtime.block_on(async move {
            let task = tokio::task::spawn_blocking(move || f(&*inner));
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(AlignError::engine(operation, join_error.to_string())),
                Err(_) => {
                    warn!(operation, ?timeout, "Engine call timed out");
                    Err(AlignError::EngineTimeout { operation, timeout })
                }
            }
        })
    }
}

impl<E> Drop for TimeoutEngine<E> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl<E> RegistrationEngine for TimeoutEngine<E>
where
    E: RegistrationEngine + Send + Sync + 'static,
{
    fn register(
        &self,
        moving: &Path,
        fixed: &Path,
        search_range_deg: f64,
    ) -> AlignResult<AffineMatrix> {
        let (moving, fixed) = (moving.to_path_buf(), fixed.to_path_buf());
        self.call("register", move |engine| {
            engine.register(&moving, &fixed, search_range_deg)
        })
    }

    fn rigid_approximation(&self, matrix: &AffineMatrix) -> AlignResult<AffineMatrix> {
        let matrix = *matrix;
        self.call("rigid_approximation", move |engine| {
            engine.rigid_approximation(&matrix)
        })
    }

    fn extract_brain(&self, volume: &Path, output: &Path) -> AlignResult<()> {
        let (volume, output) = owned(volume, output);
        self.call("extract_brain", move |engine| {
            engine.extract_brain(&volume, &output)
        })
    }

    fn resample(
        &self,
        volume: &Path,
        target_grid: &Path,
        matrix: &AffineMatrix,
        output: &Path,
    ) -> AlignResult<()> {
        let (volume, output) = owned(volume, output);
        let (target_grid, matrix) = (target_grid.to_path_buf(), *matrix);
        self.call("resample", move |engine| {
            engine.resample(&volume, &target_grid, &matrix, &output)
        })
    }

    fn crop_to_brain(&self, volume: &Path, output: &Path) -> AlignResult<AffineMatrix> {
        let (volume, output) = owned(volume, output);
        self.call("crop_to_brain", move |engine| {
            engine.crop_to_brain(&volume, &output)
        })
    }

    fn clip_negative(&self, volume: &Path, output: &Path) -> AlignResult<()> {
        let (volume, output) = owned(volume, output);
        self.call("clip_negative", move |engine| {
            engine.clip_negative(&volume, &output)
        })
    }
}

fn owned(volume: &Path, output: &Path) -> (PathBuf, PathBuf) {
    (volume.to_path_buf(), output.to_path_buf())
}
