//! The alignment state machine.
//!
//! A run moves strictly forward through
//! `Initial -> Cropped -> Registered -> RotationChecked -> Sized ->
//! [Centered] -> Finalized`. When the rotation check fails, the run takes the
//! single rescue branch `RotationChecked -> Retrying -> Registered ->
//! RotationChecked` with a brain-extracted moving volume and then continues
//! whatever the second check says. Any error ends the run in `Failed`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::centering::CenteringAdjuster;
use crate::config::AlignmentConfig;
use crate::engine::{RegistrationEngine, TimeoutEngine};
use crate::enums::{Axis, Modality, PipelineState};
use crate::error::{AlignError, AlignResult, PipelineFailure};
use crate::extent::transformed_dim;
use crate::matrix::AffineMatrix;
use crate::rotation::{RotationTriple, rotation_angles_deg};
use crate::slab::{SlabGenerator, SlabOutcome};
use crate::store::VolumeStore;
use crate::volume::VolumeMeta;

/// Everything one run needs to know about its input.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRequest {
    pub input: PathBuf,
    pub template: PathBuf,
    pub modality: Modality,
    /// Exclusively owned by this run.
    pub work_dir: PathBuf,
    pub center: bool,
}

impl AlignmentRequest {
    pub fn new(
        input: impl Into<PathBuf>,
        template: impl Into<PathBuf>,
        modality: Modality,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: input.into(),
            template: template.into(),
            modality,
            work_dir: work_dir.into(),
            center: false,
        }
    }

    #[must_use]
    pub fn with_centering(mut self, center: bool) -> Self {
        self.center = center;
        self
    }

    fn work_file(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }
}

/// A registration result and the rotation read from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationAttempt {
    /// Rigid matrix mapping the full input into template space.
    pub matrix: AffineMatrix,
    pub rotations: RotationTriple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentOutcome {
    pub aligned: PathBuf,
    /// Final matrix as persisted next to the aligned volume.
    pub matrix: AffineMatrix,
    pub matrix_path: PathBuf,
    pub rotations: RotationTriple,
    /// Whether the brain-extraction rescue ran.
    pub rescued: bool,
    pub canvas: VolumeMeta,
    pub slabs: Option<SlabOutcome>,
    pub trace: Vec<PipelineState>,
}

/// Volume handed to the registration engine.
struct MovingVolume {
    path: PathBuf,
    /// Full grid to cropped grid, when a crop ran.
    full_to_roi: Option<AffineMatrix>,
}

struct Run {
    state: PipelineState,
    trace: Vec<PipelineState>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PipelineState::Initial,
            trace: vec![PipelineState::Initial],
        }
    }

    fn enter(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        info!(from = %self.state, to = %next, "Pipeline transition");
        self.state = next;
        self.trace.push(next);
    }
}

pub struct AlignmentOrchestrator<E, S> {
    config: AlignmentConfig,
    engine: E,
    store: S,
}

impl<E, S> AlignmentOrchestrator<TimeoutEngine<E>, S>
where
    E: RegistrationEngine + Send + Sync + 'static,
    S: VolumeStore + Sync,
{
    /// Wraps `engine` so each call honours `config.engine_timeout_secs`.
    pub fn with_engine_timeout(config: AlignmentConfig, engine: E, store: S) -> AlignResult<Self> {
        config.validate()?;
        let engine = TimeoutEngine::bounded(engine, config.engine_timeout())?;
        Self::new(config, engine, store)
    }
}

impl<E, S> AlignmentOrchestrator<E, S>
where
    E: RegistrationEngine,
    S: VolumeStore + Sync,
{
    pub fn new(config: AlignmentConfig, engine: E, store: S) -> AlignResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            store,
        })
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one alignment. On failure nothing is published and the returned
    /// [`PipelineFailure`] carries the states visited.
    pub fn run(&self, request: &AlignmentRequest) -> Result<AlignmentOutcome, PipelineFailure> {
        let mut run = Run::new();
        info!(
            input = %request.input.display(),
            modality = %request.modality,
            center = request.center,
            "Starting alignment"
        );

        match self.execute(request, &mut run) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(state = %run.state, %error, "Alignment failed");
                run.enter(PipelineState::Failed);
                Err(PipelineFailure {
                    trace: run.trace,
                    error,
                })
            }
        }
    }

    /// Rotation of `matrix` and the axes beyond the configured threshold.
    pub fn check_rotation(&self, matrix: &AffineMatrix) -> AlignResult<(RotationTriple, Vec<Axis>)> {
        let rotations = rotation_angles_deg(matrix)?;
        let exceeding = rotations.axes_exceeding(self.config.rotation_threshold_deg);
        Ok((rotations, exceeding))
    }

    fn execute(&self, request: &AlignmentRequest, run: &mut Run) -> AlignResult<AlignmentOutcome> {
        fs::create_dir_all(&request.work_dir)?;
        let input_meta = self.store.read_meta(&request.input)?;
        input_meta.validate().map_err(AlignError::VolumeStore)?;

        let moving = self.prepare(request, &input_meta)?;
        run.enter(PipelineState::Cropped);

        let mut attempt = self.register(request, &moving)?;
        run.enter(PipelineState::Registered);
        let mut exceeding = self.check(&attempt)?;
        run.enter(PipelineState::RotationChecked);

        let rescued = !exceeding.is_empty();
        if rescued {
            run.enter(PipelineState::Retrying);
            warn!(
                rotations = ?attempt.rotations,
                axes = ?exceeding,
                threshold = self.config.rotation_threshold_deg,
                "Rotation beyond threshold, retrying with brain extraction"
            );
            let stripped = request.work_file("moving_brain.nii.gz");
            self.engine.extract_brain(&moving.path, &stripped)?;
            let rescue = MovingVolume {
                path: stripped,
                full_to_roi: moving.full_to_roi,
            };

            attempt = self.register(request, &rescue)?;
            run.enter(PipelineState::Registered);
            exceeding = self.check(&attempt)?;
            run.enter(PipelineState::RotationChecked);
            if !exceeding.is_empty() {
                warn!(
                    rotations = ?attempt.rotations,
                    axes = ?exceeding,
                    "Rotation still beyond threshold after rescue, continuing with rescue result"
                );
            }
        }

        let depth = transformed_dim(
            &input_meta,
            &attempt.matrix,
            Axis::Z,
            input_meta.pixdim(Axis::Z),
        )?;
        let canvas_path = request.work_file("canvas.nii.gz");
        let canvas = self
            .store
            .create_empty_like(&input_meta, Axis::Z, depth, &canvas_path)?;
        info!(
            original = input_meta.dim(Axis::Z),
            sized = depth,
            "Sized output canvas"
        );
        run.enter(PipelineState::Sized);

        let matrix = if request.center {
            // The template grid is where the content is expected to sit.
            let reference = self.store.read_meta(&request.template)?;
            let centered = CenteringAdjuster::new(&reference, &canvas).apply(&attempt.matrix);
            run.enter(PipelineState::Centered);
            centered
        } else {
            attempt.matrix
        };

        let aligned = request.work_file("aligned.nii.gz");
        self.engine
            .resample(&request.input, &canvas_path, &matrix, &aligned)?;
        let matrix_path = request.work_file("aligned.mat");
        matrix.write_to_file(&matrix_path)?;
        run.enter(PipelineState::Finalized);

        let slabs = self.mean_slabs(request, &aligned)?;

        Ok(AlignmentOutcome {
            aligned,
            matrix,
            matrix_path,
            rotations: attempt.rotations,
            rescued,
            canvas,
            slabs,
            trace: run.trace.clone(),
        })
    }

    /// Intensity cleanup and crop ahead of registration.
    fn prepare(
        &self,
        request: &AlignmentRequest,
        input_meta: &VolumeMeta,
    ) -> AlignResult<MovingVolume> {
        let mut path = request.input.clone();

        if self.config.clips_negative(request.modality) {
            let clipped = request.work_file("input_clipped.nii.gz");
            self.engine.clip_negative(&path, &clipped)?;
            debug!(modality = %request.modality, "Clipped negative intensities");
            path = clipped;
        }

        let fov = input_meta.fov(Axis::Z);
        if fov <= self.config.crop_threshold_mm {
            debug!(fov, threshold = self.config.crop_threshold_mm, "Skipping crop");
            return Ok(MovingVolume {
                path,
                full_to_roi: None,
            });
        }

        let cropped = request.work_file("input_cropped.nii.gz");
        let roi_to_full = self.engine.crop_to_brain(&path, &cropped)?;
        debug!(fov, "Cropped field of view");
        Ok(MovingVolume {
            path: cropped,
            full_to_roi: Some(roi_to_full.inverse()?),
        })
    }

    fn register(
        &self,
        request: &AlignmentRequest,
        moving: &MovingVolume,
    ) -> AlignResult<RegistrationAttempt> {
        let affine =
            self.engine
                .register(&moving.path, &request.template, self.config.search_range_deg)?;
        let affine = match moving.full_to_roi {
            Some(full_to_roi) => affine.compose(&full_to_roi),
            None => affine,
        };
        let matrix = self.engine.rigid_approximation(&affine)?;
        let rotations = rotation_angles_deg(&matrix)?;
        debug!(
            x = rotations.x,
            y = rotations.y,
            z = rotations.z,
            moving = %moving.path.display(),
            "Registered"
        );
        Ok(RegistrationAttempt { matrix, rotations })
    }

    fn check(&self, attempt: &RegistrationAttempt) -> AlignResult<Vec<Axis>> {
        self.check_rotation(&attempt.matrix).map(|(_, axes)| axes)
    }

    fn mean_slabs(
        &self,
        request: &AlignmentRequest,
        aligned: &Path,
    ) -> AlignResult<Option<SlabOutcome>> {
        let Some(thickness) = self.config.slab_thickness(request.modality) else {
            return Ok(None);
        };

        let generator = SlabGenerator::new(&self.store, self.config.slab_workers);
        let output = request.work_file("aligned_slabs.nii.gz");
        match generator.run(
            aligned,
            thickness,
            self.config.probe,
            &request.work_dir,
            &output,
        ) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(AlignError::EmptyVolume) => {
                warn!(
                    aligned = %aligned.display(),
                    "No anatomy found for mean slabs, keeping unsliced volume"
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::rotation_affine;
    use crate::store::MemoryVolumeStore;
    use crate::volume::Volume;
    use approx::assert_relative_eq;
    use ndarray::Array3;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Registration engine that replays scripted rotations and renders
    /// `solid_slices` of anatomy into every resampled volume.
    struct ScriptedEngine {
        store: Arc<MemoryVolumeStore>,
        rotations: Mutex<VecDeque<RotationTriple>>,
        roi_to_full: AffineMatrix,
        solid_slices: usize,
        fail_register: bool,
        calls: Mutex<Vec<(&'static str, PathBuf)>>,
    }

    impl ScriptedEngine {
        fn new(store: Arc<MemoryVolumeStore>, rotations: &[RotationTriple]) -> Self {
            Self {
                store,
                rotations: Mutex::new(rotations.iter().copied().collect()),
                roi_to_full: AffineMatrix::identity(),
                solid_slices: usize::MAX,
                fail_register: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, operation: &'static str, path: &Path) {
            self.calls
                .lock()
                .unwrap()
                .push((operation, path.to_path_buf()));
        }

        fn calls_to(&self, operation: &str) -> Vec<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(op, _)| *op == operation)
                .map(|(_, path)| path.clone())
                .collect()
        }
    }

    impl RegistrationEngine for ScriptedEngine {
        fn register(&self, moving: &Path, _: &Path, _: f64) -> AlignResult<AffineMatrix> {
            self.record("register", moving);
            if self.fail_register {
                return Err(AlignError::engine("register", "flirt exited with status 1"));
            }
            let mut rotations = self.rotations.lock().unwrap();
            let angles = if rotations.len() > 1 {
                rotations.pop_front()
            } else {
                rotations.front().copied()
            };
            angles
                .map(rotation_affine)
                .ok_or_else(|| AlignError::engine("register", "no scripted rotation"))
        }

        fn rigid_approximation(&self, matrix: &AffineMatrix) -> AlignResult<AffineMatrix> {
            Ok(*matrix)
        }

        fn extract_brain(&self, volume: &Path, _: &Path) -> AlignResult<()> {
            self.record("extract_brain", volume);
            Ok(())
        }

        fn resample(
            &self,
            volume: &Path,
            target_grid: &Path,
            _: &AffineMatrix,
            output: &Path,
        ) -> AlignResult<()> {
            self.record("resample", volume);
            let [x, y, z] = self.store.read_meta(target_grid)?.dim;
            let pixdim = self.store.read_meta(target_grid)?.pixdim;
            let solid = self.solid_slices;
            let data = Array3::from_shape_fn((z, y, x), |(k, _, _)| if k < solid { 10.0 } else { 0.0 });
            self.store.insert(output, Volume::new(data, pixdim))
        }

        fn crop_to_brain(&self, volume: &Path, _: &Path) -> AlignResult<AffineMatrix> {
            self.record("crop_to_brain", volume);
            Ok(self.roi_to_full)
        }

        fn clip_negative(&self, volume: &Path, _: &Path) -> AlignResult<()> {
            self.record("clip_negative", volume);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryVolumeStore>,
        work: tempfile::TempDir,
    }

    impl Fixture {
        fn new(dim: [usize; 3]) -> Self {
            let store = Arc::new(MemoryVolumeStore::new());
            store
                .insert(
                    "input.nii.gz",
                    Volume::zeros(&VolumeMeta::new(dim, [1.0, 1.0, 1.0])),
                )
                .unwrap();
            Self {
                store,
                work: tempfile::tempdir().unwrap(),
            }
        }

        fn engine(&self, rotations: &[RotationTriple]) -> ScriptedEngine {
            ScriptedEngine::new(Arc::clone(&self.store), rotations)
        }

        fn request(&self, modality: Modality) -> AlignmentRequest {
            AlignmentRequest::new(
                "input.nii.gz",
                "template.nii.gz",
                modality,
                self.work.path().join("run"),
            )
        }

        fn orchestrator(
            &self,
            config: AlignmentConfig,
            engine: ScriptedEngine,
        ) -> AlignmentOrchestrator<ScriptedEngine, Arc<MemoryVolumeStore>> {
            AlignmentOrchestrator::new(config, engine, Arc::clone(&self.store)).unwrap()
        }
    }

    fn roll(degrees: f64) -> RotationTriple {
        RotationTriple::new(degrees, 0.0, 0.0)
    }

    use PipelineState::*;

    #[test]
    fn test_small_rotation_goes_straight_through() {
        let fixture = Fixture::new([256, 256, 180]);
        let orchestrator =
            fixture.orchestrator(AlignmentConfig::default(), fixture.engine(&[roll(20.0)]));
        let request = fixture.request(Modality::T1);

        let outcome = orchestrator.run(&request).unwrap();

        assert_eq!(
            outcome.trace,
            vec![Initial, Cropped, Registered, RotationChecked, Sized, Finalized]
        );
        assert!(!outcome.rescued);
        assert_relative_eq!(outcome.rotations.x, 20.0, epsilon = 1e-9);
        assert_eq!(outcome.canvas.dim, [256, 256, 257]);
        assert_eq!(orchestrator.engine().calls_to("register").len(), 1);
        // 180 mm of depth is above the default crop threshold.
        assert_eq!(orchestrator.engine().calls_to("crop_to_brain").len(), 1);
        assert!(outcome.slabs.is_none());

        let persisted = AffineMatrix::read_from_file(&outcome.matrix_path).unwrap();
        assert_eq!(persisted, outcome.matrix);
        assert_eq!(
            orchestrator.store().read_meta(&outcome.aligned).unwrap(),
            outcome.canvas
        );
    }

    #[test]
    fn test_large_rotation_triggers_single_rescue() {
        let fixture = Fixture::new([64, 64, 48]);
        let orchestrator = fixture.orchestrator(
            AlignmentConfig::default(),
            fixture.engine(&[roll(60.0), roll(10.0)]),
        );
        let request = fixture.request(Modality::T1);

        let outcome = orchestrator.run(&request).unwrap();

        assert_eq!(
            outcome.trace,
            vec![
                Initial,
                Cropped,
                Registered,
                RotationChecked,
                Retrying,
                Registered,
                RotationChecked,
                Sized,
                Finalized
            ]
        );
        assert!(outcome.rescued);
        assert_relative_eq!(outcome.rotations.x, 10.0, epsilon = 1e-9);

        let engine = orchestrator.engine();
        assert_eq!(engine.calls_to("extract_brain"), vec![request.input.clone()]);
        assert_eq!(
            engine.calls_to("register"),
            vec![
                request.input.clone(),
                request.work_dir.join("moving_brain.nii.gz")
            ]
        );
        assert!(engine.calls_to("crop_to_brain").is_empty());
    }

    #[test]
    fn test_rescue_still_beyond_threshold_continues() {
        let fixture = Fixture::new([64, 64, 48]);
        let orchestrator = fixture.orchestrator(
            AlignmentConfig::default(),
            fixture.engine(&[roll(60.0), roll(-50.0)]),
        );

        let outcome = orchestrator.run(&fixture.request(Modality::T2)).unwrap();

        let retries = outcome.trace.iter().filter(|s| **s == Retrying).count();
        assert_eq!(retries, 1);
        assert_eq!(outcome.trace.last(), Some(&Finalized));
        assert_relative_eq!(outcome.rotations.x, -50.0, epsilon = 1e-9);
        assert_eq!(orchestrator.engine().calls_to("register").len(), 2);
    }

    #[test]
    fn test_crop_inverse_is_concatenated() {
        let fixture = Fixture::new([64, 64, 200]);
        let mut engine = fixture.engine(&[roll(20.0)]);
        engine.roi_to_full = AffineMatrix::identity().with_translation_component(Axis::Z, 40.0);
        let orchestrator = fixture.orchestrator(AlignmentConfig::default(), engine);
        let request = fixture.request(Modality::T1);

        let outcome = orchestrator.run(&request).unwrap();

        let full_to_roi = AffineMatrix::identity().with_translation_component(Axis::Z, -40.0);
        let expected = rotation_affine(roll(20.0)).compose(&full_to_roi);
        for (got, want) in outcome.matrix.rows().iter().zip(expected.rows()) {
            for (g, w) in got.iter().zip(want) {
                assert_relative_eq!(*g, w, epsilon = 1e-9);
            }
        }
        assert_eq!(
            orchestrator.engine().calls_to("register"),
            vec![request.work_dir.join("input_cropped.nii.gz")]
        );
        // The final resample always reads the uncropped input.
        assert_eq!(
            orchestrator.engine().calls_to("resample"),
            vec![request.input.clone()]
        );
    }

    #[test]
    fn test_crop_skipped_below_threshold() {
        let fixture = Fixture::new([64, 64, 200]);
        let config = AlignmentConfig::default().with_crop_threshold(250.0);
        let orchestrator = fixture.orchestrator(config, fixture.engine(&[roll(5.0)]));

        let outcome = orchestrator.run(&fixture.request(Modality::T1)).unwrap();

        assert!(orchestrator.engine().calls_to("crop_to_brain").is_empty());
        assert_eq!(outcome.trace[1], Cropped);
    }

    #[test]
    fn test_centering_uses_template_grid() {
        let fixture = Fixture::new([64, 64, 48]);
        let template = VolumeMeta::new([256, 256, 180], [1.0, 1.0, 1.0]);
        fixture
            .store
            .insert("template.nii.gz", Volume::zeros(&template))
            .unwrap();
        let orchestrator =
            fixture.orchestrator(AlignmentConfig::default(), fixture.engine(&[roll(20.0)]));
        let request = fixture.request(Modality::T1).with_centering(true);

        let outcome = orchestrator.run(&request).unwrap();

        assert_eq!(
            outcome.trace,
            vec![
                Initial,
                Cropped,
                Registered,
                RotationChecked,
                Sized,
                Centered,
                Finalized
            ]
        );
        assert_eq!(outcome.canvas.dim[..2], [64, 64]);
        let uncentered = rotation_affine(roll(20.0));
        // (256 - 64) / 2 mm on each in-plane axis
        assert_relative_eq!(outcome.matrix.get(0, 3), uncentered.get(0, 3) + 96.0);
        assert_relative_eq!(outcome.matrix.get(1, 3), uncentered.get(1, 3) + 96.0);
        assert_eq!(outcome.matrix.get(2, 3), uncentered.get(2, 3));
        assert_eq!(outcome.matrix.linear(), uncentered.linear());
    }

    #[test]
    fn test_centering_needs_template_meta() {
        let fixture = Fixture::new([64, 64, 48]);
        let orchestrator =
            fixture.orchestrator(AlignmentConfig::default(), fixture.engine(&[roll(20.0)]));
        let request = fixture.request(Modality::T1).with_centering(true);

        let failure = orchestrator.run(&request).unwrap_err();

        assert_eq!(failure.last_completed(), Sized);
        assert!(orchestrator.engine().calls_to("resample").is_empty());
    }

    #[test]
    fn test_rescue_on_reference_grid_sizes_after_retry() {
        let fixture = Fixture::new([256, 256, 180]);
        let orchestrator = fixture.orchestrator(
            AlignmentConfig::default(),
            fixture.engine(&[roll(60.0), roll(10.0)]),
        );

        let outcome = orchestrator.run(&fixture.request(Modality::T1)).unwrap();

        let position = |state: PipelineState| outcome.trace.iter().position(|s| *s == state);
        let retries = outcome.trace.iter().filter(|s| **s == Retrying).count();
        assert_eq!(retries, 1);
        assert!(position(Retrying) < position(Sized));
        assert!(position(Sized).is_some());
        assert_eq!(outcome.trace.last(), Some(&Finalized));
        assert!(outcome.rescued);
        assert_relative_eq!(outcome.rotations.x, 10.0, epsilon = 1e-9);
        assert!(outcome.canvas.dim[2] >= 180);
        assert_eq!(outcome.canvas.dim[..2], [256, 256]);
        assert_eq!(orchestrator.engine().calls_to("register").len(), 2);
    }

    #[test]
    fn test_negative_intensities_clipped_for_ct() {
        let fixture = Fixture::new([64, 64, 48]);
        let orchestrator =
            fixture.orchestrator(AlignmentConfig::default(), fixture.engine(&[roll(0.0)]));
        let request = fixture.request(Modality::Ct);

        orchestrator.run(&request).unwrap();

        let engine = orchestrator.engine();
        assert_eq!(engine.calls_to("clip_negative"), vec![request.input.clone()]);
        assert_eq!(
            engine.calls_to("register"),
            vec![request.work_dir.join("input_clipped.nii.gz")]
        );
    }

    #[test]
    fn test_mean_slabs_follow_finalize() {
        let fixture = Fixture::new([32, 32, 40]);
        let mut engine = fixture.engine(&[roll(0.0)]);
        engine.solid_slices = 31;
        let config = AlignmentConfig::default()
            .with_slab_thickness(Modality::T2, 5.0)
            .with_slab_workers(2);
        let orchestrator = fixture.orchestrator(config, engine);
        let request = fixture.request(Modality::T2);

        let outcome = orchestrator.run(&request).unwrap();

        let slabs = outcome.slabs.expect("slabs should have been generated");
        assert_eq!(slabs.plan.top_non_background, 30);
        assert_eq!(slabs.plan.num_slabs, 6);
        assert_eq!(slabs.plan.slices_per_slab, 5);
        assert_eq!(slabs.plan.effective_thickness, 5.0);

        let merged = orchestrator.store().read_volume(&slabs.output).unwrap();
        assert_eq!(merged.dim(), (6, 32, 32));
        assert_eq!(merged.pixdim[2], 5.0);
        for value in merged.data().iter() {
            assert_relative_eq!(*value, 10.0, epsilon = 1e-5);
        }
        assert!(
            orchestrator
                .store()
                .contains(&request.work_dir.join("slab_0000"))
        );
    }

    #[test]
    fn test_empty_aligned_volume_keeps_unsliced_result() {
        let fixture = Fixture::new([32, 32, 40]);
        let mut engine = fixture.engine(&[roll(0.0)]);
        engine.solid_slices = 0;
        let config = AlignmentConfig::default().with_slab_thickness(Modality::T2, 5.0);
        let orchestrator = fixture.orchestrator(config, engine);

        let outcome = orchestrator.run(&fixture.request(Modality::T2)).unwrap();

        assert!(outcome.slabs.is_none());
        assert_eq!(outcome.trace.last(), Some(&Finalized));
    }

    #[test]
    fn test_engine_failure_reports_trace() {
        let fixture = Fixture::new([64, 64, 48]);
        let mut engine = fixture.engine(&[roll(0.0)]);
        engine.fail_register = true;
        let orchestrator = fixture.orchestrator(AlignmentConfig::default(), engine);
        let request = fixture.request(Modality::T1);

        let failure = orchestrator.run(&request).unwrap_err();

        assert_eq!(failure.trace, vec![Initial, Cropped, Failed]);
        assert_eq!(failure.last_completed(), Cropped);
        assert!(matches!(
            failure.error,
            AlignError::RegistrationEngine {
                operation: "register",
                ..
            }
        ));
        assert!(!request.work_dir.join("aligned.mat").exists());
        assert!(orchestrator.engine().calls_to("resample").is_empty());
    }

    #[test]
    fn test_missing_input_fails_before_cropping() {
        let fixture = Fixture::new([64, 64, 48]);
        let orchestrator =
            fixture.orchestrator(AlignmentConfig::default(), fixture.engine(&[roll(0.0)]));
        let mut request = fixture.request(Modality::T1);
        request.input = PathBuf::from("missing.nii.gz");

        let failure = orchestrator.run(&request).unwrap_err();

        assert_eq!(failure.trace, vec![Initial, Failed]);
        assert!(matches!(failure.error, AlignError::VolumeNotFound(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fixture = Fixture::new([8, 8, 8]);
        let config = AlignmentConfig::default().with_rotation_threshold(0.0);
        let result = AlignmentOrchestrator::new(
            config,
            fixture.engine(&[roll(0.0)]),
            Arc::clone(&fixture.store),
        );
        assert!(matches!(result, Err(AlignError::InvalidConfig(_))));
    }
}
