//! Thickness-matched mean slabs.
//!
//! The depth axis runs from the inferior end (slice 0) upwards; the empty
//! space above the head is background. Planning finds where anatomy ends,
//! splits the anatomy into near-equal slabs whose thickness approximates the
//! intended one, and generation averages each slab into one layer of the
//! merged output.

use std::path::{Path, PathBuf};

use ndarray::Axis as ArrayAxis;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::enums::Axis;
use crate::error::{AlignError, AlignResult};
use crate::probe::{BackgroundProbe, RoiBackgroundProbe};
use crate::store::VolumeStore;
use crate::volume::Volume;

/// `floor(value + 0.5)`.
pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

fn round_to_hundredths(value: f64) -> f64 {
    round_half_up(value * 100.0) / 100.0
}

/// Result of the background boundary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    /// Index of the highest slice that contains anatomy.
    pub top_non_background: usize,
    /// Probe invocations spent finding it.
    pub probes: usize,
}

/// Binary search for the highest slice that still contains anatomy.
///
/// Assumes anatomy occupies `[0, k)` and background `[k, depth)`, and returns
/// `k - 1`. When the top slice is not background it is returned without a
/// search. Costs `O(log depth)` probes.
pub fn find_top_non_background<P>(depth: usize, probe: &P) -> AlignResult<Boundary>
where
    P: BackgroundProbe + ?Sized,
{
    let top_index = depth.checked_sub(1).ok_or(AlignError::EmptyVolume)?;

    let mut probes = 1;
    if !probe.is_background(top_index)? {
        return Ok(Boundary {
            top_non_background: top_index,
            probes,
        });
    }
    if top_index == 0 {
        return Err(AlignError::EmptyVolume);
    }

    probes += 1;
    if probe.is_background(0)? {
        return Err(AlignError::EmptyVolume);
    }

    let mut last_background = top_index;
    let mut last_solid = 0;
    while last_background - last_solid > 1 {
        let mid = last_solid + (last_background - last_solid) / 2;
        probes += 1;
        if probe.is_background(mid)? {
            last_background = mid;
        } else {
            last_solid = mid;
        }
    }

    debug!(last_solid, last_background, probes, "Found anatomy boundary");
    Ok(Boundary {
        top_non_background: last_solid,
        probes,
    })
}

/// One slab: `count` slices starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slab {
    pub start: usize,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlabPlan {
    /// Slabs from the top of the anatomy downwards.
    pub slabs: Vec<Slab>,
    pub top_non_background: usize,
    pub num_slabs: usize,
    pub slices_per_slab: usize,
    /// `slices_per_slab * pixdim`, rounded to two decimals (mm).
    pub effective_thickness: f64,
}

/// Partitions the anatomy of a volume into slabs of roughly the intended
/// thickness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlabPlanner {
    intended_thickness: f64,
}

impl SlabPlanner {
    pub fn new(intended_thickness: f64) -> AlignResult<Self> {
        if !intended_thickness.is_finite() || intended_thickness <= 0.0 {
            return Err(AlignError::InvalidConfig(format!(
                "intended slab thickness must be positive, got {intended_thickness}"
            )));
        }
        Ok(Self { intended_thickness })
    }

    pub fn intended_thickness(&self) -> f64 {
        self.intended_thickness
    }

    /// Searches the anatomy boundary with `probe`, then plans from it.
    pub fn plan<P>(&self, depth: usize, pixdim: f64, probe: &P) -> AlignResult<SlabPlan>
    where
        P: BackgroundProbe + ?Sized,
    {
        let boundary = find_top_non_background(depth, probe)?;
        self.plan_from_top(boundary.top_non_background, pixdim)
    }

    /// Plans slabs below `top`, the highest slice with anatomy.
    ///
    /// Slabs end at `top` (exclusive) and step down by `slices_per_slab`
    /// while they fit above slice 0. A `top` of 0 leaves no room for a slab.
    ///
    /// # Example
    ///
    /// ```
    /// use acpc_align::slab::SlabPlanner;
    ///
    /// let plan = SlabPlanner::new(5.0).unwrap().plan_from_top(180, 1.0).unwrap();
    /// assert_eq!(plan.num_slabs, 36);
    /// assert_eq!(plan.slices_per_slab, 5);
    /// assert_eq!(plan.effective_thickness, 5.0);
    /// ```
    pub fn plan_from_top(&self, top: usize, pixdim: f64) -> AlignResult<SlabPlan> {
        if top == 0 {
            return Err(AlignError::EmptyVolume);
        }
        if !pixdim.is_finite() || pixdim <= 0.0 {
            return Err(AlignError::ExtentComputation(format!(
                "depth voxel size must be positive, got {pixdim}"
            )));
        }

        let num_slabs =
            (round_half_up(top as f64 * pixdim / self.intended_thickness) as usize).max(1);
        let slices_per_slab = (round_half_up(top as f64 / num_slabs as f64) as usize).max(1);

        let slabs: Vec<Slab> = (slices_per_slab..=top)
            .rev()
            .step_by(slices_per_slab)
            .map(|end| Slab {
                start: end - slices_per_slab,
                count: slices_per_slab,
            })
            .collect();

        let effective_thickness = round_to_hundredths(slices_per_slab as f64 * pixdim);
        info!(
            top,
            num_slabs,
            slices_per_slab,
            slabs = slabs.len(),
            effective_thickness,
            "Planned mean slabs"
        );

        Ok(SlabPlan {
            slabs,
            top_non_background: top,
            num_slabs,
            slices_per_slab,
            effective_thickness,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlabOutcome {
    pub plan: SlabPlan,
    /// Merged volume, one slice per slab, inferior first.
    pub output: PathBuf,
}

/// Extracts and merges mean slabs on a bounded worker pool.
pub struct SlabGenerator<'a, S: VolumeStore + Sync + ?Sized> {
    store: &'a S,
    workers: usize,
}

impl<'a, S: VolumeStore + Sync + ?Sized> SlabGenerator<'a, S> {
    /// `workers == 0` sizes the pool to the available cores.
    pub fn new(store: &'a S, workers: usize) -> Self {
        Self { store, workers }
    }

    /// Probes, plans and generates slabs for the volume at `source`.
    ///
    /// Per-slab layers land in `work_dir`; the merged result is written to
    /// `output` with its depth voxel size set to the effective thickness.
    pub fn run(
        &self,
        source: &Path,
        intended_thickness: f64,
        probe_config: ProbeConfig,
        work_dir: &Path,
        output: &Path,
    ) -> AlignResult<SlabOutcome> {
        let planner = SlabPlanner::new(intended_thickness)?;
        let probe = RoiBackgroundProbe::new(self.store, source, probe_config)?;
        let meta = *probe.meta();
        let plan = planner.plan(meta.dim(Axis::Z), meta.pixdim(Axis::Z), &probe)?;
        self.generate(source, &plan, work_dir, output)?;
        Ok(SlabOutcome {
            plan,
            output: output.to_path_buf(),
        })
    }

    pub fn generate(
        &self,
        source: &Path,
        plan: &SlabPlan,
        work_dir: &Path,
        output: &Path,
    ) -> AlignResult<()> {
        let volume = self.store.read_volume(source)?;
        let (depth, _, _) = volume.dim();
        // The reducer averages over the full depth; rescale to the slab depth.
        let correction = depth as f32 / plan.slices_per_slab as f32;
        let layer_pixdim = {
            let mut pixdim = volume.pixdim;
            pixdim[Axis::Z.index()] = plan.effective_thickness;
            pixdim
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| AlignError::InvalidConfig(format!("cannot build slab pool: {e}")))?;
        debug!(
            workers = pool.current_num_threads(),
            slabs = plan.slabs.len(),
            "Dispatching slab workers"
        );

        let mut layers: Vec<(usize, PathBuf)> = pool.install(|| {
            plan.slabs
                .par_iter()
                .map(|slab| {
                    let mean = volume.masked_depth_mean(slab.start, slab.count)? * correction;
                    let path = work_dir.join(format!("slab_{:04}", slab.start));
                    self.store.write_volume(
                        &path,
                        Volume::new(mean.insert_axis(ArrayAxis(0)), layer_pixdim),
                    )?;
                    Ok((slab.start, path))
                })
                .collect::<AlignResult<Vec<_>>>()
        })?;

        layers.sort_by_key(|(start, _)| *start);
        let merged_layers = layers
            .iter()
            .map(|(_, path)| {
                let layer = self.store.read_volume(path)?;
                layer
                    .get_slice_from_axis(0, Axis::Z)
                    .map(|slice| slice.to_owned())
                    .ok_or_else(|| AlignError::VolumeStore(format!("{} is empty", path.display())))
            })
            .collect::<AlignResult<Vec<_>>>()?;

        let merged = Volume::stack_layers(&merged_layers, volume.pixdim)?;
        self.store.write_volume(output, merged)?;
        self.store
            .write_adjusted_voxel_size(output, Axis::Z, plan.effective_thickness)?;

        info!(
            output = %output.display(),
            layers = merged_layers.len(),
            thickness = plan.effective_thickness,
            "Merged mean slabs"
        );
        Ok(())
    }
}
