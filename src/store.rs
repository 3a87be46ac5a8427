use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::enums::Axis;
use crate::error::{AlignError, AlignResult};
use crate::volume::{Region, RegionStats, Volume, VolumeMeta};

/// Access to volumes addressed by path.
///
/// Implementations must tolerate concurrent writes to distinct paths; slab
/// workers write their layers in parallel.
pub trait VolumeStore {
    fn read_meta(&self, path: &Path) -> AlignResult<VolumeMeta>;

    fn read_region_stats(&self, path: &Path, region: &Region) -> AlignResult<RegionStats>;

    /// Creates a zero-filled volume at `path` shaped like `template`, with the
    /// voxel count along `axis` replaced by `dim`.
    fn create_empty_like(
        &self,
        template: &VolumeMeta,
        axis: Axis,
        dim: usize,
        path: &Path,
    ) -> AlignResult<VolumeMeta>;

    fn write_adjusted_voxel_size(&self, path: &Path, axis: Axis, value: f64) -> AlignResult<()>;

    fn read_volume(&self, path: &Path) -> AlignResult<Volume>;

    fn write_volume(&self, path: &Path, volume: Volume) -> AlignResult<()>;
}

impl<S: VolumeStore + ?Sized> VolumeStore for Arc<S> {
    fn read_meta(&self, path: &Path) -> AlignResult<VolumeMeta> {
        (**self).read_meta(path)
    }

    fn read_region_stats(&self, path: &Path, region: &Region) -> AlignResult<RegionStats> {
        (**self).read_region_stats(path, region)
    }

    fn create_empty_like(
        &self,
        template: &VolumeMeta,
        axis: Axis,
        dim: usize,
        path: &Path,
    ) -> AlignResult<VolumeMeta> {
        (**self).create_empty_like(template, axis, dim, path)
    }

    fn write_adjusted_voxel_size(&self, path: &Path, axis: Axis, value: f64) -> AlignResult<()> {
        (**self).write_adjusted_voxel_size(path, axis, value)
    }

    fn read_volume(&self, path: &Path) -> AlignResult<Volume> {
        (**self).read_volume(path)
    }

    fn write_volume(&self, path: &Path, volume: Volume) -> AlignResult<()> {
        (**self).write_volume(path, volume)
    }
}

/// A [`VolumeStore`] that keeps every volume in memory.
#[derive(Debug, Default)]
pub struct MemoryVolumeStore {
    volumes: RwLock<HashMap<PathBuf, Volume>>,
}

impl MemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, volume: Volume) -> AlignResult<()> {
        self.write_guard()?.insert(path.into(), volume);
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.read_guard()
            .map(|volumes| volumes.contains_key(path))
            .unwrap_or(false)
    }

    fn read_guard(&self) -> AlignResult<RwLockReadGuard<'_, HashMap<PathBuf, Volume>>> {
        self.volumes
            .read()
            .map_err(|_| AlignError::VolumeStore("volume map lock poisoned".into()))
    }

    fn write_guard(&self) -> AlignResult<RwLockWriteGuard<'_, HashMap<PathBuf, Volume>>> {
        self.volumes
            .write()
            .map_err(|_| AlignError::VolumeStore("volume map lock poisoned".into()))
    }

    fn with_volume<T>(&self, path: &Path, f: impl FnOnce(&Volume) -> AlignResult<T>) -> AlignResult<T> {
        let volumes = self.read_guard()?;
        let volume = volumes
            .get(path)
            .ok_or_else(|| AlignError::VolumeNotFound(path.to_path_buf()))?;
        f(volume)
    }
}

impl VolumeStore for MemoryVolumeStore {
    fn read_meta(&self, path: &Path) -> AlignResult<VolumeMeta> {
        self.with_volume(path, |volume| Ok(volume.meta()))
    }

    fn read_region_stats(&self, path: &Path, region: &Region) -> AlignResult<RegionStats> {
        self.with_volume(path, |volume| volume.region_stats(region))
    }

    fn create_empty_like(
        &self,
        template: &VolumeMeta,
        axis: Axis,
        dim: usize,
        path: &Path,
    ) -> AlignResult<VolumeMeta> {
        let meta = template.with_dim(axis, dim);
        meta.validate().map_err(AlignError::VolumeStore)?;
        debug!(path = %path.display(), dim = ?meta.dim, "Creating empty volume");
        self.insert(path, Volume::zeros(&meta))?;
        Ok(meta)
    }

    fn write_adjusted_voxel_size(&self, path: &Path, axis: Axis, value: f64) -> AlignResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(AlignError::VolumeStore(format!(
                "voxel size {value} along {axis} is not positive"
            )));
        }
        let mut volumes = self.write_guard()?;
        let volume = volumes
            .get_mut(path)
            .ok_or_else(|| AlignError::VolumeNotFound(path.to_path_buf()))?;
        volume.pixdim[axis.index()] = value;
        Ok(())
    }

    fn read_volume(&self, path: &Path) -> AlignResult<Volume> {
        self.with_volume(path, |volume| Ok(volume.clone()))
    }

    fn write_volume(&self, path: &Path, volume: Volume) -> AlignResult<()> {
        self.insert(path, volume)
    }
}
