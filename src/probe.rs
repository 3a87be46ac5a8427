use std::path::{Path, PathBuf};

use tracing::trace;

use crate::config::ProbeConfig;
use crate::error::AlignResult;
use crate::store::VolumeStore;
use crate::volume::{Region, VolumeMeta};

/// Classifies a depth slice as background (empty space) or anatomy.
pub trait BackgroundProbe {
    fn is_background(&self, slice: usize) -> AlignResult<bool>;
}

impl<F> BackgroundProbe for F
where
    F: Fn(usize) -> AlignResult<bool>,
{
    fn is_background(&self, slice: usize) -> AlignResult<bool> {
        self(slice)
    }
}

/// Checks a small central square of each slice: the slice is background
/// when no voxel there rises above the configured background level.
pub struct RoiBackgroundProbe<'a, S: VolumeStore + ?Sized> {
    store: &'a S,
    path: PathBuf,
    meta: VolumeMeta,
    config: ProbeConfig,
}

impl<'a, S: VolumeStore + ?Sized> RoiBackgroundProbe<'a, S> {
    pub fn new(store: &'a S, path: &Path, config: ProbeConfig) -> AlignResult<Self> {
        let meta = store.read_meta(path)?;
        Ok(Self {
            store,
            path: path.to_path_buf(),
            meta,
            config,
        })
    }

    pub fn meta(&self) -> &VolumeMeta {
        &self.meta
    }
}

impl<S: VolumeStore + ?Sized> BackgroundProbe for RoiBackgroundProbe<'_, S> {
    fn is_background(&self, slice: usize) -> AlignResult<bool> {
        let region = Region::central_square(&self.meta, slice, self.config.half_width);
        let stats = self.store.read_region_stats(&self.path, &region)?;
        let background = stats.max <= self.config.background_level;
        trace!(slice, max = stats.max, background, "Probed slice");
        Ok(background)
    }
}
