//! Alignment configuration.
//!
//! All thresholds live in one explicit struct handed to the orchestrator at
//! construction, so independent runs may use different settings side by side.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enums::Modality;
use crate::error::{AlignError, AlignResult};

/// Background probe settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Half the side length, in voxels, of the central square probed per slice.
    pub half_width: usize,
    /// Intensities at or below this level count as background.
    pub background_level: f32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            half_width: 5,
            background_level: 0.0,
        }
    }
}

/// Configuration for an alignment run.
///
/// # Example
///
/// ```
/// use acpc_align::{AlignmentConfig, Modality};
///
/// let config = AlignmentConfig::default()
///     .with_rotation_threshold(90.0)
///     .with_slab_thickness(Modality::T2, 5.0);
/// assert_eq!(config.slab_thickness(Modality::T2), Some(5.0));
/// assert_eq!(config.slab_thickness(Modality::T1), None);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// An absolute rotation above this on any axis counts as mis-registration.
    pub rotation_threshold_deg: f64,

    /// Rotation search range handed to the registration engine, per axis.
    pub search_range_deg: f64,

    /// Inputs whose depth field of view exceeds this are cropped first.
    pub crop_threshold_mm: f64,

    /// Modalities whose negative intensities are clipped before registration.
    pub clip_negative_modalities: Vec<Modality>,

    /// Intended slab thickness per modality. Zero or negative disables slabs.
    pub slab_thickness_mm: BTreeMap<Modality, f64>,

    /// Slab worker threads (0 = available cores).
    pub slab_workers: usize,

    /// Wall-clock limit per engine call, in seconds.
    pub engine_timeout_secs: Option<u64>,

    pub probe: ProbeConfig,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            rotation_threshold_deg: 45.0,
            search_range_deg: 30.0,
            crop_threshold_mm: 170.0,
            clip_negative_modalities: vec![Modality::Ct],
            slab_thickness_mm: BTreeMap::new(),
            slab_workers: 0,
            engine_timeout_secs: None,
            probe: ProbeConfig::default(),
        }
    }
}

impl AlignmentConfig {
    pub fn from_json_str(json: &str) -> AlignResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> AlignResult<Self> {
        Self::from_json_str(&std::fs::read_to_string(path.as_ref())?)
    }

    #[must_use]
    pub fn with_rotation_threshold(mut self, degrees: f64) -> Self {
        self.rotation_threshold_deg = degrees;
        self
    }

    #[must_use]
    pub fn with_search_range(mut self, degrees: f64) -> Self {
        self.search_range_deg = degrees;
        self
    }

    #[must_use]
    pub fn with_crop_threshold(mut self, mm: f64) -> Self {
        self.crop_threshold_mm = mm;
        self
    }

    #[must_use]
    pub fn with_slab_thickness(mut self, modality: Modality, mm: f64) -> Self {
        self.slab_thickness_mm.insert(modality, mm);
        self
    }

    #[must_use]
    pub fn with_slab_workers(mut self, workers: usize) -> Self {
        self.slab_workers = workers;
        self
    }

    #[must_use]
    pub fn with_engine_timeout(mut self, seconds: u64) -> Self {
        self.engine_timeout_secs = Some(seconds);
        self
    }

    /// Intended slab thickness for `modality`, or `None` when slab generation
    /// is disabled for it.
    pub fn slab_thickness(&self, modality: Modality) -> Option<f64> {
        self.slab_thickness_mm
            .get(&modality)
            .copied()
            .filter(|mm| *mm > 0.0)
    }

    pub fn clips_negative(&self, modality: Modality) -> bool {
        self.clip_negative_modalities.contains(&modality)
    }

    pub fn engine_timeout(&self) -> Option<Duration> {
        self.engine_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> AlignResult<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(AlignError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )))
            }
        };
        positive("rotation_threshold_deg", self.rotation_threshold_deg)?;
        positive("search_range_deg", self.search_range_deg)?;
        positive("crop_threshold_mm", self.crop_threshold_mm)?;
        if self.slab_thickness_mm.values().any(|mm| mm.is_nan()) {
            return Err(AlignError::InvalidConfig(
                "slab thickness must be a number".into(),
            ));
        }
        if self.probe.half_width == 0 {
            return Err(AlignError::InvalidConfig(
                "probe.half_width must be at least 1".into(),
            ));
        }
        if self.engine_timeout_secs == Some(0) {
            return Err(AlignError::InvalidConfig(
                "engine_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AlignmentConfig::default();
        assert_eq!(config.rotation_threshold_deg, 45.0);
        assert_eq!(config.search_range_deg, 30.0);
        assert!(config.clips_negative(Modality::Ct));
        assert!(!config.clips_negative(Modality::T1));
        assert!(config.engine_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = AlignmentConfig::from_json_str(
            r#"{
                "rotation_threshold_deg": 90.0,
                "slab_thickness_mm": { "T2": 5.0, "Flair": 0.0 },
                "probe": { "half_width": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.rotation_threshold_deg, 90.0);
        assert_eq!(config.search_range_deg, 30.0);
        assert_eq!(config.slab_thickness(Modality::T2), Some(5.0));
        assert_eq!(config.slab_thickness(Modality::Flair), None);
        assert_eq!(config.probe.half_width, 3);
        assert_eq!(config.probe.background_level, 0.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = AlignmentConfig::from_json_str(r#"{ "rotation_threshold_deg": -1.0 }"#);
        assert!(matches!(result, Err(AlignError::InvalidConfig(_))));
        assert!(
            AlignmentConfig::default()
                .with_engine_timeout(0)
                .validate()
                .is_err()
        );
        assert!(matches!(
            AlignmentConfig::from_json_str("{ not json"),
            Err(AlignError::Json(_))
        ));
    }

    #[test]
    fn test_zero_half_width_rejected() {
        let result = AlignmentConfig::from_json_str(r#"{ "probe": { "half_width": 0 } }"#);
        assert!(matches!(result, Err(AlignError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("align.json");
        let config = AlignmentConfig::default()
            .with_search_range(20.0)
            .with_crop_threshold(150.0);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = AlignmentConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.search_range_deg, 20.0);
        assert_eq!(loaded, config);
        assert!(AlignmentConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = AlignmentConfig::default()
            .with_slab_thickness(Modality::T1, 4.0)
            .with_engine_timeout(600);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(AlignmentConfig::from_json_str(&json).unwrap(), config);
    }
}
