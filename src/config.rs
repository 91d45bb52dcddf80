/// Streaming engine configuration
///
/// Loaded from TOML; every field has a default so partial files are fine.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OctreeError, OctreeResult, PersistenceErrorContext};

/// How many layers around the camera node the prefetcher pulls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalLayers {
    /// Ancestors to climb from the node containing the camera
    pub parent_depth: u32,
    /// Levels to descend below the anchor ancestor
    pub descendant_depth: u32,
}

impl Default for AdditionalLayers {
    fn default() -> Self {
        Self {
            parent_depth: 1,
            descendant_depth: 2,
        }
    }
}

/// Configuration for building and streaming a star octree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Leaf capacity before a split, and cap on inner-node payloads
    pub max_stars_per_node: u32,

    /// Nodes at this depth never split
    pub max_depth: u32,

    /// Half the edge length of the root cube, centered on the origin
    pub root_half_extent: f32,

    /// Fixed stride used to subsample payloads into LOD slices
    pub lod_stride: u32,

    /// Share of installed RAM usable for resident payloads (0..=100)
    pub cpu_ram_percent: f32,

    /// Share of video memory usable for chunk slots (0..=100)
    pub gpu_memory_percent: f32,

    /// Projected size in pixels below which a node is drawn without recursion
    pub lod_pixel_threshold: f32,

    /// Prefetch neighbourhood around the camera
    pub additional_layers: AdditionalLayers,

    /// Background fetch worker count
    pub fetch_threads: usize,

    /// Frame boundaries a released slot waits before reuse
    pub frames_in_flight: u32,

    /// Discrete per-chunk buffers (true) or one indexed storage buffer (false)
    pub use_vbo: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_stars_per_node: 50_000,
            max_depth: 16,
            root_half_extent: 100_000.0,
            lod_stride: 8,
            cpu_ram_percent: 50.0,
            gpu_memory_percent: 50.0,
            lod_pixel_threshold: 250.0,
            additional_layers: AdditionalLayers::default(),
            fetch_threads: num_cpus::get().clamp(1, 4),
            frames_in_flight: 1,
            use_vbo: true,
        }
    }
}

impl StreamingConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> OctreeResult<Self> {
        let config: StreamingConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> OctreeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).persistence_context(path)?;
        let config = Self::from_toml_str(&raw)?;
        log::info!("[StreamingConfig::from_file] Loaded {}", path.display());
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> OctreeResult<()> {
        if self.max_stars_per_node == 0 {
            return Err(OctreeError::InvalidConfig(
                "max_stars_per_node must be at least 1".to_string(),
            ));
        }
        if !(self.root_half_extent.is_finite() && self.root_half_extent > 0.0) {
            return Err(OctreeError::InvalidConfig(format!(
                "root_half_extent must be positive, got {}",
                self.root_half_extent
            )));
        }
        if self.lod_stride == 0 {
            return Err(OctreeError::InvalidConfig(
                "lod_stride must be at least 1".to_string(),
            ));
        }
        validate_percent("cpu_ram_percent", self.cpu_ram_percent)?;
        validate_percent("gpu_memory_percent", self.gpu_memory_percent)?;
        if !(self.lod_pixel_threshold > 0.0) {
            return Err(OctreeError::InvalidConfig(format!(
                "lod_pixel_threshold must be positive, got {}",
                self.lod_pixel_threshold
            )));
        }
        if self.fetch_threads == 0 {
            return Err(OctreeError::InvalidConfig(
                "fetch_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_percent(name: &str, value: f32) -> OctreeResult<()> {
    if value.is_finite() && value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(OctreeError::InvalidConfig(format!(
            "{} must be in (0, 100], got {}",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_stars_per_node, 50_000);
        assert!(config.fetch_threads >= 1 && config.fetch_threads <= 4);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = StreamingConfig::from_toml_str(
            r#"
            max_stars_per_node = 128
            gpu_memory_percent = 25.0

            [additional_layers]
            parent_depth = 2
            descendant_depth = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.max_stars_per_node, 128);
        assert_eq!(config.gpu_memory_percent, 25.0);
        assert_eq!(config.additional_layers.parent_depth, 2);
        assert_eq!(config.lod_stride, 8);
    }

    #[test]
    fn test_rejects_bad_percent() {
        let err = StreamingConfig::from_toml_str("cpu_ram_percent = 150.0").unwrap_err();
        assert!(matches!(err, OctreeError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = StreamingConfig::from_toml_str("max_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, OctreeError::ConfigParse(_)));
    }
}
