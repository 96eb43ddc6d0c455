//! Slide metadata descriptor for `.fastpath` directories.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// The only `tile_format` value this engine knows how to read.
const SUPPORTED_TILE_FORMAT: &str = "pack_v2";

/// Format versions this engine recognizes. Unknown versions are accepted
/// with a warning (forward-compatible metadata), per spec.
const KNOWN_VERSIONS: &[&str] = &["1", "1.0", "2"];

/// Per-level pyramid geometry, as stored in `metadata.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelInfo {
    pub level: u32,
    pub downsample: u32,
    pub cols: u32,
    pub rows: u32,
}

/// Slide descriptor loaded from `metadata.json`.
///
/// Produced by the external preprocessor; consumed read-only by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SlideDescriptor {
    pub version: String,
    pub source_file: String,
    pub source_mpp: f64,
    pub target_mpp: f64,
    pub target_magnification: f64,
    pub tile_size: u32,
    pub dimensions: (u32, u32),
    pub levels: Vec<LevelInfo>,
    pub background_color: (u8, u8, u8),
    pub preprocessed_at: String,
    pub tile_format: String,
}

impl SlideDescriptor {
    /// Load and validate metadata from a `.fastpath` directory.
    ///
    /// Rejects unsupported `tile_format` with `FormatVersion`; warns (but
    /// accepts) unrecognized `version` strings.
    pub fn load(fastpath_dir: &Path) -> EngineResult<Self> {
        let metadata_path = fastpath_dir.join("metadata.json");
        if !metadata_path.exists() {
            return Err(EngineError::NotFound(format!(
                "metadata.json not found in {:?}",
                fastpath_dir
            )));
        }

        let content = std::fs::read_to_string(&metadata_path)?;
        let metadata: SlideDescriptor = serde_json::from_str(&content)?;

        if metadata.tile_size < 64 {
            return Err(EngineError::IndexCorrupt(format!(
                "tile_size {} is below the minimum of 64",
                metadata.tile_size
            )));
        }

        if metadata.tile_format != SUPPORTED_TILE_FORMAT {
            return Err(EngineError::FormatVersion(format!(
                "unsupported tile_format {:?}, expected {:?}",
                metadata.tile_format, SUPPORTED_TILE_FORMAT
            )));
        }

        if !KNOWN_VERSIONS.contains(&metadata.version.as_str()) {
            warn!(version = %metadata.version, "unrecognized metadata version, proceeding");
        }

        Ok(metadata)
    }

    /// Get level info by level number.
    pub fn get_level(&self, level: u32) -> Option<&LevelInfo> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// Total number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Highest (finest-resolution) level number.
    pub fn max_level(&self) -> u32 {
        self.levels.iter().map(|l| l.level).max().unwrap_or(0)
    }
}
