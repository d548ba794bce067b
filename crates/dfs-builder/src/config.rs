//! Build configuration.

use crate::category::Category;
use dfs_compress::{Algorithm, CompressionSpec};
use dfs_error::{DfsError, Result};
use dfs_types::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;
const DEFAULT_DEDUP_WINDOW: u32 = 64 * 1024;

/// Compression choice per content category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryCompression {
    pub binary: CompressionSpec,
    pub text: CompressionSpec,
    pub incompressible: CompressionSpec,
}

impl Default for CategoryCompression {
    fn default() -> Self {
        Self {
            binary: CompressionSpec::new(Algorithm::Zstd, None),
            text: CompressionSpec::new(Algorithm::Brotli, None),
            incompressible: CompressionSpec::new(Algorithm::Store, None),
        }
    }
}

impl CategoryCompression {
    /// Same codec settings for every category.
    #[must_use]
    pub const fn uniform(spec: CompressionSpec) -> Self {
        Self {
            binary: spec,
            text: spec,
            incompressible: spec,
        }
    }

    #[must_use]
    pub fn for_category(&self, category: Category) -> CompressionSpec {
        match category {
            Category::Binary => self.binary,
            Category::Text => self.text,
            Category::Incompressible => self.incompressible,
        }
    }
}

/// What to do when a fingerprint matches but the bytes differ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Fail the build with `CollisionIntegrity`.
    #[default]
    Abort,
    /// Keep the new content as its own payload.
    StoreSeparately,
}

/// Builder tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Target uncompressed bytes per block.
    pub block_size: u32,
    pub compression: CategoryCompression,
    /// Level for categories that leave theirs unset.
    pub compression_level: Option<i32>,
    /// Compression threads. `0` compresses on the calling thread.
    pub worker_count: usize,
    /// Candidate chunk size for fingerprinting; clamped to `block_size`.
    pub dedup_window: u32,
    /// Emit frames in block-id order so equal inputs give equal images.
    pub reproducible: bool,
    pub on_collision: CollisionPolicy,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CategoryCompression::default(),
            compression_level: None,
            worker_count: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            reproducible: true,
            on_collision: CollisionPolicy::Abort,
        }
    }
}

impl BuilderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DfsError::InvalidConfig(format!("builder config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(DfsError::InvalidConfig(format!(
                "block_size {} outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]",
                self.block_size
            )));
        }
        if self.dedup_window == 0 {
            return Err(DfsError::InvalidConfig(
                "dedup_window must be > 0".to_owned(),
            ));
        }
        for category in Category::ALL {
            self.compression
                .for_category(category)
                .validate()
                .map_err(|e| DfsError::InvalidConfig(format!("{category} compression: {e}")))?;
        }
        Ok(())
    }

    /// Effective candidate chunk size.
    #[must_use]
    pub fn window(&self) -> u32 {
        self.dedup_window.min(self.block_size)
    }

    /// Algorithm and level used for blocks of `category`.
    #[must_use]
    pub fn codec_for(&self, category: Category) -> (Algorithm, i32) {
        let spec = self.compression.for_category(category);
        (spec.algorithm, spec.effective_level(self.compression_level))
    }
}
