//! Configuration handling for .vidsearch/config.json

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_BATCH_SIZE, DEFAULT_DIM, DEFAULT_MODEL, DEFAULT_QUERY_TIMEOUT_SECS,
    DEFAULT_SAMPLE_INTERVAL_SECS, DEFAULT_THUMBNAIL_MAX_SIDE, DEFAULT_THUMBNAIL_QUALITY,
    DEFAULT_VIDEO_DIR, DEFAULT_WORKERS, Result, VsError, discover, embed,
};

/// Configuration stored in .vidsearch/config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Embedding model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_dim")]
    pub dimension: usize,

    /// Seconds between sampled frames
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: f64,

    /// Frames encoded per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Preprocessing worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// JPEG quality for thumbnails (1-100)
    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,

    /// Longest thumbnail side in pixels (0 keeps the frame size)
    #[serde(default = "default_thumbnail_max_side")]
    pub thumbnail_max_side: u32,

    /// Staging directory for videos, relative to the repo root
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    /// File extensions that count as video assets
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Query inference timeout in seconds (0 disables it)
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dim() -> usize {
    DEFAULT_DIM
}

fn default_sample_interval() -> f64 {
    DEFAULT_SAMPLE_INTERVAL_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_thumbnail_quality() -> u8 {
    DEFAULT_THUMBNAIL_QUALITY
}

fn default_thumbnail_max_side() -> u32 {
    DEFAULT_THUMBNAIL_MAX_SIDE
}

fn default_video_dir() -> PathBuf {
    PathBuf::from(DEFAULT_VIDEO_DIR)
}

fn default_video_extensions() -> Vec<String> {
    vec!["mp4".to_string()]
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimension: default_dim(),
            sample_interval_secs: default_sample_interval(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            thumbnail_quality: default_thumbnail_quality(),
            thumbnail_max_side: default_thumbnail_max_side(),
            video_dir: default_video_dir(),
            video_extensions: default_video_extensions(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Config {
    /// Load config from the .vidsearch directory.
    pub fn load(root: &Path) -> Result<Self> {
        let path = discover::config_path(root);
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save config to the .vidsearch directory.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = discover::config_path(root);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(VsError::Config("dimension must be positive".into()));
        }
        if !(self.sample_interval_secs.is_finite() && self.sample_interval_secs > 0.0) {
            return Err(VsError::Config(format!(
                "sample_interval_secs must be positive, got {}",
                self.sample_interval_secs
            )));
        }
        if self.batch_size == 0 {
            return Err(VsError::Config("batch_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(VsError::Config("workers must be positive".into()));
        }
        if !(1..=100).contains(&self.thumbnail_quality) {
            return Err(VsError::Config(format!(
                "thumbnail_quality must be within 1..=100, got {}",
                self.thumbnail_quality
            )));
        }
        if !embed::SUPPORTED_MODELS.contains(&self.model.as_str()) {
            return Err(VsError::Config(format!(
                "Unknown model: {}. Supported: {}",
                self.model,
                embed::SUPPORTED_MODELS.join(", ")
            )));
        }
        Ok(())
    }

    /// Absolute staging directory for a repository root.
    pub fn video_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.video_dir)
    }

    /// Query timeout, if one is configured.
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_secs > 0).then(|| Duration::from_secs(self.query_timeout_secs))
    }
}
