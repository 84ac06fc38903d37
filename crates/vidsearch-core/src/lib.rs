//! vidsearch-core: Semantic video frame search library
//!
//! This library samples frames from staged video files, embeds them with a
//! CLIP model into a space shared with text queries, and keeps an append-only
//! vector index in lockstep with an ordered metadata ledger.

use std::path::PathBuf;
use std::time::Duration;

pub mod build;
pub mod config;
pub mod consts;
pub mod context;
pub mod discover;
pub mod embed;
pub mod ledger;
pub mod sampler;
pub mod search;
pub mod thumbnail;
pub mod vector_index;

pub use build::{BuildState, BuildStats, IndexBuilder, VerifyReport};
pub use config::Config;
pub use consts::*;
pub use context::Context;
pub use discover::find_vs_root;
pub use embed::{ClipEncoder, Embedding, Encoder, EncoderInput};
pub use ledger::{FrameRecord, MetadataLedger};
pub use sampler::{FfmpegDecoder, FrameSampler, FrameSource, SampledFrame, VideoDecoder};
pub use search::{Query, SearchEngine, SearchHit};
pub use thumbnail::ThumbnailStore;
pub use vector_index::{VectorIndex, similarity};

#[derive(Debug, thiserror::Error)]
pub enum VsError {
    #[error("Not in a vidsearch repository (no .vidsearch folder found)")]
    NotInRepo,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Acquisition error: {0}")]
    Acquisition(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl VsError {
    /// Whether this error must abort the whole build instead of skipping
    /// a single frame or asset.
    pub fn is_build_fatal(&self) -> bool {
        matches!(
            self,
            VsError::Persistence(_) | VsError::Consistency(_) | VsError::Io(_) | VsError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VsError>;
