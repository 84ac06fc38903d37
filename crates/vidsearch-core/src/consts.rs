/// The name of the vidsearch folder (like .git)
pub const VS_DIR: &str = ".vidsearch";

/// Default embedding model (CLIP vision/text pair)
pub const DEFAULT_MODEL: &str = "clip-ViT-B-32";

/// Default embedding dimension for clip-ViT-B-32
pub const DEFAULT_DIM: usize = 512;

/// Default sampling interval in seconds
pub const DEFAULT_SAMPLE_INTERVAL_SECS: f64 = 5.0;

/// Default number of frames encoded per batch
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Default size of the preprocessing worker pool
pub const DEFAULT_WORKERS: usize = 4;

/// Default JPEG quality for thumbnails
pub const DEFAULT_THUMBNAIL_QUALITY: u8 = 85;

/// Default longest thumbnail side in pixels
pub const DEFAULT_THUMBNAIL_MAX_SIDE: u32 = 640;

/// Default staging directory for incoming videos, relative to the repo root
pub const DEFAULT_VIDEO_DIR: &str = "videos";

/// Default query inference timeout in seconds
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
