//! Process-wide handles shared by the builder and the search engine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    ClipEncoder, Config, Encoder, FfmpegDecoder, Result, ThumbnailStore, VideoDecoder, discover,
    embed::UnloadedEncoder,
};

/// Owns the repository root, its config, the embedding model and the video
/// decoder. Built once at startup and passed to [`crate::IndexBuilder`] and
/// [`crate::SearchEngine`]. The index and ledger are not held here: each of
/// those loads its own copy from the persisted files.
#[derive(Clone)]
pub struct Context {
    root: PathBuf,
    config: Config,
    encoder: Arc<dyn Encoder>,
    decoder: Arc<dyn VideoDecoder>,
}

impl Context {
    /// Load config for `root` and initialize the CLIP encoder and ffmpeg decoder.
    pub fn open(root: PathBuf) -> Result<Self> {
        let config = Config::load(&root)?;
        let encoder = Arc::new(ClipEncoder::new(&config)?);
        Ok(Self::with_parts(
            root,
            config,
            encoder,
            Arc::new(FfmpegDecoder::default()),
        ))
    }

    /// Like [`Context::open`] but without loading a model, for commands that
    /// only inspect or remove persisted files.
    pub fn open_without_model(root: PathBuf) -> Result<Self> {
        let config = Config::load(&root)?;
        let encoder = Arc::new(UnloadedEncoder::new(config.dimension));
        Ok(Self::with_parts(
            root,
            config,
            encoder,
            Arc::new(FfmpegDecoder::default()),
        ))
    }

    /// Assemble a context from explicit parts.
    pub fn with_parts(
        root: PathBuf,
        config: Config,
        encoder: Arc<dyn Encoder>,
        decoder: Arc<dyn VideoDecoder>,
    ) -> Self {
        Self {
            root,
            config,
            encoder,
            decoder,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    pub fn decoder(&self) -> &Arc<dyn VideoDecoder> {
        &self.decoder
    }

    pub fn index_path(&self) -> PathBuf {
        discover::index_path(&self.root)
    }

    pub fn ledger_path(&self) -> PathBuf {
        discover::ledger_path(&self.root)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        discover::tmp_dir(&self.root)
    }

    pub fn video_dir(&self) -> PathBuf {
        self.config.video_dir(&self.root)
    }

    pub fn thumbnails(&self) -> ThumbnailStore {
        ThumbnailStore::new(
            discover::thumbnails_dir(&self.root),
            self.config.thumbnail_quality,
            self.config.thumbnail_max_side,
        )
    }
}
