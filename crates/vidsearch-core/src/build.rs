//! Index building: sample, embed, write thumbnails, append, checkpoint
//!
//! Each staged video is processed as a unit. Its rows are appended to the
//! in-memory index and ledger batch by batch, then both are written to
//! temporary files and renamed into place. Only after that checkpoint is the
//! source video deleted, so an interrupted asset is simply processed again on
//! the next run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;

use crate::sampler::{self, SampledFrame};
use crate::{
    Context, Embedding, FrameSampler, MetadataLedger, Result, ThumbnailStore, VectorIndex, VsError,
    discover,
};

/// Progress events emitted during a build.
#[derive(Debug, Clone)]
pub enum ProgressEvent<'a> {
    /// Starting work on an asset.
    Asset {
        current: usize,
        total: usize,
        path: &'a Path,
    },
    /// A batch of frames was appended.
    Batch { video_id: &'a str, frames: usize },
    /// An asset was checkpointed; `rows` is the new index size.
    Checkpointed { video_id: &'a str, rows: usize },
}

/// Type alias for progress callback.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send>;

/// Where the builder is in its per-asset cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildState {
    Idle,
    ProcessingAsset {
        video_id: String,
    },
    Checkpointing {
        video_id: String,
    },
    /// A persistence or consistency failure; cleared only by [`IndexBuilder::reset`].
    Failed {
        reason: String,
    },
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::Idle => write!(f, "idle"),
            BuildState::ProcessingAsset { video_id } => write!(f, "processing {}", video_id),
            BuildState::Checkpointing { video_id } => write!(f, "checkpointing {}", video_id),
            BuildState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Stats from a build run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BuildStats {
    pub assets_seen: usize,
    pub assets_indexed: usize,
    pub assets_skipped: usize,
    pub assets_already_indexed: usize,
    pub frames_indexed: usize,
    pub frames_skipped: usize,
}

/// Summary of a successful verification.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VerifyReport {
    pub rows: usize,
    pub videos: usize,
}

/// Load the persisted index and ledger and check that they describe the same
/// rows: equal counts, matching row keys, the configured dimension, and a
/// thumbnail on disk for every record.
///
/// An absent index and ledger is a valid empty state.
pub fn load_checked(ctx: &Context) -> Result<(VectorIndex, MetadataLedger)> {
    let index_path = ctx.index_path();
    let ledger_path = ctx.ledger_path();

    let (index, ledger) = match (index_path.exists(), ledger_path.exists()) {
        (false, false) => {
            return Ok((
                VectorIndex::new(ctx.config().dimension),
                MetadataLedger::new(),
            ));
        }
        (true, true) => (
            VectorIndex::load(&index_path)?,
            MetadataLedger::load(&ledger_path)?,
        ),
        (true, false) => {
            return Err(VsError::Consistency(format!(
                "index exists but ledger {} is missing",
                ledger_path.display()
            )));
        }
        (false, true) => {
            return Err(VsError::Consistency(format!(
                "ledger exists but index {} is missing",
                index_path.display()
            )));
        }
    };

    if index.dimension() != ctx.config().dimension {
        return Err(VsError::Consistency(format!(
            "index dimension {} does not match configured dimension {}",
            index.dimension(),
            ctx.config().dimension
        )));
    }

    if index.len() != ledger.len() {
        return Err(VsError::Consistency(format!(
            "index has {} rows but ledger has {} records",
            index.len(),
            ledger.len()
        )));
    }

    for (position, record) in ledger.records().iter().enumerate() {
        let key = index.key(position);
        if key != Some(position as u64) || record.row != position as u64 {
            return Err(VsError::Consistency(format!(
                "row {} is keyed {:?} in the index and {} in the ledger",
                position, key, record.row
            )));
        }
        if !record.thumbnail_path.exists() {
            return Err(VsError::Consistency(format!(
                "missing thumbnail: {}",
                record.thumbnail_path.display()
            )));
        }
    }

    Ok((index, ledger))
}

/// Run [`load_checked`] and summarize the result.
pub fn verify(ctx: &Context) -> Result<VerifyReport> {
    let (_, ledger) = load_checked(ctx)?;
    let videos: HashSet<&str> = ledger
        .records()
        .iter()
        .map(|r| r.video_id.as_str())
        .collect();
    Ok(VerifyReport {
        rows: ledger.len(),
        videos: videos.len(),
    })
}

/// The index builder turns staged videos into index rows.
pub struct IndexBuilder {
    ctx: Context,
    thumbnails: ThumbnailStore,
    index: VectorIndex,
    ledger: MetadataLedger,
    /// Row count of the last checkpoint
    committed: usize,
    pool: rayon::ThreadPool,
    state: BuildState,
    progress_callback: Option<ProgressCallback>,
}

impl IndexBuilder {
    /// Create a builder on top of the persisted state.
    ///
    /// If the persisted state is inconsistent the builder starts out
    /// [`BuildState::Failed`] and refuses to build until [`IndexBuilder::reset`].
    pub fn new(ctx: &Context) -> Result<Self> {
        std::fs::create_dir_all(discover::vs_dir(ctx.root()))?;
        std::fs::create_dir_all(ctx.tmp_dir())?;
        let thumbnails = ctx.thumbnails();
        std::fs::create_dir_all(thumbnails.dir())?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.config().workers)
            .thread_name(|i| format!("vidsearch-worker-{}", i))
            .build()
            .map_err(|e| VsError::Config(e.to_string()))?;

        let (index, ledger, state) = match load_checked(ctx) {
            Ok((index, ledger)) => (index, ledger, BuildState::Idle),
            Err(e) => {
                tracing::error!("Persisted index is unusable: {}", e);
                (
                    VectorIndex::new(ctx.config().dimension),
                    MetadataLedger::new(),
                    BuildState::Failed {
                        reason: e.to_string(),
                    },
                )
            }
        };
        let committed = index.len();

        Ok(Self {
            ctx: ctx.clone(),
            thumbnails,
            index,
            ledger,
            committed,
            pool,
            state,
            progress_callback: None,
        })
    }

    /// Set a callback to receive progress updates during a build.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    /// Emit a progress event if a callback is registered.
    fn emit_progress(&self, event: ProgressEvent) {
        if let Some(ref callback) = self.progress_callback {
            callback(event);
        }
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    /// Rows in the last checkpoint.
    pub fn count(&self) -> usize {
        self.committed
    }

    /// Staged videos waiting to be indexed.
    pub fn discover_assets(&self) -> Vec<PathBuf> {
        discover::find_assets(&self.ctx.video_dir(), &self.ctx.config().video_extensions)
    }

    /// Index every asset in `assets`, checkpointing after each one.
    ///
    /// Unreadable assets and frames are skipped. Persistence failures stop the
    /// build and leave the builder `Failed`; the interrupted asset keeps its
    /// source file and is processed again on the next run.
    pub fn build(&mut self, assets: &[PathBuf]) -> Result<BuildStats> {
        if let BuildState::Failed { reason } = &self.state {
            return Err(VsError::Consistency(format!(
                "builder is in a failed state, rebuild required: {}",
                reason
            )));
        }

        let mut stats = BuildStats {
            assets_seen: assets.len(),
            ..BuildStats::default()
        };
        tracing::info!("Found {} videos to process", assets.len());

        for (i, path) in assets.iter().enumerate() {
            self.emit_progress(ProgressEvent::Asset {
                current: i + 1,
                total: assets.len(),
                path,
            });

            let video_id = match sampler::video_id(path) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    stats.assets_skipped += 1;
                    continue;
                }
            };

            // Checkpointed earlier but the source survived (crash before delete).
            if self.ledger.contains_video(&video_id) {
                tracing::info!("{} is already indexed, removing source", video_id);
                remove_source(path);
                stats.assets_already_indexed += 1;
                continue;
            }

            self.state = BuildState::ProcessingAsset {
                video_id: video_id.clone(),
            };
            let (indexed, skipped) = match self.process_asset(path) {
                Ok(counts) => counts,
                Err(e) if !e.is_build_fatal() => {
                    tracing::warn!("Skipping video {}: {}", path.display(), e);
                    self.rollback();
                    self.state = BuildState::Idle;
                    stats.assets_skipped += 1;
                    continue;
                }
                Err(e) => return Err(self.fail(e)),
            };

            self.state = BuildState::Checkpointing {
                video_id: video_id.clone(),
            };
            if let Err(e) = self.checkpoint() {
                return Err(self.fail(e));
            }
            self.committed = self.index.len();
            self.emit_progress(ProgressEvent::Checkpointed {
                video_id: &video_id,
                rows: self.committed,
            });

            if indexed == 0 {
                tracing::warn!("No frames of {} could be indexed", video_id);
            }
            tracing::info!("Processed {} frames from {}", indexed, video_id);
            remove_source(path);

            stats.assets_indexed += 1;
            stats.frames_indexed += indexed;
            stats.frames_skipped += skipped;
            self.state = BuildState::Idle;
        }

        self.cleanup();
        tracing::info!(
            "Database built successfully. Total entries: {}",
            self.committed
        );
        Ok(stats)
    }

    /// Check the persisted state; any violation leaves the builder `Failed`.
    pub fn verify(&mut self) -> Result<VerifyReport> {
        match verify(&self.ctx) {
            Ok(report) => {
                tracing::info!("Database verification successful");
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Database verification failed: {}", e);
                self.state = BuildState::Failed {
                    reason: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Remove the index, ledger and every thumbnail, returning to an empty `Idle` state.
    pub fn reset(&mut self) -> Result<()> {
        for path in [self.ctx.index_path(), self.ctx.ledger_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        self.thumbnails.clear()?;

        self.index = VectorIndex::new(self.ctx.config().dimension);
        self.ledger = MetadataLedger::new();
        self.committed = 0;
        self.state = BuildState::Idle;
        tracing::info!("Index reset");
        Ok(())
    }

    /// Sample and append one asset. Returns `(frames indexed, frames skipped)`.
    fn process_asset(&mut self, path: &Path) -> Result<(usize, usize)> {
        let config = self.ctx.config();
        let batch_size = config.batch_size;
        let mut sampler = FrameSampler::open(
            self.ctx.decoder().as_ref(),
            path,
            config.sample_interval_secs,
        )?;
        tracing::info!("Processing video: {}", sampler.video_id());

        let mut indexed = 0;
        let mut skipped = 0;
        loop {
            let batch: Vec<SampledFrame> = sampler.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let (ok, failed) = self.process_batch(batch)?;
            indexed += ok;
            skipped += failed;
        }
        // A decoder that stopped early must not look like a short video.
        sampler.finish()?;

        Ok((indexed, skipped + sampler.skipped()))
    }

    /// Encode a batch, write its thumbnails, then append index rows and ledger
    /// records for every frame that made it. Returns `(appended, skipped)`.
    fn process_batch(&mut self, frames: Vec<SampledFrame>) -> Result<(usize, usize)> {
        let encoder = Arc::clone(self.ctx.encoder());
        let thumbnails = &self.thumbnails;

        let outcomes: Vec<Result<(Embedding, PathBuf)>> = self.pool.install(|| {
            let images: Vec<_> = frames.iter().map(|f| &f.image).collect();
            let embeddings = encoder.encode_images(&images);

            frames
                .par_iter()
                .zip(embeddings.into_par_iter())
                .map(|(frame, embedding)| -> Result<(Embedding, PathBuf)> {
                    let embedding = embedding?;
                    let path = thumbnails.write(&frame.video_id, frame.timestamp, &frame.image)?;
                    Ok((embedding, path))
                })
                .collect()
        });

        let mut vectors = Vec::with_capacity(frames.len());
        let mut accepted = Vec::with_capacity(frames.len());
        let mut skipped = 0;
        for (frame, outcome) in frames.iter().zip(outcomes) {
            match outcome {
                Ok((embedding, path)) => {
                    vectors.push(embedding);
                    accepted.push((frame.timestamp, path));
                }
                Err(e) if e.is_build_fatal() => return Err(e),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        "Skipping frame of {} at {:.2}s: {}",
                        frame.video_id,
                        frame.timestamp,
                        e
                    );
                }
            }
        }

        let video_id = match frames.first() {
            Some(frame) => frame.video_id.clone(),
            None => return Ok((0, 0)),
        };
        // Frames are no longer needed; release them before the next batch decodes.
        drop(frames);

        self.index.add(&vectors)?;
        for (timestamp, path) in accepted {
            self.ledger.append(&video_id, timestamp, path);
        }

        tracing::debug!(
            "Appended {} frames of {} ({} skipped)",
            vectors.len(),
            video_id,
            skipped
        );
        self.emit_progress(ProgressEvent::Batch {
            video_id: &video_id,
            frames: vectors.len(),
        });

        Ok((vectors.len(), skipped))
    }

    /// Write index and ledger to temporary files, then rename both into place.
    fn checkpoint(&self) -> Result<()> {
        let index_path = self.ctx.index_path();
        let ledger_path = self.ctx.ledger_path();
        let tmp_dir = self.ctx.tmp_dir();
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|e| VsError::Persistence(format!("{}: {}", tmp_dir.display(), e)))?;
        let index_tmp = tmp_dir.join("index.bin.partial");
        let ledger_tmp = tmp_dir.join("ledger.json.partial");

        let written = self
            .index
            .save(&index_tmp)
            .and_then(|_| self.ledger.save(&ledger_tmp));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&index_tmp);
            let _ = std::fs::remove_file(&ledger_tmp);
            return Err(as_persistence(e));
        }

        // The previous index stays reachable until the ledger is in place, so a
        // failed second rename can put the last checkpoint back.
        let previous = tmp_dir.join("index.bin.previous");
        let had_previous = keep_previous(&index_path, &previous).map_err(|e| {
            VsError::Persistence(format!("could not keep previous index: {}", e))
        })?;

        if let Err(e) = std::fs::rename(&index_tmp, &index_path)
            .and_then(|_| std::fs::rename(&ledger_tmp, &ledger_path))
        {
            let restored = if had_previous {
                std::fs::rename(&previous, &index_path)
            } else {
                remove_if_exists(&index_path)
            };
            if let Err(restore_err) = restored {
                tracing::error!(
                    "Could not restore {} after a failed checkpoint: {}",
                    index_path.display(),
                    restore_err
                );
            }
            let _ = std::fs::remove_file(&index_tmp);
            let _ = std::fs::remove_file(&ledger_tmp);
            return Err(VsError::Persistence(format!(
                "checkpoint rename failed: {}",
                e
            )));
        }

        if had_previous {
            let _ = std::fs::remove_file(&previous);
        }
        tracing::debug!("Checkpointed {} rows", self.index.len());
        Ok(())
    }

    /// Discard rows appended since the last checkpoint.
    fn rollback(&mut self) {
        self.index.truncate(self.committed);
        self.ledger.truncate(self.committed);
    }

    fn fail(&mut self, e: VsError) -> VsError {
        tracing::error!("Build failed: {}", e);
        self.rollback();
        self.state = BuildState::Failed {
            reason: e.to_string(),
        };
        e
    }

    /// Clear the scratch directory.
    fn cleanup(&self) {
        let tmp_dir = self.ctx.tmp_dir();
        let result = std::fs::remove_dir_all(&tmp_dir)
            .or_else(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
            .and_then(|_| std::fs::create_dir_all(&tmp_dir));
        if let Err(e) = result {
            tracing::warn!("Error during cleanup: {}", e);
        }
    }
}

fn as_persistence(e: VsError) -> VsError {
    match e {
        VsError::Persistence(_) => e,
        other => VsError::Persistence(other.to_string()),
    }
}

/// Link (or copy) `path` to `backup`. Returns whether there was anything to keep.
fn keep_previous(path: &Path, backup: &Path) -> std::io::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    remove_if_exists(backup)?;
    if std::fs::hard_link(path, backup).is_err() {
        std::fs::copy(path, backup)?;
    }
    Ok(true)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_source(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Could not remove {}: {}", path.display(), e);
    }
}
