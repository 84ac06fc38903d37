//! Search functionality

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use serde::Serialize;

use crate::{
    Context, Embedding, EncoderInput, MetadataLedger, Result, VectorIndex, VsError, build,
    similarity,
};

/// A search query in either modality.
#[derive(Debug, Clone)]
pub enum Query {
    Text(String),
    /// Encoded image bytes (JPEG, PNG, ...)
    Image(Vec<u8>),
}

/// A matching frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub video_id: String,
    pub timestamp: f64,
    pub thumbnail_path: PathBuf,
    /// `1 / (1 + distance)`, in (0, 1]
    pub similarity_score: f32,
}

/// Read-only view over a verified index and ledger.
pub struct SearchEngine {
    ctx: Context,
    index: VectorIndex,
    ledger: MetadataLedger,
}

impl SearchEngine {
    /// Load and verify the persisted state. Refuses to open an inconsistent index.
    pub fn open(ctx: &Context) -> Result<Self> {
        let (index, ledger) = build::load_checked(ctx)?;
        tracing::info!("Search engine initialized with {} entries", ledger.len());
        Ok(Self {
            ctx: ctx.clone(),
            index,
            ledger,
        })
    }

    /// Pick up the latest checkpoint.
    pub fn reload(&mut self) -> Result<()> {
        let (index, ledger) = build::load_checked(&self.ctx)?;
        self.index = index;
        self.ledger = ledger;
        Ok(())
    }

    /// Number of searchable frames.
    pub fn len(&self) -> usize {
        self.index.len().min(self.ledger.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embed `query` and return up to `top_k` frames, most similar first.
    pub fn search(&self, query: &Query, top_k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        if top_k == 0 {
            return Err(VsError::Query("top_k must be positive".to_string()));
        }

        let embedding = self.embed_query(query)?;
        self.search_vector(&embedding, top_k)
    }

    /// Rank frames against an already embedded query vector.
    pub fn search_vector(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        let hits = self.index.search(query, top_k)?;

        Ok(hits
            .into_iter()
            .filter_map(|(distance, row)| {
                let Some(record) = self.ledger.get(row) else {
                    tracing::debug!("Dropping hit for row {} beyond the ledger", row);
                    return None;
                };
                Some(SearchHit {
                    video_id: record.video_id.clone(),
                    timestamp: record.timestamp,
                    thumbnail_path: record.thumbnail_path.clone(),
                    similarity_score: similarity(distance),
                })
            })
            .collect())
    }

    /// Run [`SearchEngine::search`] on a blocking task, failing with
    /// [`VsError::Timeout`] if it does not finish within `timeout`.
    pub async fn search_with_timeout(
        self: &Arc<Self>,
        query: Query,
        top_k: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SearchHit>> {
        let engine = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || engine.search(&query, top_k));

        let joined = match timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| VsError::Timeout(limit))?,
            None => task.await,
        };
        joined.map_err(|e| VsError::Query(format!("search task failed: {}", e)))?
    }

    /// Load the thumbnail of a hit.
    pub fn thumbnail(&self, hit: &SearchHit) -> Result<DynamicImage> {
        Ok(image::open(&hit.thumbnail_path)?)
    }

    fn embed_query(&self, query: &Query) -> Result<Embedding> {
        let encoder = self.ctx.encoder();
        match query {
            Query::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(VsError::Query("empty text query".to_string()));
                }
                encoder.encode(EncoderInput::Text(text))
            }
            Query::Image(bytes) => {
                let image = image::load_from_memory(bytes)
                    .map_err(|e| VsError::Query(format!("unsupported image query: {}", e)))?
                    .to_rgb8();
                encoder.encode(EncoderInput::Image(&image))
            }
        }
    }
}
