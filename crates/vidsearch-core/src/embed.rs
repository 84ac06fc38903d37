//! Embedding generation using fastembed's CLIP models
//!
//! Frames and text queries are mapped into the same vector space, so a text
//! query can be compared directly against indexed frame vectors.

use std::io::Cursor;
use std::sync::Mutex;

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use image::{ImageFormat, RgbImage};
use rayon::prelude::*;

use crate::{Config, Result, VsError};

/// A fixed-dimension embedding vector.
pub type Embedding = Vec<f32>;

/// Model ids accepted in the config.
pub const SUPPORTED_MODELS: &[&str] = &["clip-ViT-B-32"];

/// The two kinds of input an encoder accepts.
#[derive(Debug, Clone, Copy)]
pub enum EncoderInput<'a> {
    Text(&'a str),
    Image(&'a RgbImage),
}

/// Maps images and text into one shared embedding space.
///
/// Implementations may be shared across threads, but model forward passes are
/// expected to be serialized internally.
pub trait Encoder: Send + Sync {
    /// Length of every vector this encoder produces.
    fn dimension(&self) -> usize;

    /// Encode a batch of images. Returns one result per input, in input order,
    /// so a single bad image does not fail the others.
    fn encode_images(&self, images: &[&RgbImage]) -> Vec<Result<Embedding>>;

    /// Encode a text query.
    fn encode_text(&self, text: &str) -> Result<Embedding>;

    /// Encode either modality.
    fn encode(&self, input: EncoderInput<'_>) -> Result<Embedding> {
        match input {
            EncoderInput::Text(text) => self.encode_text(text),
            EncoderInput::Image(image) => self
                .encode_images(&[image])
                .into_iter()
                .next()
                .unwrap_or_else(|| Err(VsError::Encoding("No embedding generated".to_string()))),
        }
    }
}

/// Check that a model output has the expected shape and finite values.
pub fn check_embedding(embedding: Embedding, dimension: usize) -> Result<Embedding> {
    if embedding.len() != dimension {
        return Err(VsError::Encoding(format!(
            "model produced {} values, expected {}",
            embedding.len(),
            dimension
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(VsError::Encoding("model produced non-finite values".to_string()));
    }
    Ok(embedding)
}

/// CLIP ViT-B/32 vision and text towers.
pub struct ClipEncoder {
    vision: Mutex<ImageEmbedding>,
    text: Mutex<TextEmbedding>,
    dimension: usize,
}

impl ClipEncoder {
    /// Load the model pair named in config.
    pub fn new(config: &Config) -> Result<Self> {
        let (vision_model, text_model) = match config.model.as_str() {
            "clip-ViT-B-32" => (ImageEmbeddingModel::ClipVitB32, EmbeddingModel::ClipVitB32),
            other => {
                return Err(VsError::Encoding(format!(
                    "Unknown model: {}. Supported: {}",
                    other,
                    SUPPORTED_MODELS.join(", ")
                )));
            }
        };

        tracing::info!("Loading CLIP model {}", config.model);

        let vision = ImageEmbedding::try_new(
            ImageInitOptions::new(vision_model).with_show_download_progress(true),
        )
        .map_err(|e| VsError::Encoding(e.to_string()))?;

        let text =
            TextEmbedding::try_new(InitOptions::new(text_model).with_show_download_progress(true))
                .map_err(|e| VsError::Encoding(e.to_string()))?;

        Ok(Self {
            vision: Mutex::new(vision),
            text: Mutex::new(text),
            dimension: config.dimension,
        })
    }

    fn run_vision(&self, inputs: &[&[u8]]) -> Result<Vec<Embedding>> {
        let model = self
            .vision
            .lock()
            .map_err(|_| VsError::Encoding("vision model lock poisoned".to_string()))?;
        model
            .embed_bytes(inputs, Some(inputs.len()))
            .map_err(|e| VsError::Encoding(e.to_string()))
    }
}

impl Encoder for ClipEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_images(&self, images: &[&RgbImage]) -> Vec<Result<Embedding>> {
        // Preprocessing runs on the caller's rayon pool; only inference takes the lock.
        let encoded: Vec<Result<Vec<u8>>> = images.par_iter().map(|img| to_png(img)).collect();

        let ready: Vec<(usize, &[u8])> = encoded
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().ok().map(|bytes| (i, bytes.as_slice())))
            .collect();

        let mut results: Vec<Option<Result<Embedding>>> = encoded
            .iter()
            .map(|r| match r {
                Ok(_) => None,
                Err(e) => Some(Err(VsError::Encoding(e.to_string()))),
            })
            .collect();

        if !ready.is_empty() {
            let inputs: Vec<&[u8]> = ready.iter().map(|(_, bytes)| *bytes).collect();
            match self.run_vision(&inputs) {
                Ok(vectors) if vectors.len() == inputs.len() => {
                    for ((i, _), vector) in ready.iter().zip(vectors) {
                        results[*i] = Some(check_embedding(vector, self.dimension));
                    }
                }
                outcome => {
                    if let Err(e) = outcome {
                        tracing::debug!("Batch inference failed, retrying per image: {}", e);
                    }
                    for (i, bytes) in &ready {
                        let single = self.run_vision(&[*bytes]).and_then(|mut v| {
                            v.pop()
                                .ok_or_else(|| VsError::Encoding("No embedding generated".into()))
                        });
                        results[*i] = Some(single.and_then(|v| check_embedding(v, self.dimension)));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(VsError::Encoding("No embedding generated".into()))))
            .collect()
    }

    fn encode_text(&self, text: &str) -> Result<Embedding> {
        let model = self
            .text
            .lock()
            .map_err(|_| VsError::Encoding("text model lock poisoned".to_string()))?;
        let embedding = model
            .embed(vec![text], None)
            .map_err(|e| VsError::Encoding(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| VsError::Encoding("No embedding generated".to_string()))?;
        check_embedding(embedding, self.dimension)
    }
}

/// Encoder placeholder that fails every call.
pub struct UnloadedEncoder {
    dimension: usize,
}

impl UnloadedEncoder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Encoder for UnloadedEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_images(&self, images: &[&RgbImage]) -> Vec<Result<Embedding>> {
        images
            .iter()
            .map(|_| Err(VsError::Encoding("no model loaded".to_string())))
            .collect()
    }

    fn encode_text(&self, _text: &str) -> Result<Embedding> {
        Err(VsError::Encoding("no model loaded".to_string()))
    }
}

fn to_png(image: &RgbImage) -> Result<Vec<u8>> {
    if image.width() == 0 || image.height() == 0 {
        return Err(VsError::Encoding("empty image".to_string()));
    }
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MeanColor;

    impl Encoder for MeanColor {
        fn dimension(&self) -> usize {
            3
        }

        fn encode_images(&self, images: &[&RgbImage]) -> Vec<Result<Embedding>> {
            images
                .iter()
                .map(|img| {
                    let n = (img.width() * img.height()) as f32;
                    let mut sum = [0f32; 3];
                    for p in img.pixels() {
                        for c in 0..3 {
                            sum[c] += p.0[c] as f32;
                        }
                    }
                    check_embedding(sum.iter().map(|s| s / n).collect(), 3)
                })
                .collect()
        }

        fn encode_text(&self, text: &str) -> Result<Embedding> {
            Ok(vec![text.len() as f32; 3])
        }
    }

    #[test]
    fn test_encode_dispatches_on_modality() {
        let encoder = MeanColor;
        let image = RgbImage::from_pixel(2, 2, image::Rgb([10, 20, 30]));

        let v = encoder.encode(EncoderInput::Image(&image)).unwrap();
        assert_eq!(v, vec![10.0, 20.0, 30.0]);

        let v = encoder.encode(EncoderInput::Text("abcd")).unwrap();
        assert_eq!(v, vec![4.0; 3]);
    }

    #[test]
    fn test_empty_image_fails_alone() {
        let encoder = MeanColor;
        let good = RgbImage::from_pixel(1, 1, image::Rgb([1, 1, 1]));
        let empty = RgbImage::new(0, 0);

        let results = encoder.encode_images(&[&good, &empty, &good]);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(VsError::Encoding(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_check_embedding() {
        assert!(check_embedding(vec![1.0, 2.0], 2).is_ok());
        assert!(check_embedding(vec![1.0], 2).is_err());
        assert!(check_embedding(vec![1.0, f32::NAN], 2).is_err());
    }

    #[test]
    fn test_to_png_rejects_empty() {
        assert!(to_png(&RgbImage::new(0, 0)).is_err());
        assert!(!to_png(&RgbImage::new(4, 4)).unwrap().is_empty());
    }
}
