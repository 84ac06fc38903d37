//! Shared fixtures: a color-based encoder and a synthetic video decoder, so
//! pipeline tests run without model downloads or ffmpeg.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use vidsearch_core::{
    Config, Context, Embedding, Encoder, FrameSource, Result, VideoDecoder, VsError, discover,
};

pub const DIM: usize = 8;

/// Frames in this color fail to encode.
pub const POISON: [u8; 3] = [255, 0, 255];

pub const RED: [u8; 3] = [220, 20, 20];
pub const ORANGE: [u8; 3] = [250, 130, 0];
pub const BLUE: [u8; 3] = [10, 40, 230];

/// Embeds an image as its mean color and a handful of words as fixed colors.
pub struct ColorEncoder {
    pub text_delay: Option<Duration>,
}

impl ColorEncoder {
    pub fn new() -> Self {
        Self { text_delay: None }
    }
}

fn color_vector(rgb: [f32; 3]) -> Embedding {
    let mut v = vec![0.0; DIM];
    v[0] = rgb[0] / 255.0;
    v[1] = rgb[1] / 255.0;
    v[2] = rgb[2] / 255.0;
    v
}

impl Encoder for ColorEncoder {
    fn dimension(&self) -> usize {
        DIM
    }

    fn encode_images(&self, images: &[&RgbImage]) -> Vec<Result<Embedding>> {
        images
            .iter()
            .map(|img| {
                if img.pixels().any(|p| p.0 == POISON) {
                    return Err(VsError::Encoding("unreadable frame".into()));
                }
                let n = (img.width() * img.height()).max(1) as f32;
                let mut sum = [0f32; 3];
                for p in img.pixels() {
                    for (c, s) in sum.iter_mut().enumerate() {
                        *s += p.0[c] as f32;
                    }
                }
                Ok(color_vector([sum[0] / n, sum[1] / n, sum[2] / n]))
            })
            .collect()
    }

    fn encode_text(&self, text: &str) -> Result<Embedding> {
        if let Some(delay) = self.text_delay {
            std::thread::sleep(delay);
        }
        let rgb = match text {
            "sunset" => ORANGE,
            "ocean" => BLUE,
            "fire truck" => RED,
            _ => [128, 128, 128],
        };
        Ok(color_vector(rgb.map(|c| c as f32)))
    }
}

/// Description of a fake video, stored as JSON in the staged file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSpec {
    pub fps: f64,
    pub frames: u64,
    pub color: [u8; 3],
    /// Frame positions rendered in the poison color
    #[serde(default)]
    pub poison: Vec<u64>,
    /// Frame positions that fail to decode
    #[serde(default)]
    pub corrupt: Vec<u64>,
    /// The decoder gives up after the last frame instead of ending cleanly
    #[serde(default)]
    pub truncated: bool,
}

impl VideoSpec {
    pub fn solid(color: [u8; 3], fps: f64, seconds: f64) -> Self {
        Self {
            fps,
            frames: (fps * seconds) as u64,
            color,
            poison: Vec::new(),
            corrupt: Vec::new(),
            truncated: false,
        }
    }
}

pub struct SyntheticDecoder;

struct SyntheticSource {
    spec: VideoSpec,
    next: u64,
}

impl FrameSource for SyntheticSource {
    fn fps(&self) -> f64 {
        self.spec.fps
    }

    fn next_frame(&mut self) -> Option<Result<RgbImage>> {
        if self.next >= self.spec.frames {
            return None;
        }
        let n = self.next;
        self.next += 1;
        if self.spec.corrupt.contains(&n) {
            return Some(Err(VsError::Acquisition(format!("corrupt frame {}", n))));
        }
        let color = if self.spec.poison.contains(&n) {
            POISON
        } else {
            self.spec.color
        };
        Some(Ok(RgbImage::from_pixel(4, 4, Rgb(color))))
    }

    fn finish(&mut self) -> Result<()> {
        if self.spec.truncated {
            return Err(VsError::Acquisition("stream ended early".into()));
        }
        Ok(())
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let content = std::fs::read(path)?;
        let spec: VideoSpec = serde_json::from_slice(&content)
            .map_err(|e| VsError::Acquisition(format!("could not open video: {}", e)))?;
        Ok(Box::new(SyntheticSource { spec, next: 0 }))
    }
}

/// A fresh repository in a temp dir.
pub struct TestRepo {
    pub dir: TempDir,
    pub ctx: Context,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_encoder(ColorEncoder::new())
    }

    pub fn with_encoder(encoder: ColorEncoder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(discover::vs_dir(&root)).unwrap();

        let config = Config {
            dimension: DIM,
            thumbnail_max_side: 0,
            ..Config::default()
        };
        config.save(&root).unwrap();
        std::fs::create_dir_all(config.video_dir(&root)).unwrap();

        let ctx = Context::with_parts(root, config, Arc::new(encoder), Arc::new(SyntheticDecoder));
        Self { dir, ctx }
    }

    /// Stage a fake video named `<name>.mp4`.
    pub fn stage(&self, name: &str, spec: &VideoSpec) -> PathBuf {
        let path = self.ctx.video_dir().join(format!("{}.mp4", name));
        std::fs::write(&path, serde_json::to_vec(spec).unwrap()).unwrap();
        path
    }
}
