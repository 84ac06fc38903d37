//! Frame sampling: decode a video and keep one frame per sampling interval

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use image::RgbImage;
use serde::Deserialize;

use crate::{Result, VsError};

/// A frame picked by the sampler.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub video_id: String,
    /// Offset into the video in seconds (`frame_count / fps`)
    pub timestamp: f64,
    pub image: RgbImage,
}

/// A decoded stream of frames from one video.
pub trait FrameSource: Send {
    /// Frames per second of the stream.
    fn fps(&self) -> f64;

    /// The next frame in presentation order, `None` at the end of the stream.
    /// An `Err` marks a single unreadable frame; decoding continues after it.
    fn next_frame(&mut self) -> Option<Result<RgbImage>>;

    /// Report how the stream ended, once `next_frame` has returned `None`.
    /// An `Err` means decoding stopped early and the frames seen are incomplete.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens video files as frame sources.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// Derive an asset's identifier from its file name.
pub fn video_id(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| VsError::Acquisition(format!("no file name in {}", path.display())))
}

/// Lazy, finite sequence of sampled frames for one video.
///
/// The frame at position `n` is kept when `n % round(fps * interval) == 0`.
/// Not restartable: a new sampler decodes the video from the start.
pub struct FrameSampler {
    video_id: String,
    source: Box<dyn FrameSource>,
    fps: f64,
    step: u64,
    frame_count: u64,
    skipped: usize,
}

impl FrameSampler {
    /// Open `path` with `decoder` and sample every `interval_secs` seconds.
    pub fn open(decoder: &dyn VideoDecoder, path: &Path, interval_secs: f64) -> Result<Self> {
        if !path.is_file() {
            return Err(VsError::Acquisition(format!(
                "could not open video: {}",
                path.display()
            )));
        }
        let video_id = video_id(path)?;
        let source = decoder.open(path)?;
        Self::new(video_id, source, interval_secs)
    }

    /// Sample an already opened frame source.
    pub fn new(video_id: String, source: Box<dyn FrameSource>, interval_secs: f64) -> Result<Self> {
        let fps = source.fps();
        if !(fps.is_finite() && fps > 0.0) {
            return Err(VsError::Acquisition(format!(
                "video {} reports invalid frame rate {}",
                video_id, fps
            )));
        }
        let step = ((fps * interval_secs).round() as u64).max(1);

        Ok(Self {
            video_id,
            source,
            fps,
            step,
            frame_count: 0,
            skipped: 0,
        })
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Number of decoded frames between samples.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Sampled positions that could not be decoded so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Check that the decoder reached the real end of the video.
    pub fn finish(&mut self) -> Result<()> {
        self.source.finish().map_err(|e| {
            tracing::warn!("Decoding of {} ended early: {}", self.video_id, e);
            e
        })
    }
}

impl Iterator for FrameSampler {
    type Item = SampledFrame;

    fn next(&mut self) -> Option<SampledFrame> {
        loop {
            let frame = self.source.next_frame()?;
            let position = self.frame_count;
            self.frame_count += 1;

            if position % self.step != 0 {
                continue;
            }

            let timestamp = position as f64 / self.fps;
            match frame {
                Ok(image) => {
                    return Some(SampledFrame {
                        video_id: self.video_id.clone(),
                        timestamp,
                        image,
                    });
                }
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(
                        "Skipping unreadable frame of {} at {:.2}s: {}",
                        self.video_id,
                        timestamp,
                        e
                    );
                }
            }
        }
    }
}

/// Decodes videos by streaming raw RGB frames out of `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: u32,
    height: u32,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    r_frame_rate: Option<String>,
}

impl FfmpegDecoder {
    /// Use specific `ffmpeg` / `ffprobe` binaries.
    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    fn probe(&self, path: &Path) -> Result<(u32, u32, f64)> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,avg_frame_rate,r_frame_rate"])
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| VsError::Acquisition(format!("failed to execute ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(VsError::Acquisition(format!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| VsError::Acquisition(format!("unreadable ffprobe output: {}", e)))?;
        let stream = probe.streams.into_iter().next().ok_or_else(|| {
            VsError::Acquisition(format!("no video stream in {}", path.display()))
        })?;

        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
            .ok_or_else(|| {
                VsError::Acquisition(format!("unknown frame rate for {}", path.display()))
            })?;

        if stream.width == 0 || stream.height == 0 {
            return Err(VsError::Acquisition(format!(
                "video {} has empty frames",
                path.display()
            )));
        }

        Ok((stream.width, stream.height, fps))
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let (width, height, fps) = self.probe(path)?;

        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-vsync", "0"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VsError::Acquisition(format!("failed to execute ffmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VsError::Acquisition("ffmpeg stdout not captured".into()))?;
        // ffmpeg blocks once its stderr pipe is full, so drain it on its own thread.
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut out = Vec::new();
                let _ = pipe.read_to_end(&mut out);
                String::from_utf8_lossy(&out).trim().to_string()
            })
        });

        tracing::debug!(
            "Decoding {} ({}x{} @ {:.3} fps)",
            path.display(),
            width,
            height,
            fps
        );

        Ok(Box::new(FfmpegSource {
            child,
            stdout,
            stderr,
            width,
            height,
            fps,
            done: false,
        }))
    }
}

struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    fps: f64,
    done: bool,
}

impl FrameSource for FfmpegSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn next_frame(&mut self) -> Option<Result<RgbImage>> {
        if self.done {
            return None;
        }

        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => RgbImage::from_raw(self.width, self.height, buf)
                .map(Ok)
                .or_else(|| Some(Err(VsError::Acquisition("frame buffer size mismatch".into())))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(VsError::Acquisition(format!("ffmpeg stream error: {}", e))))
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if !self.done {
            let _ = self.child.kill();
        }
        let status = self
            .child
            .wait()
            .map_err(|e| VsError::Acquisition(format!("failed to wait for ffmpeg: {}", e)))?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(VsError::Acquisition(format!(
                "ffmpeg exited with {}: {}",
                status, stderr
            )));
        }
        Ok(())
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
fn parse_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}
