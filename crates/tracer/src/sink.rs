//! The display side of the frame loop.
//!
//! A sink is told the image size once and then receives every published
//! frame as raw RGBA32F bytes (row-major, 16 bytes per pixel, native-endian).
//! Sinks that were never initialised drop frames silently.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::resources::OUTPUT_BYTES_PER_PIXEL;

/// One published frame, borrowed from the tracer for the duration of
/// [`OutputSink::present`].
#[derive(Debug, Clone, Copy)]
pub struct OutputFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// Zero-based count of frames published so far.
    pub index: u64,
    /// Accumulated shader time this frame was rendered with.
    pub time: f32,
    pub bytes: &'a [u8],
}

impl OutputFrame<'_> {
    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y * self.width + x) * OUTPUT_BYTES_PER_PIXEL) as usize;
        let texel = self.bytes.get(offset..offset + OUTPUT_BYTES_PER_PIXEL as usize)?;
        Some(bytemuck::pod_read_unaligned(texel))
    }

    /// Every channel of every pixel as `f32`.
    pub fn texels(&self) -> Vec<f32> {
        self.bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect()
    }
}

pub trait OutputSink {
    /// Called once with the output image size before the first frame.
    fn init(&mut self, width: u32, height: u32) -> Result<()>;

    /// Called with every published frame.
    fn present(&mut self, frame: &OutputFrame<'_>) -> Result<()>;

    /// Called once after the last frame.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards every frame.
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn init(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    fn present(&mut self, _frame: &OutputFrame<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub index: u64,
    pub time: f32,
    pub bytes: Vec<u8>,
}

impl CapturedFrame {
    pub fn as_frame(&self) -> OutputFrame<'_> {
        OutputFrame {
            width: self.width,
            height: self.height,
            index: self.index,
            time: self.time,
            bytes: &self.bytes,
        }
    }
}

/// Keeps a copy of the most recent frame.
#[derive(Debug, Default)]
pub struct MemorySink {
    size: Option<(u32, u32)>,
    last: Option<CapturedFrame>,
    presented: u64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_frame(&self) -> Option<&CapturedFrame> {
        self.last.as_ref()
    }

    pub fn take_last_frame(&mut self) -> Option<CapturedFrame> {
        self.last.take()
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }
}

impl OutputSink for MemorySink {
    fn init(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = Some((width, height));
        Ok(())
    }

    fn present(&mut self, frame: &OutputFrame<'_>) -> Result<()> {
        let Some((width, height)) = self.size else {
            return Ok(());
        };
        if (frame.width, frame.height) != (width, height) {
            bail!(
                "frame is {}x{}, sink was initialised for {width}x{height}",
                frame.width,
                frame.height
            );
        }
        let last = self.last.get_or_insert_with(|| CapturedFrame {
            width,
            height,
            index: 0,
            time: 0.0,
            bytes: Vec::new(),
        });
        last.index = frame.index;
        last.time = frame.time;
        last.bytes.clear();
        last.bytes.extend_from_slice(frame.bytes);
        self.presented += 1;
        Ok(())
    }
}

/// Writes the last presented frame to disk when finished. The format follows
/// the extension: `.exr` keeps full float precision, `.png` is clamped to
/// 8 bits per channel.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    format: image::ImageFormat,
    frames: MemorySink,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = image::ImageFormat::from_path(&path)
            .with_context(|| format!("cannot infer image format from {}", path.display()))?;
        if !matches!(format, image::ImageFormat::OpenExr | image::ImageFormat::Png) {
            bail!(
                "unsupported output format {format:?} for {}; use .exr or .png",
                path.display()
            );
        }
        Ok(Self {
            path,
            format,
            frames: MemorySink::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames.frames_presented()
    }

    fn write(&self, frame: &CapturedFrame) -> Result<()> {
        let texels = frame.as_frame().texels();
        let buffer = image::Rgba32FImage::from_raw(frame.width, frame.height, texels)
            .context("frame byte length does not match its dimensions")?;
        let image = image::DynamicImage::ImageRgba32F(buffer);
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match self.format {
            image::ImageFormat::Png => image.to_rgba8().save_with_format(&self.path, self.format),
            _ => image.save_with_format(&self.path, self.format),
        }
        .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

impl OutputSink for FileSink {
    fn init(&mut self, width: u32, height: u32) -> Result<()> {
        self.frames.init(width, height)
    }

    fn present(&mut self, frame: &OutputFrame<'_>) -> Result<()> {
        self.frames.present(frame)
    }

    fn finish(&mut self) -> Result<()> {
        let Some(frame) = self.frames.last_frame() else {
            debug!(path = %self.path.display(), "no frame presented; nothing written");
            return Ok(());
        };
        self.write(frame)?;
        info!(
            path = %self.path.display(),
            frame = frame.index,
            time = frame.time,
            "wrote output image"
        );
        Ok(())
    }
}
