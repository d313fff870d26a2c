//! Animated GIF collaborator on `image`'s GIF codec.
//!
//! Operations are queued while the engine dispatches directives and applied
//! to every frame in one pass on [`render`](AnimatedImage::render). Frames
//! come out of the decoder already composited to the full logical screen, so
//! a geometry applies to each frame exactly as it would to a still image.

use super::backend::{AnimatedImage, AnimatedOp, BackendError};
use super::calculations::{Dimensions, Geometry};
use super::effects;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{AnimationDecoder, DynamicImage, Frame, ImageDecoder, RgbaImage};
use std::io::Cursor;

/// GIF encoder speed: 1 is best quality, 30 fastest. 10 is the codec default.
const ENCODE_SPEED: i32 = 10;

pub struct GifAnimation {
    frames: Vec<Frame>,
    dimensions: Dimensions,
    queue: Vec<(&'static str, AnimatedOp)>,
}

impl GifAnimation {
    pub fn decode(data: &[u8]) -> Result<Self, BackendError> {
        let decoder = GifDecoder::new(Cursor::new(data))
            .map_err(|e| BackendError::ProcessingFailed(format!("Failed to read GIF: {e}")))?;
        let (width, height) = decoder.dimensions();
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| BackendError::ProcessingFailed(format!("Failed to decode GIF: {e}")))?;

        Ok(Self {
            frames,
            dimensions: Dimensions::new(width, height),
            queue: Vec::new(),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

fn apply_geometry(buffer: RgbaImage, geometry: &Geometry) -> RgbaImage {
    let (width, height) = buffer.dimensions();
    let mut out = buffer;
    if geometry.needs_crop(Dimensions::new(width, height)) {
        out = imageops::crop_imm(
            &out,
            geometry.offset_x,
            geometry.offset_y,
            geometry.crop_width,
            geometry.crop_height,
        )
        .to_image();
    }
    if geometry.needs_scale() {
        out = imageops::resize(&out, geometry.width, geometry.height, FilterType::Triangle);
    }
    out
}

fn apply_op(buffer: RgbaImage, op: &AnimatedOp) -> RgbaImage {
    match op {
        AnimatedOp::Geometry(geometry) => apply_geometry(buffer, geometry),
        AnimatedOp::Effect(effect) => {
            effects::apply(&DynamicImage::ImageRgba8(buffer), effect).to_rgba8()
        }
    }
}

impl AnimatedImage for GifAnimation {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn add_operation(&mut self, label: &'static str, op: AnimatedOp) {
        if let AnimatedOp::Geometry(geometry) = op {
            self.dimensions = geometry.output();
        }
        self.queue.push((label, op));
    }

    fn applied(&self) -> Vec<&'static str> {
        self.queue.iter().map(|(label, _)| *label).collect()
    }

    fn render(&mut self) -> Result<Vec<u8>, BackendError> {
        if self.frames.is_empty() {
            return Err(BackendError::ProcessingFailed("GIF has no frames".into()));
        }

        let frames: Vec<Frame> = self
            .frames
            .iter()
            .map(|frame| {
                let buffer = self
                    .queue
                    .iter()
                    .fold(frame.buffer().clone(), |buffer, (_, op)| apply_op(buffer, op));
                Frame::from_parts(buffer, 0, 0, frame.delay())
            })
            .collect();

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new_with_speed(&mut out, ENCODE_SPEED);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| BackendError::ProcessingFailed(format!("GIF encode failed: {e}")))?;
            encoder
                .encode_frames(frames)
                .map_err(|e| BackendError::ProcessingFailed(format!("GIF encode failed: {e}")))?;
        }
        Ok(out)
    }
}
