//! Raster capability traits and shared types.
//!
//! The engine decides *what* geometry and encoding to apply; the types here
//! are how it asks for the pixel work. [`ImageBackend`] loads bytes into a
//! [`RasterImage`] (a still image edited in place) or an [`AnimatedImage`]
//! (a queue of operations applied to every frame on render).
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), built on the `image`
//! crate. Tests use the recording `MockBackend` in this module.

use super::calculations::{Dimensions, Geometry};
use super::params::{Effect, OutputFormat, PixelLayout, Rgb, SourceFormat};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Loads source bytes into editable images.
pub trait ImageBackend: Sync {
    fn load(&self, data: &[u8]) -> Result<Box<dyn RasterImage>, BackendError>;

    fn load_animation(&self, data: &[u8]) -> Result<Box<dyn AnimatedImage>, BackendError>;
}

/// A decoded still image, mutated in place by the engine.
///
/// Geometry methods are only called after the validity gate accepted the
/// resulting size, so implementations never need to re-check policy.
pub trait RasterImage: Send {
    fn dimensions(&self) -> Dimensions;

    fn format(&self) -> SourceFormat;

    /// Colour model the image was loaded with, or was last set to.
    fn layout(&self) -> PixelLayout;

    fn set_layout(&mut self, layout: PixelLayout) -> Result<(), BackendError>;

    fn crop(&mut self, width: u32, height: u32, x: u32, y: u32) -> Result<(), BackendError>;

    fn scale(&mut self, width: u32, height: u32) -> Result<(), BackendError>;

    /// Pad every side: `width` columns left and right, `height` rows top and bottom.
    fn border(&mut self, color: Rgb, width: u32, height: u32) -> Result<(), BackendError>;

    /// RGB pixels of scan-line `y`; empty when out of range.
    fn pixel_row(&self, y: u32) -> Vec<[u8; 3]>;

    fn apply_effect(&mut self, effect: &Effect) -> Result<(), BackendError>;

    /// Embedded ICC profile, if any.
    fn color_profile(&self) -> Option<Vec<u8>>;

    fn set_color_profile(&mut self, profile: Option<Vec<u8>>);

    /// Pixel density written on encode, in dots per inch. `(0, 0)` when unset.
    fn resolution(&self) -> (u16, u16);

    fn set_resolution(&mut self, x: u16, y: u16);

    fn set_format(&mut self, format: OutputFormat);

    /// Lossy quality for JPEG, or `zlib_level * 10 + filter` for PNG.
    fn set_compression_quality(&mut self, quality: u32);

    fn encode_to_file(&self, path: &Path) -> Result<(), BackendError>;
}

/// One operation queued on an animation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnimatedOp {
    Geometry(Geometry),
    Effect(Effect),
}

/// An animated image. Operations are queued and applied to every frame on render.
pub trait AnimatedImage: Send {
    fn dimensions(&self) -> Dimensions;

    fn add_operation(&mut self, label: &'static str, op: AnimatedOp);

    /// Labels of the queued operations the animation will apply.
    fn applied(&self) -> Vec<&'static str>;

    fn render(&mut self) -> Result<Vec<u8>, BackendError>;
}
