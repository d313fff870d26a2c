//! Image geometry and the raster capability.
//!
//! | Piece | Role |
//! |---|---|
//! | **Calculations** | crop, crop_offset, resize, fit, set_width, set_height (pure) |
//! | **Letterbox** | letterbox plan, border colours, unletterbox band detection (pure) |
//! | **Zoom** | DPR / `zoom` multiplier and argument scaling (pure) |
//! | **Gate** | validity checks every geometry passes before it is applied |
//! | **Backend** | [`ImageBackend`] / [`RasterImage`] / [`AnimatedImage`] + [`RustBackend`] |
//!
//! The pure pieces never see pixels, so every rounding rule is unit tested
//! with plain numbers. The backend only ever receives geometry the gate has
//! already accepted.

pub mod animated;
pub mod backend;
mod calculations;
pub mod effects;
pub mod gate;
pub mod letterbox;
mod params;
pub mod rust_backend;
pub mod zoom;

pub use backend::{AnimatedImage, AnimatedOp, BackendError, ImageBackend, RasterImage};
pub use calculations::{
    Dimensions, Geometry, MIN_DIMENSION, Offset, OffsetRegion, crop, crop_offset, fit, resize,
    set_height, set_width,
};
pub use gate::{GateContext, Rejection};
pub use letterbox::{ContentBand, LetterboxGeometry, detect_content_band, letterbox};
pub use params::{
    Effect, FilterKind, Length, MimeType, OutputFormat, PixelLayout, Rgb, SourceFormat,
    StripMode, Unit,
};
pub use rust_backend::RustBackend;
pub use zoom::{ZoomResolver, ZoomSource};
