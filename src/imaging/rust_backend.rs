//! Pure Rust raster capability built on the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, BMP, WebP) | `image::load_from_memory` |
//! | Crop / scale | `DynamicImage::crop_imm`, `resize_exact` with `Lanczos3` |
//! | Border | `imageops::replace` onto a solid canvas |
//! | Filters | [`effects`](super::effects) |
//! | Encode → JPEG | `JpegEncoder::new_with_quality` + pixel density |
//! | Encode → PNG | `PngEncoder::new_with_quality`, `oxipng` for palette output |
//! | ICC / EXIF segments | `img-parts` |
//! | Animated GIF | [`GifAnimation`](super::animated::GifAnimation) |

use super::animated::GifAnimation;
use super::backend::{AnimatedImage, BackendError, ImageBackend, RasterImage};
use super::calculations::Dimensions;
use super::effects;
use super::params::{Effect, OutputFormat, PixelLayout, Rgb, SourceFormat};
use image::codecs::jpeg::{JpegEncoder, PixelDensity, PixelDensityUnit};
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::{Bytes, ImageEXIF, ImageICC};
use std::io::Cursor;
use std::path::Path;

/// Offset of the colour-type byte inside a PNG file (signature + IHDR header).
const PNG_COLOR_TYPE_OFFSET: usize = 25;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn processing(context: &str, e: impl std::fmt::Display) -> BackendError {
    BackendError::ProcessingFailed(format!("{context}: {e}"))
}

fn source_format(data: &[u8]) -> SourceFormat {
    match image::guess_format(data) {
        Ok(ImageFormat::Jpeg) => SourceFormat::Jpeg,
        Ok(ImageFormat::Png) => SourceFormat::Png,
        Ok(ImageFormat::Gif) => SourceFormat::Gif,
        Ok(ImageFormat::Bmp) => SourceFormat::Bmp,
        Ok(ImageFormat::WebP) => SourceFormat::WebP,
        _ => SourceFormat::Other,
    }
}

/// Walk PNG chunks up to the first `IDAT`, looking for `name`.
fn png_has_chunk(data: &[u8], name: &[u8; 4]) -> bool {
    let mut pos = 8;
    while pos + 8 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let kind = &data[pos + 4..pos + 8];
        if kind == name {
            return true;
        }
        if kind == b"IDAT" {
            return false;
        }
        pos += 12 + len as usize;
    }
    false
}

/// Colour model of a PNG as written in its IHDR, before any decoder expansion.
pub fn png_layout(data: &[u8]) -> Option<PixelLayout> {
    let color_type = *data.get(PNG_COLOR_TYPE_OFFSET)?;
    let layout = match color_type {
        0 => PixelLayout::Grayscale,
        2 => PixelLayout::TrueColor,
        3 if png_has_chunk(data, b"tRNS") => PixelLayout::PaletteAlpha,
        3 => PixelLayout::Palette,
        4 => PixelLayout::GrayscaleAlpha,
        6 => PixelLayout::TrueColorAlpha,
        _ => return None,
    };
    Some(layout)
}

fn decoded_layout(image: &DynamicImage) -> PixelLayout {
    let color = image.color();
    match (color.has_color(), color.has_alpha()) {
        (false, false) => PixelLayout::Grayscale,
        (false, true) => PixelLayout::GrayscaleAlpha,
        (true, false) => PixelLayout::TrueColor,
        (true, true) => PixelLayout::TrueColorAlpha,
    }
}

fn read_icc(data: &[u8], format: SourceFormat) -> Option<Vec<u8>> {
    let bytes = Bytes::copy_from_slice(data);
    let icc = match format {
        SourceFormat::Jpeg => Jpeg::from_bytes(bytes).ok()?.icc_profile(),
        SourceFormat::Png => Png::from_bytes(bytes).ok()?.icc_profile(),
        _ => None,
    };
    icc.map(|profile| profile.to_vec())
}

fn read_exif(data: &[u8], format: SourceFormat) -> Option<Vec<u8>> {
    if format != SourceFormat::Jpeg {
        return None;
    }
    Jpeg::from_bytes(Bytes::copy_from_slice(data))
        .ok()?
        .exif()
        .map(|exif| exif.to_vec())
}

/// Re-attach ICC and EXIF segments dropped by the `image` encoders.
fn embed_segments(
    encoded: Vec<u8>,
    format: OutputFormat,
    icc: Option<&[u8]>,
    exif: Option<&[u8]>,
) -> Result<Vec<u8>, BackendError> {
    if icc.is_none() && exif.is_none() {
        return Ok(encoded);
    }
    let mut out = Vec::with_capacity(encoded.len());
    match format {
        OutputFormat::Jpeg => {
            let mut jpeg =
                Jpeg::from_bytes(encoded.into()).map_err(|e| processing("JPEG reparse", e))?;
            jpeg.set_icc_profile(icc.map(Bytes::copy_from_slice));
            jpeg.set_exif(exif.map(Bytes::copy_from_slice));
            jpeg.encoder().write_to(&mut out)?;
        }
        OutputFormat::Png => {
            let mut png =
                Png::from_bytes(encoded.into()).map_err(|e| processing("PNG reparse", e))?;
            png.set_icc_profile(icc.map(Bytes::copy_from_slice));
            png.encoder().write_to(&mut out)?;
        }
        OutputFormat::Gif => return Ok(encoded),
    }
    Ok(out)
}

fn png_compression(level: u32) -> CompressionType {
    match level {
        0 => CompressionType::Uncompressed,
        n => CompressionType::Level(n.min(9) as u8),
    }
}

fn png_filter(filter: u32) -> PngFilter {
    match filter {
        0 => PngFilter::NoFilter,
        1 => PngFilter::Sub,
        2 => PngFilter::Up,
        3 => PngFilter::Avg,
        4 => PngFilter::Paeth,
        _ => PngFilter::Adaptive,
    }
}

/// A decoded still image plus the encode settings accumulated on it.
pub struct RustRaster {
    image: DynamicImage,
    format: SourceFormat,
    layout: PixelLayout,
    icc: Option<Vec<u8>>,
    exif: Option<Vec<u8>>,
    density: (u16, u16),
    output: OutputFormat,
    quality: u32,
}

impl RustRaster {
    pub fn from_bytes(data: &[u8]) -> Result<Self, BackendError> {
        let format = source_format(data);
        let image = image::load_from_memory(data).map_err(|e| processing("Failed to decode", e))?;
        let layout = match format {
            SourceFormat::Png => png_layout(data).unwrap_or_else(|| decoded_layout(&image)),
            SourceFormat::Gif if image.color().has_alpha() => PixelLayout::PaletteAlpha,
            SourceFormat::Gif => PixelLayout::Palette,
            _ => decoded_layout(&image),
        };

        Ok(Self {
            icc: read_icc(data, format),
            exif: read_exif(data, format),
            image,
            format,
            layout,
            density: (0, 0),
            output: OutputFormat::Jpeg,
            quality: 100,
        })
    }

    /// Pixels converted to the channel layout the PNG encoder should write.
    fn png_pixels(&self) -> DynamicImage {
        match self.layout {
            PixelLayout::Grayscale => DynamicImage::ImageLuma8(self.image.to_luma8()),
            PixelLayout::GrayscaleAlpha => DynamicImage::ImageLumaA8(self.image.to_luma_alpha8()),
            PixelLayout::TrueColor | PixelLayout::Palette => {
                DynamicImage::ImageRgb8(self.image.to_rgb8())
            }
            PixelLayout::TrueColorAlpha | PixelLayout::PaletteAlpha => {
                DynamicImage::ImageRgba8(self.image.to_rgba8())
            }
        }
    }

    fn encode_png(&self) -> Result<Vec<u8>, BackendError> {
        let mut buf = Vec::new();
        let encoder = PngEncoder::new_with_quality(
            Cursor::new(&mut buf),
            png_compression(self.quality / 10),
            png_filter(self.quality % 10),
        );
        self.png_pixels()
            .write_with_encoder(encoder)
            .map_err(|e| processing("PNG encode failed", e))?;

        if !self.layout.is_palette() {
            return Ok(buf);
        }
        // the image encoders cannot write indexed colour; oxipng reduces losslessly
        let mut options = oxipng::Options::from_preset(2);
        options.strip = oxipng::StripChunks::None;
        oxipng::optimize_from_memory(&buf, &options).map_err(|e| processing("Palette reduction", e))
    }

    fn encode_jpeg(&self) -> Result<Vec<u8>, BackendError> {
        let mut buf = Vec::new();
        let mut encoder =
            JpegEncoder::new_with_quality(Cursor::new(&mut buf), self.quality.clamp(1, 100) as u8);
        if self.density != (0, 0) {
            encoder.set_pixel_density(PixelDensity {
                density: self.density,
                unit: PixelDensityUnit::Inches,
            });
        }
        let pixels = if self.image.color().has_color() {
            DynamicImage::ImageRgb8(self.image.to_rgb8())
        } else {
            DynamicImage::ImageLuma8(self.image.to_luma8())
        };
        pixels
            .write_with_encoder(encoder)
            .map_err(|e| processing("JPEG encode failed", e))?;
        Ok(buf)
    }

    /// Resampling and filters leave the palette behind.
    fn leave_palette(&mut self) {
        self.layout = match self.layout {
            PixelLayout::Palette => PixelLayout::TrueColor,
            PixelLayout::PaletteAlpha => PixelLayout::TrueColorAlpha,
            other => other,
        };
    }

    fn encode_gif(&self) -> Result<Vec<u8>, BackendError> {
        let mut buf = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Gif)
            .map_err(|e| processing("GIF encode failed", e))?;
        Ok(buf)
    }
}

impl RasterImage for RustRaster {
    fn dimensions(&self) -> Dimensions {
        let (width, height) = self.image.dimensions();
        Dimensions::new(width, height)
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    fn layout(&self) -> PixelLayout {
        self.layout
    }

    fn set_layout(&mut self, layout: PixelLayout) -> Result<(), BackendError> {
        self.image = match layout {
            PixelLayout::Grayscale => DynamicImage::ImageLuma8(self.image.to_luma8()),
            PixelLayout::GrayscaleAlpha => DynamicImage::ImageLumaA8(self.image.to_luma_alpha8()),
            PixelLayout::TrueColor => DynamicImage::ImageRgb8(self.image.to_rgb8()),
            PixelLayout::TrueColorAlpha => DynamicImage::ImageRgba8(self.image.to_rgba8()),
            // indexed output is produced at encode time
            PixelLayout::Palette | PixelLayout::PaletteAlpha => {
                self.layout = layout;
                return Ok(());
            }
        };
        self.layout = layout;
        Ok(())
    }

    fn crop(&mut self, width: u32, height: u32, x: u32, y: u32) -> Result<(), BackendError> {
        let (w, h) = self.image.dimensions();
        if x.saturating_add(width) > w || y.saturating_add(height) > h {
            return Err(BackendError::ProcessingFailed(format!(
                "Crop {width}x{height}+{x}+{y} outside {w}x{h}"
            )));
        }
        self.image = self.image.crop_imm(x, y, width, height);
        Ok(())
    }

    fn scale(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::ProcessingFailed(format!(
                "Cannot scale to {width}x{height}"
            )));
        }
        self.image = self.image.resize_exact(width, height, FilterType::Lanczos3);
        self.leave_palette();
        Ok(())
    }

    fn border(&mut self, color: Rgb, width: u32, height: u32) -> Result<(), BackendError> {
        let (w, h) = self.image.dimensions();
        let fill = Rgba([color.red, color.green, color.blue, 255]);
        let mut canvas = RgbaImage::from_pixel(w + width * 2, h + height * 2, fill);
        image::imageops::replace(
            &mut canvas,
            &self.image.to_rgba8(),
            width as i64,
            height as i64,
        );
        let framed = DynamicImage::ImageRgba8(canvas);
        self.image = if self.image.color().has_alpha() {
            framed
        } else {
            DynamicImage::ImageRgb8(framed.to_rgb8())
        };
        Ok(())
    }

    fn pixel_row(&self, y: u32) -> Vec<[u8; 3]> {
        let (w, h) = self.image.dimensions();
        if y >= h {
            return Vec::new();
        }
        (0..w)
            .map(|x| {
                let [r, g, b, _] = self.image.get_pixel(x, y).0;
                [r, g, b]
            })
            .collect()
    }

    fn apply_effect(&mut self, effect: &Effect) -> Result<(), BackendError> {
        self.image = effects::apply(&self.image, effect);
        self.leave_palette();
        Ok(())
    }

    fn color_profile(&self) -> Option<Vec<u8>> {
        self.icc.clone()
    }

    fn set_color_profile(&mut self, profile: Option<Vec<u8>>) {
        self.icc = profile.filter(|p| !p.is_empty());
    }

    fn resolution(&self) -> (u16, u16) {
        self.density
    }

    fn set_resolution(&mut self, x: u16, y: u16) {
        self.density = (x, y);
    }

    fn set_format(&mut self, format: OutputFormat) {
        self.output = format;
    }

    fn set_compression_quality(&mut self, quality: u32) {
        self.quality = quality;
    }

    fn encode_to_file(&self, path: &Path) -> Result<(), BackendError> {
        let encoded = match self.output {
            OutputFormat::Jpeg => self.encode_jpeg()?,
            OutputFormat::Png => self.encode_png()?,
            OutputFormat::Gif => self.encode_gif()?,
        };
        let exif = match self.output {
            OutputFormat::Jpeg => self.exif.as_deref(),
            _ => None,
        };
        let bytes = embed_segments(encoded, self.output, self.icc.as_deref(), exif)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl ImageBackend for RustBackend {
    fn load(&self, data: &[u8]) -> Result<Box<dyn RasterImage>, BackendError> {
        Ok(Box::new(RustRaster::from_bytes(data)?))
    }

    fn load_animation(&self, data: &[u8]) -> Result<Box<dyn AnimatedImage>, BackendError> {
        Ok(Box::new(GifAnimation::decode(data)?))
    }
}
