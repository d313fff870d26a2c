//! Parameter types for image operations.
//!
//! These types describe *what* to do, not *how* to do it. They are the
//! interface between the directive layer (which decides what the request
//! asks for) and the [`backend`](super::backend) (which does the pixel work).
//!
//! ## Types
//!
//! - [`StripMode`]: Which metadata the `strip` request parameter removes.
//! - [`Length`]: A single-axis length, in pixels or percent of the source.
//! - [`Effect`]: One filter-family operation (brightness, contrast, ...).
//! - [`PixelLayout`]: Colour model of a raster, including palette modes.
//! - [`OutputFormat`] / [`MimeType`]: Encoder selection and response typing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata stripping requested through `strip=all|info|color|none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripMode {
    /// Remove everything, colour profile included.
    All,
    /// Remove comments, EXIF and IPTC, keep the colour profile.
    Info,
    /// Remove the colour profile only.
    Color,
    None,
}

impl StripMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "info" => Some(Self::Info),
            "color" => Some(Self::Color),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Whether EXIF orientation must be baked into the pixels before
    /// the EXIF block disappears.
    pub fn drops_orientation(self) -> bool {
        matches!(self, Self::All | Self::Info)
    }
}

/// Unit of a single-axis length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Pixels,
    Percent,
}

/// A width or height argument, possibly a percentage of the current size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Length {
    pub value: f64,
    pub unit: Unit,
}

impl Length {
    pub fn pixels(value: f64) -> Self {
        Self {
            value,
            unit: Unit::Pixels,
        }
    }

    pub fn percent(value: f64) -> Self {
        Self {
            value,
            unit: Unit::Percent,
        }
    }

    pub fn is_percent(self) -> bool {
        self.unit == Unit::Percent
    }
}

/// One of the eight named `filter=` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Negate,
    Grayscale,
    Sepia,
    EdgeDetect,
    Emboss,
    BlurGaussian,
    BlurSelective,
    MeanRemoval,
}

impl FilterKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "negate" => Some(Self::Negate),
            "grayscale" => Some(Self::Grayscale),
            "sepia" => Some(Self::Sepia),
            "edgedetect" => Some(Self::EdgeDetect),
            "emboss" => Some(Self::Emboss),
            "blurgaussian" => Some(Self::BlurGaussian),
            "blurselective" => Some(Self::BlurSelective),
            "meanremoval" => Some(Self::MeanRemoval),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Negate => "negate",
            Self::Grayscale => "grayscale",
            Self::Sepia => "sepia",
            Self::EdgeDetect => "edgedetect",
            Self::Emboss => "emboss",
            Self::BlurGaussian => "blurgaussian",
            Self::BlurSelective => "blurselective",
            Self::MeanRemoval => "meanremoval",
        }
    }
}

/// A filter-family operation with its typed argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    Filter(FilterKind),
    /// Additive brightness, -255..=255.
    Brightness(i32),
    /// Contrast in the -100..=100 convention where negative raises contrast.
    Contrast(i32),
    /// Per-channel additive tint, each -255..=255.
    Colorize { red: i32, green: i32, blue: i32 },
    /// Centre weight of the 3x3 smoothing kernel.
    Smooth(f32),
}

impl Effect {
    /// Name recorded in the applied-operations list.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Filter(kind) => kind.name(),
            Self::Brightness(_) => "brightness",
            Self::Contrast(_) => "contrast",
            Self::Colorize { .. } => "colorize",
            Self::Smooth(_) => "smooth",
        }
    }
}

/// Colour model of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Palette,
    PaletteAlpha,
    Grayscale,
    GrayscaleAlpha,
    TrueColor,
    TrueColorAlpha,
}

impl PixelLayout {
    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            Self::PaletteAlpha | Self::GrayscaleAlpha | Self::TrueColorAlpha
        )
    }

    pub fn is_palette(self) -> bool {
        matches!(self, Self::Palette | Self::PaletteAlpha)
    }
}

/// Encoder selected for the working file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
}

/// Detected format of a loaded source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    WebP,
    Other,
}

impl SourceFormat {
    pub fn mime_type(self) -> MimeType {
        match self {
            Self::Jpeg => MimeType::Jpeg,
            Self::Png => MimeType::Png,
            Self::Gif => MimeType::Gif,
            Self::Bmp => MimeType::Bmp,
            Self::WebP => MimeType::WebP,
            Self::Other => MimeType::OctetStream,
        }
    }
}

/// Response content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    Jpeg,
    Png,
    Gif,
    Bmp,
    WebP,
    OctetStream,
}

impl MimeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
            Self::WebP => "image/webp",
            Self::OctetStream => "application/octet-stream",
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque RGB colour for letterbox borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb {
        red: 0,
        green: 0,
        blue: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_mode_parses_known_values_only() {
        assert_eq!(StripMode::parse("all"), Some(StripMode::All));
        assert_eq!(StripMode::parse("color"), Some(StripMode::Color));
        assert_eq!(StripMode::parse("everything"), None);
        assert!(StripMode::Info.drops_orientation());
        assert!(!StripMode::Color.drops_orientation());
    }

    #[test]
    fn filter_names_round_trip() {
        for name in ["negate", "sepia", "meanremoval", "blurgaussian"] {
            assert_eq!(FilterKind::parse(name).unwrap().name(), name);
        }
        assert_eq!(FilterKind::parse("sharpen"), None);
    }

    #[test]
    fn layouts_report_alpha() {
        assert!(PixelLayout::GrayscaleAlpha.has_alpha());
        assert!(!PixelLayout::Palette.has_alpha());
        assert!(PixelLayout::PaletteAlpha.is_palette());
    }

    #[test]
    fn mime_strings() {
        assert_eq!(SourceFormat::Bmp.mime_type().as_str(), "image/bmp");
        assert_eq!(MimeType::OctetStream.to_string(), "application/octet-stream");
    }
}
