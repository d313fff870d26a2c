//! Format encoder and WebP content negotiation.
//!
//! [`encode_still`] runs once per request, after every directive has been
//! dispatched. It settles the output format and quality, normalizes the
//! colour profile and writes the working file. [`negotiate_webp`] then
//! offers that file to `cwebp` when the client can take WebP.
//!
//! ## Quality
//!
//! | Output | No `quality` | `quality=q` |
//! |---|---|---|
//! | JPEG | `min(jpeg_max, header quality)` | `clamp(q, 20, jpeg_max)` |
//! | PNG | `png_max` | `clamp(q, 20, png_max)` |
//!
//! `quality=100` additionally makes the WebP conversion lossless. PNG
//! compression is always `zlib_level * 10 + filter`; the PNG quality only
//! feeds `pngquant` and `cwebp`.

use crate::config::QualityConfig;
use crate::imaging::{
    BackendError, MimeType, OutputFormat, PixelLayout, RasterImage, SourceFormat, StripMode,
};
use crate::jpeg_header::JpegHeader;
use crate::optimize::{Optimizer, PassOutcome};
use std::ffi::OsString;
use std::path::Path;
use tracing::{debug, info};

/// Lowest quality a request may ask for.
const MIN_REQUESTED_QUALITY: i64 = 20;

/// Density below which a JPEG is treated as having none.
const BASE_DENSITY: u16 = 72;

/// Smallest well-formed ICC profile: the fixed header.
const ICC_HEADER_LEN: usize = 128;

/// Encoder for a still subject.
///
/// PNG stays PNG and JPEG stays JPEG. Other sources become PNG when they
/// carry alpha, JPEG otherwise.
pub fn output_format(source: SourceFormat, layout: PixelLayout) -> OutputFormat {
    match source {
        SourceFormat::Png => OutputFormat::Png,
        SourceFormat::Jpeg => OutputFormat::Jpeg,
        _ if layout.has_alpha() => OutputFormat::Png,
        _ => OutputFormat::Jpeg,
    }
}

fn clamp_requested(quality: i64, max: u32) -> u32 {
    quality.max(MIN_REQUESTED_QUALITY).min(max as i64) as u32
}

/// PNG quality and the lossless flag.
pub fn png_quality(requested: Option<i64>, png_max: u32) -> (u32, bool) {
    match requested {
        Some(q) => (clamp_requested(q, png_max), q == 100),
        None => (png_max, false),
    }
}

/// JPEG quality and the lossless flag. Without a request the source's own
/// quality is kept when it is below the ceiling.
pub fn jpeg_quality(requested: Option<i64>, jpeg_max: u32, header_quality: Option<u32>) -> (u32, bool) {
    match requested {
        Some(q) => (clamp_requested(q, jpeg_max), q == 100),
        None => (jpeg_max.min(header_quality.unwrap_or(jpeg_max)), false),
    }
}

fn ascii_field(field: &[u8]) -> bool {
    field.iter().all(|&b| b == 0 || (32..=126).contains(&b))
}

/// Structural check of an ICC profile header.
///
/// Size field matches the data, signature fields are ASCII, the major
/// version is plausible and `acsp` sits at offset 36.
pub fn is_valid_icc(profile: &[u8]) -> bool {
    if profile.len() < ICC_HEADER_LEN {
        return false;
    }
    let declared = u32::from_be_bytes([profile[0], profile[1], profile[2], profile[3]]) as usize;
    declared == profile.len()
        && ascii_field(&profile[4..8])
        && profile[8] <= 10
        && ascii_field(&profile[12..16])
        && ascii_field(&profile[16..20])
        && &profile[36..40] == b"acsp"
}

/// Inputs to the primary encode that do not live on the image.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions<'a> {
    pub quality: &'a QualityConfig,
    /// `pngquant` will run afterwards and re-palettes on its own.
    pub pngquant_available: bool,
    pub requested_quality: Option<i64>,
    pub jpeg_header: Option<JpegHeader>,
    /// Layout the source was loaded with.
    pub original_layout: PixelLayout,
}

/// What the primary encode wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    pub format: OutputFormat,
    pub mime_type: MimeType,
    pub quality: u32,
    pub lossless: bool,
    /// Layout at encode time was single-channel grey.
    pub grayscale: bool,
    pub size: u64,
    /// Size of a malformed ICC profile dropped before encode.
    pub icc_profile_removed: Option<usize>,
}

/// Drop a malformed ICC profile. Returns the size of what was dropped.
fn normalize_color_profile(image: &mut dyn RasterImage) -> Option<usize> {
    let profile = image.color_profile().filter(|p| !p.is_empty())?;
    if is_valid_icc(&profile) {
        return None;
    }
    debug!(size = profile.len(), "dropping malformed ICC profile");
    image.set_color_profile(None);
    Some(profile.len())
}

/// Restore the source density when the working image lost it.
fn restore_density(image: &mut dyn RasterImage, header: Option<JpegHeader>) {
    let Some((x, y)) = header.and_then(|h| h.density) else {
        return;
    };
    let (current_x, _) = image.resolution();
    if current_x < BASE_DENSITY && x > BASE_DENSITY {
        image.set_resolution(x, y);
    }
}

/// Encode `image` as `format` into `path`.
pub fn encode_still(
    image: &mut dyn RasterImage,
    format: OutputFormat,
    options: &EncodeOptions<'_>,
    path: &Path,
) -> Result<Encoded, BackendError> {
    let config = options.quality;
    let (quality, lossless, mime_type) = match format {
        OutputFormat::Png => {
            if !options.pngquant_available
                && options.original_layout.is_palette()
                && !image.layout().is_palette()
            {
                image.set_layout(options.original_layout)?;
            }
            if image.layout() == PixelLayout::GrayscaleAlpha {
                image.set_layout(PixelLayout::TrueColorAlpha)?;
            }
            let (quality, lossless) = png_quality(options.requested_quality, config.png_max);
            image.set_format(OutputFormat::Png);
            image.set_compression_quality(config.png_compression());
            (quality, lossless, MimeType::Png)
        }
        OutputFormat::Jpeg | OutputFormat::Gif => {
            let header_quality = options.jpeg_header.and_then(|h| h.quality);
            let (quality, lossless) =
                jpeg_quality(options.requested_quality, config.jpeg_max, header_quality);
            image.set_format(OutputFormat::Jpeg);
            image.set_compression_quality(quality);
            (quality, lossless, MimeType::Jpeg)
        }
    };

    let icc_profile_removed = if config.normalize_color_profile {
        normalize_color_profile(image)
    } else {
        None
    };
    if mime_type == MimeType::Jpeg {
        restore_density(image, options.jpeg_header);
    }

    image.encode_to_file(path)?;
    let size = std::fs::metadata(path)?.len();
    debug!(?format, quality, lossless, size, "encoded working file");

    Ok(Encoded {
        format: if mime_type == MimeType::Png {
            OutputFormat::Png
        } else {
            OutputFormat::Jpeg
        },
        mime_type,
        quality,
        lossless,
        grayscale: image.layout() == PixelLayout::Grayscale,
        size,
        icc_profile_removed,
    })
}

/// `-metadata` value for a strip mode: what `cwebp` should keep.
fn cwebp_metadata(strip: Option<StripMode>) -> &'static str {
    match strip {
        Some(StripMode::All) => "none",
        Some(StripMode::Info) => "icc",
        Some(StripMode::Color) => "exif,xmp",
        Some(StripMode::None) | None => "all",
    }
}

/// `cwebp` flags up to (not including) `-o`.
pub fn cwebp_args(config: &QualityConfig, encoded: &Encoded, strip: Option<StripMode>) -> Vec<OsString> {
    let lossless = encoded.lossless || config.webp_lossless;
    let mut args: Vec<OsString> = vec!["-quiet".into()];
    if lossless {
        args.push("-lossless".into());
    }
    args.push("-metadata".into());
    args.push(cwebp_metadata(strip).into());

    let mut quality = encoded.quality;
    match encoded.format {
        OutputFormat::Png => args.extend(["-alpha_q", "100"].map(OsString::from)),
        OutputFormat::Jpeg if encoded.grayscale && !lossless => {
            quality = config.webp_max;
            args.extend(["-m", "2"].map(OsString::from));
        }
        _ => args.extend(["-m", "2"].map(OsString::from)),
    }

    args.push("-q".into());
    args.push(quality.min(config.webp_max).to_string().into());
    args
}

/// Convert the working file to WebP. `Some` only when the conversion applied.
pub fn negotiate_webp(
    optimizer: &Optimizer<'_>,
    config: &QualityConfig,
    file: &Path,
    encoded: &Encoded,
    strip: Option<StripMode>,
) -> Option<PassOutcome> {
    let rotate = (encoded.format == OutputFormat::Jpeg
        && strip.is_some_and(StripMode::drops_orientation))
    .then_some(encoded.quality);
    let outcome = optimizer.cwebp(file, cwebp_args(config, encoded, strip), rotate)?;
    if outcome.applied {
        info!(
            original_size = outcome.original_size,
            new_size = outcome.new_size,
            "served as WebP"
        );
        Some(outcome)
    } else {
        debug!("WebP conversion failed, keeping primary format");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::{MockBackend, RecordedOp};
    use crate::imaging::{ImageBackend, RustBackend};
    use tempfile::TempDir;

    fn valid_icc() -> Vec<u8> {
        let mut icc = vec![0u8; 132];
        icc[..4].copy_from_slice(&132u32.to_be_bytes());
        icc[8] = 4;
        icc[12..16].copy_from_slice(b"mntr");
        icc[16..20].copy_from_slice(b"RGB ");
        icc[36..40].copy_from_slice(b"acsp");
        icc
    }

    fn options(config: &QualityConfig, layout: PixelLayout) -> EncodeOptions<'_> {
        EncodeOptions {
            quality: config,
            pngquant_available: false,
            requested_quality: None,
            jpeg_header: None,
            original_layout: layout,
        }
    }

    fn encoded(format: OutputFormat, quality: u32) -> Encoded {
        Encoded {
            format,
            mime_type: if format == OutputFormat::Png {
                MimeType::Png
            } else {
                MimeType::Jpeg
            },
            quality,
            lossless: false,
            grayscale: false,
            size: 100,
            icc_profile_removed: None,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    // =========================================================================
    // Format and quality selection
    // =========================================================================

    #[test]
    fn format_follows_source_and_alpha() {
        use PixelLayout::*;
        assert_eq!(output_format(SourceFormat::Png, TrueColor), OutputFormat::Png);
        assert_eq!(output_format(SourceFormat::Jpeg, TrueColor), OutputFormat::Jpeg);
        assert_eq!(output_format(SourceFormat::WebP, TrueColorAlpha), OutputFormat::Png);
        assert_eq!(output_format(SourceFormat::Bmp, TrueColor), OutputFormat::Jpeg);
    }

    #[test]
    fn requested_quality_is_clamped() {
        assert_eq!(png_quality(Some(5), 90), (20, false));
        assert_eq!(png_quality(Some(100), 90), (90, true));
        assert_eq!(png_quality(None, 90), (90, false));
        assert_eq!(jpeg_quality(Some(-3), 85, Some(60)), (20, false));
        assert_eq!(jpeg_quality(Some(70), 85, Some(60)), (70, false));
    }

    #[test]
    fn jpeg_keeps_lower_source_quality() {
        assert_eq!(jpeg_quality(None, 85, Some(60)), (60, false));
        assert_eq!(jpeg_quality(None, 85, Some(95)), (85, false));
        assert_eq!(jpeg_quality(None, 85, None), (85, false));
    }

    #[test]
    fn ceiling_below_minimum_wins() {
        assert_eq!(jpeg_quality(Some(50), 10, None), (10, false));
    }

    // =========================================================================
    // ICC validation
    // =========================================================================

    #[test]
    fn icc_header_checks() {
        assert!(is_valid_icc(&valid_icc()));

        let mut wrong_size = valid_icc();
        wrong_size[3] = 200;
        assert!(!is_valid_icc(&wrong_size));

        let mut no_signature = valid_icc();
        no_signature[36..40].copy_from_slice(b"xxxx");
        assert!(!is_valid_icc(&no_signature));

        let mut future_version = valid_icc();
        future_version[8] = 42;
        assert!(!is_valid_icc(&future_version));

        assert!(!is_valid_icc(&[0u8; 16]));
    }

    // =========================================================================
    // Primary encode
    // =========================================================================

    #[test]
    fn palette_png_is_restored_without_pngquant() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pre-out");
        let config = QualityConfig::default();
        let mut backend = MockBackend::with_dimensions(10, 10, SourceFormat::Png);
        backend.layout = Some(PixelLayout::TrueColor);
        let mut image = backend.load(b"").unwrap();

        let result = encode_still(
            image.as_mut(),
            OutputFormat::Png,
            &options(&config, PixelLayout::Palette),
            &path,
        )
        .unwrap();

        assert_eq!(result.mime_type, MimeType::Png);
        let ops = backend.get_operations();
        assert!(ops.contains(&RecordedOp::SetLayout(PixelLayout::Palette)));
        assert!(ops.contains(&RecordedOp::SetQuality(config.png_compression())));
        assert_eq!(std::fs::read(&path).unwrap(), b"mock-png");
    }

    #[test]
    fn pngquant_keeps_true_color_for_itself() {
        let dir = TempDir::new().unwrap();
        let config = QualityConfig::default();
        let mut backend = MockBackend::with_dimensions(10, 10, SourceFormat::Png);
        backend.layout = Some(PixelLayout::TrueColor);
        let mut image = backend.load(b"").unwrap();
        let mut opts = options(&config, PixelLayout::Palette);
        opts.pngquant_available = true;

        encode_still(image.as_mut(), OutputFormat::Png, &opts, &dir.path().join("out")).unwrap();

        assert!(
            !backend
                .get_operations()
                .iter()
                .any(|op| matches!(op, RecordedOp::SetLayout(_)))
        );
    }

    #[test]
    fn grayscale_alpha_png_becomes_true_color_alpha() {
        let dir = TempDir::new().unwrap();
        let config = QualityConfig::default();
        let mut backend = MockBackend::with_dimensions(10, 10, SourceFormat::Png);
        backend.layout = Some(PixelLayout::GrayscaleAlpha);
        let mut image = backend.load(b"").unwrap();

        encode_still(
            image.as_mut(),
            OutputFormat::Png,
            &options(&config, PixelLayout::GrayscaleAlpha),
            &dir.path().join("out"),
        )
        .unwrap();

        assert_eq!(image.layout(), PixelLayout::TrueColorAlpha);
    }

    #[test]
    fn malformed_profile_is_dropped_valid_one_kept() {
        let dir = TempDir::new().unwrap();
        let config = QualityConfig::default();

        let mut backend = MockBackend::with_dimensions(10, 10, SourceFormat::Jpeg);
        backend.profile = Some(vec![1, 2, 3]);
        let mut image = backend.load(b"").unwrap();
        let result = encode_still(
            image.as_mut(),
            OutputFormat::Jpeg,
            &options(&config, PixelLayout::TrueColor),
            &dir.path().join("a"),
        )
        .unwrap();
        assert_eq!(result.icc_profile_removed, Some(3));
        assert!(backend.get_operations().contains(&RecordedOp::SetColorProfile(None)));

        let mut backend = MockBackend::with_dimensions(10, 10, SourceFormat::Jpeg);
        backend.profile = Some(valid_icc());
        let mut image = backend.load(b"").unwrap();
        let result = encode_still(
            image.as_mut(),
            OutputFormat::Jpeg,
            &options(&config, PixelLayout::TrueColor),
            &dir.path().join("b"),
        )
        .unwrap();
        assert_eq!(result.icc_profile_removed, None);
        assert_eq!(image.color_profile(), Some(valid_icc()));
    }

    #[test]
    fn jpeg_density_restored_from_header() {
        let dir = TempDir::new().unwrap();
        let config = QualityConfig::default();
        let backend = MockBackend::with_dimensions(10, 10, SourceFormat::Jpeg);
        let mut image = backend.load(b"").unwrap();
        let mut opts = options(&config, PixelLayout::TrueColor);
        opts.jpeg_header = Some(JpegHeader {
            width: 10,
            height: 10,
            density: Some((300, 300)),
            quality: Some(75),
        });

        let result =
            encode_still(image.as_mut(), OutputFormat::Jpeg, &opts, &dir.path().join("out")).unwrap();

        assert_eq!(result.quality, 75);
        assert_eq!(image.resolution(), (300, 300));
    }

    #[test]
    fn real_jpeg_encode_writes_decodable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        let config = QualityConfig::default();
        let data = crate::imaging::rust_backend::tests::synthetic_jpeg(40, 30);
        let mut image = RustBackend::new().load(&data).unwrap();

        let result = encode_still(
            image.as_mut(),
            OutputFormat::Jpeg,
            &options(&config, PixelLayout::TrueColor),
            &path,
        )
        .unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(result.size, written.len() as u64);
        assert_eq!(image::guess_format(&written).unwrap(), image::ImageFormat::Jpeg);
    }

    // =========================================================================
    // cwebp arguments
    // =========================================================================

    #[test]
    fn cwebp_args_for_jpeg() {
        let config = QualityConfig {
            webp_max: 80,
            ..QualityConfig::default()
        };
        let args = strings(cwebp_args(&config, &encoded(OutputFormat::Jpeg, 90), Some(StripMode::All)));
        assert_eq!(args, ["-quiet", "-metadata", "none", "-m", "2", "-q", "80"]);
    }

    #[test]
    fn cwebp_args_for_png_lossless() {
        let config = QualityConfig::default();
        let mut png = encoded(OutputFormat::Png, 100);
        png.lossless = true;
        let args = strings(cwebp_args(&config, &png, None));
        assert_eq!(
            args,
            ["-quiet", "-lossless", "-metadata", "all", "-alpha_q", "100", "-q", "100"]
        );
    }

    #[test]
    fn grayscale_jpeg_uses_webp_ceiling() {
        let config = QualityConfig {
            webp_max: 70,
            ..QualityConfig::default()
        };
        let mut gray = encoded(OutputFormat::Jpeg, 40);
        gray.grayscale = true;
        let args = strings(cwebp_args(&config, &gray, Some(StripMode::Color)));
        assert_eq!(args, ["-quiet", "-metadata", "exif,xmp", "-m", "2", "-q", "70"]);
    }
}
