//! Full requests through the public API with the real `image` backend.

use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{Delay, Frame, GenericImageView, ImageEncoder, Rgb, RgbImage, Rgba, RgbaImage};
use image_proxy::config::ProxyConfig;
use image_proxy::engine::{Engine, Transformed};
use image_proxy::imaging::{MimeType, RustBackend};
use image_proxy::optimize::ProcessRunner;
use image_proxy::request::ClientRequest;
use image_proxy::response;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

/// Bright gradient JPEG: every row average is far from black.
fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(100 + x % 100) as u8, (100 + y % 100) as u8, 200])
    });
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, 90)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    buf
}

fn png_with_alpha(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, _| Rgba([200, 100, (x % 256) as u8, 128]));
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgba8)
        .unwrap();
    buf
}

fn gif(width: u32, height: u32) -> Vec<u8> {
    let frames = [Rgba([255, 0, 0, 255]), Rgba([0, 255, 0, 255])]
        .into_iter()
        .map(|color| {
            Frame::from_parts(
                RgbaImage::from_pixel(width, height, color),
                0,
                0,
                Delay::from_numer_denom_ms(80, 1),
            )
        });
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

fn config_in(dir: &TempDir) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.optimizers.temp_dir = Some(dir.path().to_path_buf());
    config
}

fn run(config: &ProxyConfig, source: &[u8], query: &str) -> Transformed {
    let backend = RustBackend::new();
    Engine::new(config, &backend, &ProcessRunner)
        .transform(source, &ClientRequest::from_query(query))
        .unwrap()
}

fn output_dimensions(result: &Transformed) -> (u32, u32) {
    image::load_from_memory(&result.bytes).unwrap().dimensions()
}

// =============================================================================
// Geometry scenarios
// =============================================================================

#[test]
fn width_halves_a_jpeg() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &jpeg(400, 300), "w=200");

    assert_eq!(result.mime_type(), MimeType::Jpeg);
    assert_eq!(output_dimensions(&result), (200, 150));
    assert_eq!(result.subject.applied, vec!["set_width"]);
}

#[test]
fn crop_flag_yields_exact_square() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &jpeg(400, 300), "crop=1&w=100&h=100");

    assert_eq!(output_dimensions(&result), (100, 100));
    assert_eq!(result.subject.applied, vec!["crop"]);
}

#[test]
fn unauthorized_upscale_returns_original_bytes() {
    let dir = TempDir::new().unwrap();
    let source = jpeg(10, 10);
    let result = run(&config_in(&dir), &source, "w=50&h=50");

    assert!(result.passthrough);
    assert_eq!(result.bytes, source);
    assert_eq!(output_dimensions(&result), (10, 10));
}

#[test]
fn height_wins_over_later_width_without_chaining() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &jpeg(400, 300), "h=100&w=50");
    assert_eq!(output_dimensions(&result), (133, 100));

    let mut chaining = config_in(&dir);
    chaining.limits.allow_dims_chaining = true;
    let result = run(&chaining, &jpeg(400, 300), "h=100&w=50");
    assert_eq!(output_dimensions(&result), (50, 37));
}

#[test]
fn letterbox_then_unletterbox_recovers_content() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &jpeg(400, 200), "lb=400,400&ulb=true");

    assert_eq!(result.subject.applied, vec!["letterbox", "unletterbox"]);
    let (width, height) = output_dimensions(&result);
    assert_eq!(width, 400);
    assert!(height.abs_diff(200) <= 1, "height {height}");
}

#[test]
fn offset_crop_in_pixels_and_percent() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &jpeg(400, 300), "crop=10px,10px,50,50");
    assert_eq!(output_dimensions(&result), (200, 150));
}

#[test]
fn filter_keeps_dimensions() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &jpeg(60, 40), "filter=grayscale&brightness=10");
    assert_eq!(result.subject.applied, vec!["grayscale", "brightness"]);
    assert_eq!(output_dimensions(&result), (60, 40));
}

// =============================================================================
// Formats
// =============================================================================

#[test]
fn transparent_png_stays_png() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &png_with_alpha(80, 40), "w=40");

    assert_eq!(result.mime_type(), MimeType::Png);
    let decoded = image::load_from_memory(&result.bytes).unwrap();
    assert_eq!(decoded.dimensions(), (40, 20));
    assert!(decoded.color().has_alpha());
}

#[test]
fn animated_gif_is_resized_frame_by_frame() {
    let dir = TempDir::new().unwrap();
    let result = run(&config_in(&dir), &gif(40, 20), "w=20");

    assert_eq!(result.mime_type(), MimeType::Gif);
    assert!(result.bytes.starts_with(b"GIF8"));
    assert_eq!(output_dimensions(&result), (20, 10));
}

#[test]
fn quality_reencodes_an_untouched_jpeg() {
    let dir = TempDir::new().unwrap();
    let source = jpeg(100, 100);
    let result = run(&config_in(&dir), &source, "quality=30");

    assert!(!result.passthrough);
    assert_eq!(result.subject.quality, Some(30));
    assert!(result.bytes.len() < source.len());
}

#[test]
fn short_input_is_refused() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let backend = RustBackend::new();
    let err = Engine::new(&config, &backend, &ProcessRunner)
        .transform(b"GIF89a", &ClientRequest::from_query("w=10"))
        .unwrap_err();
    assert!(err.to_string().contains("too short"));
}

// =============================================================================
// Response
// =============================================================================

#[test]
fn headers_describe_the_result() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.response.max_age = Some(3600);
    let result = run(&config, &jpeg(400, 300), "w=200");
    let modified = UNIX_EPOCH + Duration::from_secs(784_111_777);

    let headers = response::headers(&config, &result, None, modified, modified);

    assert_eq!(headers[0], ("Content-Length", result.bytes.len().to_string()));
    assert_eq!(headers[1], ("Content-Type", "image/jpeg".to_string()));
    assert_eq!(headers[2].1, "Sun, 06 Nov 1994 08:49:37 GMT");
    assert_eq!(headers[3].1, "Sun, 06 Nov 1994 09:49:37 GMT");
    assert_eq!(headers[4].1, "public, max-age=3600");
}
