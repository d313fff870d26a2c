//! Filter-family pixel operations.
//!
//! Each [`Effect`] maps onto `image`'s built-in operations where one exists
//! (invert, brighten, contrast, blur) and onto a 3x3 convolution otherwise.
//! Kernels, divisors and offsets follow the classic GD filter definitions so
//! that `filter=emboss` looks the same here as on any GD-backed image service.
//!
//! Alpha is carried through unchanged; an opaque input stays opaque.

use super::params::{Effect, FilterKind};
use image::{DynamicImage, Rgba, RgbaImage};

struct Kernel {
    weights: [f32; 9],
    divisor: f32,
    offset: f32,
}

const EDGE_DETECT: Kernel = Kernel {
    weights: [-1.0, 0.0, -1.0, 0.0, 4.0, 0.0, -1.0, 0.0, -1.0],
    divisor: 1.0,
    offset: 127.0,
};

const EMBOSS: Kernel = Kernel {
    weights: [1.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.5],
    divisor: 1.0,
    offset: 127.0,
};

const GAUSSIAN: Kernel = Kernel {
    weights: [1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0],
    divisor: 16.0,
    offset: 0.0,
};

const MEAN_REMOVAL: Kernel = Kernel {
    weights: [-1.0, -1.0, -1.0, -1.0, 9.0, -1.0, -1.0, -1.0, -1.0],
    divisor: 1.0,
    offset: 0.0,
};

/// Sigma used for the selective (edge-preserving) blur approximation.
const SELECTIVE_BLUR_SIGMA: f32 = 0.8;

/// Sepia is a grayscale pass followed by this tint.
const SEPIA_TINT: (i32, i32, i32) = (100, 50, 0);

/// Apply `effect` to `image`, returning the new image.
pub fn apply(image: &DynamicImage, effect: &Effect) -> DynamicImage {
    match *effect {
        Effect::Filter(kind) => apply_filter(image, kind),
        Effect::Brightness(level) => image.brighten(level.clamp(-255, 255)),
        // negative raises contrast, `image` uses the opposite sign
        Effect::Contrast(level) => image.adjust_contrast(-(level.clamp(-100, 100) as f32)),
        Effect::Colorize { red, green, blue } => colorize(image, red, green, blue),
        Effect::Smooth(weight) => convolve(
            image,
            &Kernel {
                weights: [1.0, 1.0, 1.0, 1.0, weight, 1.0, 1.0, 1.0, 1.0],
                divisor: weight + 8.0,
                offset: 0.0,
            },
        ),
    }
}

fn apply_filter(image: &DynamicImage, kind: FilterKind) -> DynamicImage {
    match kind {
        FilterKind::Negate => {
            let mut inverted = image.clone();
            inverted.invert();
            inverted
        }
        FilterKind::Grayscale => grayscale(image),
        FilterKind::Sepia => {
            let (r, g, b) = SEPIA_TINT;
            colorize(&grayscale(image), r, g, b)
        }
        FilterKind::EdgeDetect => convolve(image, &EDGE_DETECT),
        FilterKind::Emboss => convolve(image, &EMBOSS),
        FilterKind::BlurGaussian => convolve(image, &GAUSSIAN),
        FilterKind::BlurSelective => image.blur(SELECTIVE_BLUR_SIGMA),
        FilterKind::MeanRemoval => convolve(image, &MEAN_REMOVAL),
    }
}

/// Rebuild a dynamic image in the colour model of `like`.
fn restore_model(like: &DynamicImage, rgba: RgbaImage) -> DynamicImage {
    let out = DynamicImage::ImageRgba8(rgba);
    if like.color().has_alpha() {
        out
    } else {
        DynamicImage::ImageRgb8(out.to_rgb8())
    }
}

/// Luma-only pixels in the input's channel layout, so an RGB JPEG stays RGB.
fn grayscale(image: &DynamicImage) -> DynamicImage {
    let gray = image.grayscale();
    restore_model(image, gray.to_rgba8())
}

fn colorize(image: &DynamicImage, red: i32, green: i32, blue: i32) -> DynamicImage {
    let tint = [red.clamp(-255, 255), green.clamp(-255, 255), blue.clamp(-255, 255)];
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        for (channel, delta) in pixel.0.iter_mut().zip(tint) {
            *channel = (*channel as i32 + delta).clamp(0, 255) as u8;
        }
    }
    restore_model(image, rgba)
}

fn convolve(image: &DynamicImage, kernel: &Kernel) -> DynamicImage {
    let source = image.to_rgba8();
    let (width, height) = source.dimensions();
    if width == 0 || height == 0 || kernel.divisor == 0.0 {
        return image.clone();
    }

    let clamp_x = |x: i64| x.clamp(0, width as i64 - 1) as u32;
    let clamp_y = |y: i64| y.clamp(0, height as i64 - 1) as u32;

    let out = RgbaImage::from_fn(width, height, |x, y| {
        let mut acc = [0f32; 3];
        for (i, weight) in kernel.weights.iter().enumerate() {
            if *weight == 0.0 {
                continue;
            }
            let dx = (i % 3) as i64 - 1;
            let dy = (i / 3) as i64 - 1;
            let sample = source.get_pixel(clamp_x(x as i64 + dx), clamp_y(y as i64 + dy));
            for (total, &channel) in acc.iter_mut().zip(&sample.0[..3]) {
                *total += channel as f32 * weight;
            }
        }
        let alpha = source.get_pixel(x, y).0[3];
        let finish = |total: f32| {
            (total / kernel.divisor + kernel.offset)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgba([finish(acc[0]), finish(acc[1]), finish(acc[2]), alpha])
    });

    restore_model(image, out)
}
