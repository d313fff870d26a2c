//! Letterbox and unletterbox geometry.
//!
//! [`letterbox`] fits the image into a box and pads it with solid borders to
//! the exact box size. [`detect_content_band`] does the reverse: it finds the
//! rows between a solid top and bottom border by scanning scan-lines.
//!
//! Detection works on row *averages* rather than exact matches because
//! lossy sources carry per-pixel noise near the border edge.

use super::calculations::{Dimensions, MIN_DIMENSION};
use super::params::Rgb;

/// Per-channel tolerance for the top scan-line to count as a uniform border.
const BORDER_UNIFORMITY: i32 = 1;

/// Per-channel deviation of a row average that marks the start of content.
const CONTENT_THRESHOLD: f64 = 10.0;

/// Parse a letterbox border colour: `rrggbb` or `rgb`, with or without `#`.
///
/// Anything else is black.
pub fn parse_border_color(value: Option<&str>) -> Rgb {
    let Some(value) = value else {
        return Rgb::BLACK;
    };
    let hex = value.trim().trim_start_matches('#');
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Rgb::BLACK;
    }

    let expanded: String = match hex.len() {
        6 => hex.to_string(),
        3 => hex.chars().flat_map(|c| [c, c]).collect(),
        _ => return Rgb::BLACK,
    };
    let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).unwrap_or(0);

    Rgb {
        red: channel(0),
        green: channel(2),
        blue: channel(4),
    }
}

/// Resolved letterbox plan.
///
/// Apply in order: scale to `scaled`, add `border_width`/`border_height` on
/// each side, then (when either trim is non-zero) crop `target` at
/// `(trim_x, trim_y)` to remove the rounding excess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LetterboxGeometry {
    pub scaled: Dimensions,
    pub border_width: u32,
    pub border_height: u32,
    pub trim_x: u32,
    pub trim_y: u32,
    pub target: Dimensions,
}

impl LetterboxGeometry {
    pub fn needs_trim(&self) -> bool {
        self.trim_x != 0 || self.trim_y != 0
    }
}

/// Size of `current` scaled to fit inside `target`, aspect preserved.
fn fit_within(current: Dimensions, target: Dimensions) -> Dimensions {
    let ratio_w = target.width as f64 / current.width as f64;
    let ratio_h = target.height as f64 / current.height as f64;
    if ratio_w <= ratio_h {
        let h = (current.height as f64 * ratio_w).round() as u32;
        Dimensions::new(target.width, h.clamp(1, target.height))
    } else {
        let w = (current.width as f64 * ratio_h).round() as u32;
        Dimensions::new(w.clamp(1, target.width), target.height)
    }
}

/// Plan a letterbox of `current` into `width` x `height`.
///
/// Refused when the box equals the current size, has a zero (or below
/// minimum) side, is larger than the source on both axes, or would need a
/// border wider than `upscale_max` pixels.
pub fn letterbox(
    current: Dimensions,
    width: u32,
    height: u32,
    upscale_max: u32,
) -> Option<LetterboxGeometry> {
    if (current.width == width && current.height == height)
        || width < MIN_DIMENSION
        || height < MIN_DIMENSION
        || (current.width < width && current.height < height)
    {
        return None;
    }

    let target = Dimensions::new(width, height);
    let scaled = fit_within(current, target);

    let border_height = ((height - scaled.height) as f64 / 2.0).round() as u32;
    let border_width = ((width - scaled.width) as f64 / 2.0).round() as u32;
    if border_height > upscale_max || border_width > upscale_max {
        return None;
    }

    Some(LetterboxGeometry {
        scaled,
        border_width,
        border_height,
        trim_x: border_width * 2 + scaled.width - width,
        trim_y: border_height * 2 + scaled.height - height,
        target,
    })
}

/// Rows of content between a uniform top border and its matching bottom border.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentBand {
    /// First content row.
    pub top: u32,
    /// One past the last content row.
    pub bottom: u32,
}

impl ContentBand {
    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

fn row_deviates(border: [u8; 3], row: &[[u8; 3]]) -> bool {
    if row.is_empty() {
        return false;
    }
    let mut totals = [0u64; 3];
    for pixel in row {
        for (total, &channel) in totals.iter_mut().zip(pixel) {
            *total += channel as u64;
        }
    }
    let n = row.len() as f64;
    border
        .iter()
        .zip(totals)
        .any(|(&b, total)| (b as f64 - total as f64 / n).abs() > CONTENT_THRESHOLD)
}

/// Find the content band of a letterboxed image.
///
/// `row(y)` returns the RGB pixels of scan-line `y`. The top scan-line must be
/// uniform within ±1 per channel; its first pixel is the border colour. The
/// band starts at the first row (from row 1 down) whose average deviates by
/// more than 10 on any channel, and ends after the last such row scanning up
/// from the bottom.
pub fn detect_content_band<F>(height: u32, mut row: F) -> Option<ContentBand>
where
    F: FnMut(u32) -> Vec<[u8; 3]>,
{
    if height == 0 {
        return None;
    }

    let top_line = row(0);
    let border = *top_line.first()?;
    let uniform = top_line.iter().all(|pixel| {
        pixel
            .iter()
            .zip(border)
            .all(|(&c, b)| (c as i32 - b as i32).abs() <= BORDER_UNIFORMITY)
    });
    if !uniform {
        return None;
    }

    let top = (1..height).find(|&y| row_deviates(border, &row(y)))?;
    let bottom = (0..height)
        .rev()
        .find(|&y| row_deviates(border, &row(y)))
        .map(|y| y + 1)?;

    if bottom <= top {
        return None;
    }
    Some(ContentBand { top, bottom })
}
