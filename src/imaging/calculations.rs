//! Pure calculation functions for image geometry.
//!
//! All functions here are pure and testable without any I/O or images. They
//! take the *current* dimensions of the working image plus typed directive
//! arguments and return a fully resolved [`Geometry`], or `None` when the
//! arguments cannot describe a transformation at all. Policy checks on the
//! resulting size (minimum dimension, upscale permission) belong to the
//! [`gate`](super::gate), which runs on every geometry before it is applied.

use super::params::{Length, Unit};
use super::zoom::settle;

/// Smallest width or height any transformation may produce.
pub const MIN_DIMENSION: u32 = 3;

/// Width and height of an image, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn aspect(self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Resolved geometry: crop a source rectangle, then scale it to the final size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub crop_width: u32,
    pub crop_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    /// Scale the whole image, no crop.
    fn scale_only(current: Dimensions, width: u32, height: u32) -> Self {
        Self {
            crop_width: current.width,
            crop_height: current.height,
            offset_x: 0,
            offset_y: 0,
            width,
            height,
        }
    }

    /// Crop a region, no scale.
    fn crop_only(width: u32, height: u32, offset_x: u32, offset_y: u32) -> Self {
        Self {
            crop_width: width,
            crop_height: height,
            offset_x,
            offset_y,
            width,
            height,
        }
    }

    pub fn needs_crop(&self, current: Dimensions) -> bool {
        self.crop_width != current.width
            || self.crop_height != current.height
            || self.offset_x != 0
            || self.offset_y != 0
    }

    pub fn needs_scale(&self) -> bool {
        self.crop_width != self.width || self.crop_height != self.height
    }

    pub fn output(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// One coordinate of a `crop_offset` region: pixels (`12px`) or percent (`12`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub value: i64,
    pub unit: Unit,
}

impl Offset {
    pub fn pixels(value: i64) -> Self {
        Self {
            value,
            unit: Unit::Pixels,
        }
    }

    pub fn percent(value: i64) -> Self {
        Self {
            value,
            unit: Unit::Percent,
        }
    }
}

/// The four coordinates of a `crop=x,y,w,h` / `crop_offset=x,y,w,h` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRegion {
    pub x: Offset,
    pub y: Offset,
    pub width: Offset,
    pub height: Offset,
}

fn percent_of(extent: u32, value: i64) -> i64 {
    (extent as f64 * value.unsigned_abs() as f64 / 100.0).round() as i64
}

/// Aspect-preserving crop-then-scale (`crop=1` with `w` and/or `h`).
///
/// The missing dimension is inferred from the source aspect ratio. Targets
/// never exceed the source; the largest centred region with the target aspect
/// is cropped and scaled down to exactly the target.
///
/// # Examples
/// ```
/// # use image_proxy::imaging::{Dimensions, crop};
/// // 400x300 → 100x100: crop the centred 300x300 square, scale down
/// let g = crop(Dimensions::new(400, 300), Some(100), Some(100)).unwrap();
/// assert_eq!((g.crop_width, g.crop_height, g.offset_x, g.offset_y), (300, 300, 50, 0));
/// assert_eq!((g.width, g.height), (100, 100));
/// ```
pub fn crop(current: Dimensions, width: Option<u32>, height: Option<u32>) -> Option<Geometry> {
    let aspect = current.aspect();
    let requested_w = width.filter(|&w| w > 0).map(|w| w.min(current.width));
    let requested_h = height.filter(|&h| h > 0).map(|h| h.min(current.height));

    let (new_w, new_h) = match (requested_w, requested_h) {
        (None, None) => return None,
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, (w as f64 / aspect) as u32),
        (None, Some(h)) => ((h as f64 * aspect) as u32, h),
    };

    let size_ratio = (new_w as f64 / current.width as f64).max(new_h as f64 / current.height as f64);

    let crop_w = ((new_w as f64 / size_ratio).ceil() as u32).min(current.width);
    let crop_h = ((new_h as f64 / size_ratio).ceil() as u32).min(current.height);

    let offset_x = ((current.width - crop_w) as f64 / 2.0).round() as u32;
    let offset_y = ((current.height - crop_h) as f64 / 2.0).round() as u32;

    Some(Geometry {
        crop_width: crop_w,
        crop_height: crop_h,
        offset_x,
        offset_y,
        width: new_w,
        height: new_h,
    })
}

/// Explicit region crop. Never extends past the source bounds.
///
/// Percent coordinates are `round(extent * |value| / 100)`. Offsets at or
/// past the source edge reset to 0, negative pixel offsets clamp to 0, and
/// the region is clipped to what remains after the offset.
pub fn crop_offset(current: Dimensions, region: &OffsetRegion) -> Geometry {
    let src_w = current.width as i64;
    let src_h = current.height as i64;

    let length = |extent: u32, o: Offset| match o.unit {
        Unit::Pixels => o.value.clamp(0, extent as i64),
        Unit::Percent => percent_of(extent, o.value),
    };
    let position = |extent: u32, o: Offset| match o.unit {
        Unit::Pixels => o.value.max(0),
        Unit::Percent => percent_of(extent, o.value),
    };

    let mut new_w = length(current.width, region.width);
    let mut new_h = length(current.height, region.height);
    let mut s_x = position(current.width, region.x);
    let mut s_y = position(current.height, region.y);

    if s_x >= src_w {
        s_x = 0;
    }
    if s_y >= src_h {
        s_y = 0;
    }
    new_w = new_w.min(src_w - s_x);
    new_h = new_h.min(src_h - s_y);

    Geometry::crop_only(new_w as u32, new_h as u32, s_x as u32, s_y as u32)
}

/// Exact-size resize: crop the centred region with the *target* aspect ratio,
/// then scale to exactly `width` x `height`.
///
/// Upscaling is allowed, but no axis may grow past `upscale_max` pixels.
pub fn resize(current: Dimensions, width: i64, height: i64, upscale_max: u32) -> Option<Geometry> {
    let max = upscale_max as i64;
    if width <= 0
        || height <= 0
        || (width > current.width as i64 && width > max)
        || (height > current.height as i64 && height > max)
    {
        return None;
    }

    let ratio_orig = current.aspect();
    let ratio_end = width as f64 / height as f64;

    let (crop_w, crop_h) = if ratio_orig > ratio_end {
        // crop off the sides
        (
            (current.height as f64 * ratio_end).round() as u32,
            current.height,
        )
    } else {
        // crop off top and bottom
        (
            current.width,
            (current.width as f64 / ratio_end).round() as u32,
        )
    };
    let crop_w = crop_w.clamp(1, current.width);
    let crop_h = crop_h.clamp(1, current.height);

    Some(Geometry {
        crop_width: crop_w,
        crop_height: crop_h,
        offset_x: (current.width - crop_w) / 2,
        offset_y: (current.height - crop_h) / 2,
        width: width as u32,
        height: height as u32,
    })
}

/// Fit the whole image inside a `width` x `height` box, preserving aspect.
///
/// Both box dimensions are required, and a box larger than the source on
/// both axes is meaningless (it would only upscale) and is refused.
pub fn fit(current: Dimensions, width: i64, height: i64) -> Option<Geometry> {
    let box_w = width.unsigned_abs();
    let box_h = height.unsigned_abs();

    if box_w == 0
        || box_h == 0
        || ((current.width as u64) < box_w && (current.height as u64) < box_h)
    {
        return None;
    }

    let src_w = current.width as f64;
    let src_h = current.height as f64;
    let fit_w = |h: u64| (src_w / (src_h / h as f64)).round() as u64;
    let fit_h = |w: u64| (src_h / (src_w / w as f64)).round() as u64;

    let (new_w, new_h) = if current.aspect() >= box_w as f64 / box_h as f64 {
        let w = fit_w(box_h);
        if w > box_w {
            (box_w, fit_h(box_w))
        } else {
            (w, box_h)
        }
    } else {
        let h = fit_h(box_w);
        if h > box_h {
            (fit_w(box_h), box_h)
        } else {
            (box_w, h)
        }
    };

    Some(Geometry::scale_only(
        current,
        u32::try_from(new_w).ok()?,
        u32::try_from(new_h).ok()?,
    ))
}

/// Resolve a `Length` against one axis: percent of `extent`, or truncated pixels.
fn resolve_axis(extent: u32, length: Length) -> i64 {
    let value = length.value.trunc();
    match length.unit {
        Unit::Percent => (extent as f64 * value.abs() / 100.0).round() as i64,
        Unit::Pixels => value as i64,
    }
}

/// Scale both axes by the ratio implied on one axis. Results truncate.
fn scale_by_ratio(current: Dimensions, ratio: f64) -> Option<Geometry> {
    if ratio == 0.0 || !ratio.is_finite() {
        return None;
    }
    let new_w = settle(current.width as f64 / ratio) as u32;
    let new_h = settle(current.height as f64 / ratio) as u32;
    Some(Geometry::scale_only(current, new_w, new_h))
}

/// Single-axis resize on width; height follows the current/target ratio.
///
/// # Examples
/// ```
/// # use image_proxy::imaging::{Dimensions, Length, set_width};
/// let g = set_width(Dimensions::new(400, 300), Length::pixels(200.0)).unwrap();
/// assert_eq!((g.width, g.height), (200, 150));
/// ```
pub fn set_width(current: Dimensions, width: Length) -> Option<Geometry> {
    let width = resolve_axis(current.width, width);
    if width <= 0 {
        return None;
    }
    scale_by_ratio(current, current.width as f64 / width as f64)
}

/// Single-axis resize on height; width follows the current/target ratio.
pub fn set_height(current: Dimensions, height: Length) -> Option<Geometry> {
    let height = resolve_axis(current.height, height);
    if height <= 0 {
        return None;
    }
    scale_by_ratio(current, current.height as f64 / height as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(w: u32, h: u32) -> Dimensions {
        Dimensions::new(w, h)
    }

    fn region(x: Offset, y: Offset, w: Offset, h: Offset) -> OffsetRegion {
        OffsetRegion {
            x,
            y,
            width: w,
            height: h,
        }
    }

    // =========================================================================
    // crop tests
    // =========================================================================

    #[test]
    fn crop_square_from_landscape() {
        let g = crop(dims(400, 300), Some(100), Some(100)).unwrap();
        assert_eq!((g.crop_width, g.crop_height), (300, 300));
        assert_eq!((g.offset_x, g.offset_y), (50, 0));
        assert_eq!(g.output(), dims(100, 100));
    }

    #[test]
    fn crop_width_only_infers_height() {
        let g = crop(dims(400, 300), Some(200), None).unwrap();
        assert_eq!(g.output(), dims(200, 150));
        assert!(!g.needs_crop(dims(400, 300)));
    }

    #[test]
    fn crop_height_only_infers_width() {
        let g = crop(dims(400, 300), None, Some(150)).unwrap();
        assert_eq!(g.output(), dims(200, 150));
    }

    #[test]
    fn crop_clamps_targets_to_source() {
        // 1000 wide requested on a 400 wide source
        let g = crop(dims(400, 300), Some(1000), Some(100)).unwrap();
        assert_eq!(g.width, 400);
        assert_eq!(g.crop_width, 400);
        assert_eq!(g.crop_height, 100);
        assert_eq!(g.offset_y, 100);
    }

    #[test]
    fn crop_without_any_target_is_none() {
        assert_eq!(crop(dims(400, 300), None, None), None);
        assert_eq!(crop(dims(400, 300), Some(0), Some(0)), None);
    }

    #[test]
    fn crop_portrait_target_from_landscape() {
        // 300x400 portrait out of 800x600
        let g = crop(dims(800, 600), Some(300), Some(400)).unwrap();
        assert_eq!(g.crop_height, 600);
        assert_eq!(g.crop_width, 450);
        assert_eq!(g.offset_x, 175);
        assert_eq!(g.output(), dims(300, 400));
    }

    // =========================================================================
    // crop_offset tests
    // =========================================================================

    #[test]
    fn crop_offset_percentages() {
        let g = crop_offset(
            dims(400, 300),
            &region(
                Offset::percent(10),
                Offset::percent(10),
                Offset::percent(50),
                Offset::percent(50),
            ),
        );
        assert_eq!((g.offset_x, g.offset_y), (40, 30));
        assert_eq!(g.output(), dims(200, 150));
        assert!(!g.needs_scale());
    }

    #[test]
    fn crop_offset_pixels() {
        let g = crop_offset(
            dims(400, 300),
            &region(
                Offset::pixels(10),
                Offset::pixels(20),
                Offset::pixels(100),
                Offset::pixels(50),
            ),
        );
        assert_eq!((g.offset_x, g.offset_y, g.width, g.height), (10, 20, 100, 50));
    }

    #[test]
    fn crop_offset_resets_offsets_past_the_edge() {
        let g = crop_offset(
            dims(400, 300),
            &region(
                Offset::pixels(500),
                Offset::pixels(300),
                Offset::pixels(100),
                Offset::pixels(100),
            ),
        );
        assert_eq!((g.offset_x, g.offset_y), (0, 0));
        assert_eq!(g.output(), dims(100, 100));
    }

    #[test]
    fn crop_offset_clips_region_to_remaining_extent() {
        let g = crop_offset(
            dims(400, 300),
            &region(
                Offset::pixels(350),
                Offset::percent(90),
                Offset::pixels(200),
                Offset::percent(50),
            ),
        );
        assert_eq!(g.offset_x, 350);
        assert_eq!(g.width, 50);
        assert_eq!(g.offset_y, 270);
        assert_eq!(g.height, 30);
    }

    #[test]
    fn crop_offset_negative_percentages_use_absolute_value() {
        let g = crop_offset(
            dims(200, 100),
            &region(
                Offset::percent(-10),
                Offset::percent(0),
                Offset::percent(-50),
                Offset::percent(100),
            ),
        );
        assert_eq!(g.offset_x, 20);
        assert_eq!(g.width, 100);
        assert_eq!(g.height, 100);
    }

    // =========================================================================
    // resize tests
    // =========================================================================

    #[test]
    fn resize_crops_sides_for_narrower_target() {
        let g = resize(dims(400, 300), 150, 150, 1024).unwrap();
        assert_eq!((g.crop_width, g.crop_height), (300, 300));
        assert_eq!((g.offset_x, g.offset_y), (50, 0));
        assert_eq!(g.output(), dims(150, 150));
    }

    #[test]
    fn resize_crops_top_and_bottom_for_wider_target() {
        let g = resize(dims(400, 300), 400, 100, 1024).unwrap();
        assert_eq!((g.crop_width, g.crop_height), (400, 100));
        assert_eq!((g.offset_x, g.offset_y), (0, 100));
    }

    #[test]
    fn resize_floors_odd_offsets() {
        // 401-300 = 101 → offset 50
        let g = resize(dims(401, 300), 100, 100, 1024).unwrap();
        assert_eq!(g.offset_x, 50);
    }

    #[test]
    fn resize_allows_upscale_within_ceiling() {
        let g = resize(dims(100, 100), 500, 500, 1024).unwrap();
        assert_eq!(g.output(), dims(500, 500));
    }

    #[test]
    fn resize_refuses_past_ceiling_or_non_positive() {
        assert_eq!(resize(dims(100, 100), 2000, 50, 1024), None);
        assert_eq!(resize(dims(100, 100), 50, 0, 1024), None);
        assert_eq!(resize(dims(100, 100), -5, 50, 1024), None);
        // Larger than the ceiling but not larger than the source is fine
        assert!(resize(dims(3000, 3000), 2000, 2000, 1024).is_some());
    }

    // =========================================================================
    // fit tests
    // =========================================================================

    #[test]
    fn fit_landscape_into_square_box() {
        let g = fit(dims(400, 300), 200, 200).unwrap();
        assert_eq!(g.output(), dims(200, 150));
        assert!(!g.needs_crop(dims(400, 300)));
    }

    #[test]
    fn fit_portrait_into_wide_box() {
        let g = fit(dims(300, 600), 400, 200).unwrap();
        assert_eq!(g.output(), dims(100, 200));
    }

    #[test]
    fn fit_refuses_box_larger_on_both_axes() {
        assert_eq!(fit(dims(100, 100), 200, 200), None);
        assert_eq!(fit(dims(100, 100), 0, 50), None);
    }

    #[test]
    fn fit_box_larger_on_one_axis() {
        let g = fit(dims(100, 100), 200, 50).unwrap();
        assert_eq!(g.output(), dims(50, 50));
    }

    #[test]
    fn fit_takes_absolute_values() {
        let g = fit(dims(400, 300), -200, -200).unwrap();
        assert_eq!(g.output(), dims(200, 150));
    }

    // =========================================================================
    // set_width / set_height tests
    // =========================================================================

    #[test]
    fn set_width_pixels() {
        let g = set_width(dims(400, 300), Length::pixels(200.0)).unwrap();
        assert_eq!(g.output(), dims(200, 150));
    }

    #[test]
    fn set_width_percent() {
        let g = set_width(dims(400, 300), Length::percent(25.0)).unwrap();
        assert_eq!(g.output(), dims(100, 75));
    }

    #[test]
    fn set_width_truncates_derived_axis() {
        // 333 / 3 = 111, 100 / 3 = 33.33 → 33
        let g = set_width(dims(333, 100), Length::pixels(111.0)).unwrap();
        assert_eq!(g.output(), dims(111, 33));
    }

    #[test]
    fn set_height_pixels() {
        let g = set_height(dims(400, 300), Length::pixels(150.0)).unwrap();
        assert_eq!(g.output(), dims(200, 150));
    }

    #[test]
    fn set_axis_zero_is_none() {
        assert_eq!(set_width(dims(400, 300), Length::pixels(0.0)), None);
        assert_eq!(set_height(dims(400, 300), Length::percent(0.0)), None);
    }

    #[test]
    fn set_width_upscale_geometry_is_computed() {
        // the gate, not the calculator, decides whether this may run
        let g = set_width(dims(10, 10), Length::pixels(50.0)).unwrap();
        assert_eq!(g.output(), dims(50, 50));
    }
}
