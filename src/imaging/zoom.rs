//! Zoom resolution for high-density displays.
//!
//! A zoom multiplier comes from the client's device-pixel-ratio hint or from
//! an explicit `zoom` parameter (the hint wins). It is clamped to `[1, 10]`,
//! and above 3 rounded *up* to the next 0.5 so that arbitrary DPR values
//! collapse onto a small set of cache variants.
//!
//! [`ZoomResolver::scale_pair`] is a fixed-point search, not a formula: the
//! zoom is stepped down (0.5 above 3, else 0.1) until the scaled box fits the
//! current image, so a zoomed `resize`/`fit` never asks for more pixels than
//! the source has.

use super::calculations::Dimensions;
use super::params::Length;

const MAX_ZOOM: f64 = 10.0;

/// Where the zoom factor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomSource {
    None,
    DprHint,
    Parameter,
}

/// Clamp a raw multiplier into the served range.
///
/// Values at or below 1 (and NaN) are exactly 1.
pub fn clamp_zoom(raw: f64) -> f64 {
    if raw.is_nan() || raw <= 1.0 {
        return 1.0;
    }
    let zoom = raw.min(MAX_ZOOM);
    if zoom > 3.0 {
        (zoom * 2.0).ceil() / 2.0
    } else {
        zoom
    }
}

/// Round a scaled argument to 14 significant digits.
///
/// Zoomed arguments are carried at this precision so that products such as
/// `100 * 2.8` settle on `280` before they are truncated to whole pixels.
pub fn settle(value: f64) -> f64 {
    if !value.is_finite() || value == 0.0 {
        return value;
    }
    format!("{value:.13e}").parse().unwrap_or(value)
}

/// Resolved zoom for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomResolver {
    factor: f64,
    source: ZoomSource,
}

impl ZoomResolver {
    /// Resolve from an optional DPR hint and an optional explicit zoom.
    pub fn resolve(dpr_hint: Option<f64>, explicit: Option<f64>) -> Self {
        let (raw, source) = match (dpr_hint, explicit) {
            (Some(dpr), _) => (dpr, ZoomSource::DprHint),
            (None, Some(zoom)) => (zoom, ZoomSource::Parameter),
            (None, None) => (1.0, ZoomSource::None),
        };
        Self {
            factor: clamp_zoom(raw),
            source,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn source(&self) -> ZoomSource {
        self.source
    }

    pub fn is_active(&self) -> bool {
        self.factor > 1.0
    }

    /// Value to echo back as `Content-DPR`, when the zoom came from a DPR hint.
    pub fn content_dpr(&self) -> Option<f64> {
        (self.source == ZoomSource::DprHint && self.is_active()).then_some(self.factor)
    }

    /// Zoom a `w`/`h` argument; a percent length stays a percent.
    pub fn scale_length(&self, length: Length) -> Length {
        if !self.is_active() {
            return length;
        }
        Length {
            value: settle(length.value * self.factor),
            unit: length.unit,
        }
    }

    /// Zoom a `resize`/`fit` box, stepping the zoom down until it fits `current`.
    pub fn scale_pair(&self, width: f64, height: f64, current: Dimensions) -> (f64, f64) {
        if !self.is_active() {
            return (width, height);
        }

        let max_w = current.width as f64;
        let max_h = current.height as f64;
        let mut zoom = self.factor;
        let mut new_w = width * zoom;
        let mut new_h = height * zoom;

        while (new_w > max_w || new_h > max_h) && zoom > 1.0 {
            if zoom > 3.0 {
                zoom -= 0.5;
            } else {
                zoom -= 0.1;
            }
            new_w = width * zoom;
            new_h = height * zoom;
        }

        (settle(new_w), settle(new_h))
    }
}

impl Default for ZoomResolver {
    fn default() -> Self {
        Self::resolve(None, None)
    }
}
