//! Transformation directives and their dispatch order.
//!
//! [`parse`] turns the request's ordered query pairs into typed
//! [`Directive`]s. Values that cannot describe an operation (`crop=a,b`,
//! `w=0`, `filter=sparkle`) are dropped here, so the engine only ever sees
//! well-formed arguments.
//!
//! [`Dispatcher`] hands directives out one at a time:
//!
//! ```text
//! PendingCropFlag ──▶ Sequential ──▶ Terminal
//!   crop=1 first,       query order,    encode once
//!   absorbing w/h       w and h drop
//!                       each other
//! ```
//!
//! `crop=1` is the only directive that jumps the queue. Everything else runs
//! in the order it first appeared in the query.

use crate::imaging::{
    Effect, FilterKind, Length, Offset, OffsetRegion, Rgb, letterbox::parse_border_color,
};
use crate::request::{ClientRequest, parse_float, parse_int};
use std::collections::VecDeque;
use tracing::debug;

/// Recognized directive names. Aliases map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKey {
    Width,
    Height,
    Crop,
    CropOffset,
    Resize,
    Fit,
    Letterbox,
    Unletterbox,
    Filter,
    Brightness,
    Contrast,
    Colorize,
    Smooth,
}

impl DirectiveKey {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "w" | "width" => Self::Width,
            "h" | "height" => Self::Height,
            "crop" => Self::Crop,
            "crop_offset" => Self::CropOffset,
            "resize" => Self::Resize,
            "fit" => Self::Fit,
            "lb" | "letterbox" => Self::Letterbox,
            "ulb" | "unletterbox" => Self::Unletterbox,
            "filter" => Self::Filter,
            "brightness" => Self::Brightness,
            "contrast" => Self::Contrast,
            "colorize" => Self::Colorize,
            "smooth" => Self::Smooth,
            _ => return None,
        })
    }
}

/// Query parameters that steer the request without being directives.
const SIGNAL_KEYS: &[&str] = &["upscale", "quality", "strip", "zoom", "webp"];

/// One typed transformation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Directive {
    /// `crop=1`, with the `w`/`h` it absorbed.
    CropFlag {
        width: Option<u32>,
        height: Option<u32>,
    },
    /// `crop=x,y,w,h` or `crop_offset=x,y,w,h`.
    CropOffset(OffsetRegion),
    /// `resize=w,h`: exact size, centred crop. Arguments are zoomed before use.
    Resize { width: f64, height: f64 },
    /// `fit=w,h`: inside a box, no crop. Arguments are zoomed before use.
    Fit { width: f64, height: f64 },
    Width(Length),
    Height(Length),
    Letterbox { width: u32, height: u32, color: Rgb },
    Unletterbox,
    Effect(Effect),
}

impl Directive {
    /// Whether this directive belongs to the memory-gated filter family.
    pub fn is_effect(&self) -> bool {
        matches!(self, Self::Effect(_))
    }
}

/// Parse the directives of `request`, in first-appearance order.
pub fn parse(request: &ClientRequest) -> Vec<Directive> {
    let mut keyed: Vec<(DirectiveKey, &str)> = Vec::new();
    for (name, value) in request.params() {
        let Some(key) = DirectiveKey::from_name(name) else {
            if !SIGNAL_KEYS.contains(&name.as_str()) {
                debug!(key = %name, "dropping unknown directive");
            }
            continue;
        };
        // aliases collapse like duplicate keys: first position, last value
        match keyed.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value.as_str(),
            None => keyed.push((key, value.as_str())),
        }
    }

    let raw = |key: DirectiveKey| {
        keyed
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| *value)
    };

    keyed
        .iter()
        .filter_map(|&(key, value)| {
            let directive = parse_one(
                key,
                value,
                raw(DirectiveKey::Width),
                raw(DirectiveKey::Height),
            );
            if directive.is_none() {
                debug!(?key, value, "dropping malformed directive");
            }
            directive
        })
        .collect()
}

fn parse_one(
    key: DirectiveKey,
    value: &str,
    raw_width: Option<&str>,
    raw_height: Option<&str>,
) -> Option<Directive> {
    match key {
        DirectiveKey::Crop if value.contains(',') => {
            parse_region(value).map(Directive::CropOffset)
        }
        DirectiveKey::Crop if value == "1" => {
            let width = raw_width.and_then(positive_int);
            let height = raw_height.and_then(positive_int);
            (width.is_some() || height.is_some()).then_some(Directive::CropFlag { width, height })
        }
        DirectiveKey::Crop => None,
        DirectiveKey::CropOffset => parse_region(value).map(Directive::CropOffset),
        DirectiveKey::Resize => {
            let (width, height) = parse_pair(value)?;
            Some(Directive::Resize { width, height })
        }
        DirectiveKey::Fit => {
            let (width, height) = parse_pair(value)?;
            Some(Directive::Fit { width, height })
        }
        DirectiveKey::Width => parse_length(value).map(Directive::Width),
        DirectiveKey::Height => parse_length(value).map(Directive::Height),
        DirectiveKey::Letterbox => parse_letterbox(value),
        DirectiveKey::Unletterbox => (value == "true").then_some(Directive::Unletterbox),
        DirectiveKey::Filter => {
            FilterKind::parse(value).map(|kind| Directive::Effect(Effect::Filter(kind)))
        }
        DirectiveKey::Brightness => Some(Directive::Effect(Effect::Brightness(
            clamp_int(parse_int(value), 255),
        ))),
        DirectiveKey::Contrast => Some(Directive::Effect(Effect::Contrast(clamp_int(
            parse_int(value),
            100,
        )))),
        DirectiveKey::Colorize => {
            let parts: Vec<&str> = value.split(',').collect();
            let [red, green, blue] = parts.as_slice() else {
                return None;
            };
            let channel = |s: &str| clamp_int(parse_int(s), 255);
            Some(Directive::Effect(Effect::Colorize {
                red: channel(*red),
                green: channel(*green),
                blue: channel(*blue),
            }))
        }
        DirectiveKey::Smooth => Some(Directive::Effect(Effect::Smooth(parse_float(value) as f32))),
    }
}

fn clamp_int(value: i64, limit: i64) -> i32 {
    value.clamp(-limit, limit) as i32
}

/// `w`/`h` for `crop=1`: a positive integer, anything else is absent.
fn positive_int(value: &str) -> Option<u32> {
    let n = parse_int(value);
    (n > 0).then(|| n.min(u32::MAX as i64) as u32)
}

/// `w`/`h`: `200` pixels or `50%` of the current size. Zero is no directive.
fn parse_length(value: &str) -> Option<Length> {
    let n = parse_int(value);
    if n <= 0 {
        return None;
    }
    if value.trim_end().ends_with('%') {
        Some(Length::percent(n as f64))
    } else {
        Some(Length::pixels(n as f64))
    }
}

/// Exactly two comma-separated numbers.
fn parse_pair(value: &str) -> Option<(f64, f64)> {
    let mut parts = value.split(',');
    let (Some(w), Some(h), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    Some((parse_float(w), parse_float(h)))
}

/// `x,y,w,h`, each `12px` (pixels) or `12` (percent).
fn parse_region(value: &str) -> Option<OffsetRegion> {
    let parts: Vec<&str> = value.split(',').collect();
    let [x, y, width, height] = parts.as_slice() else {
        return None;
    };
    let coordinate = |s: &str| {
        if s.trim_end().ends_with("px") {
            Offset::pixels(parse_int(s))
        } else {
            Offset::percent(parse_int(s))
        }
    };
    Some(OffsetRegion {
        x: coordinate(*x),
        y: coordinate(*y),
        width: coordinate(*width),
        height: coordinate(*height),
    })
}

/// `w,h` or `w,h,color`. Negative sizes count as positive.
fn parse_letterbox(value: &str) -> Option<Directive> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() < 2 {
        return None;
    }
    let size = |s: &str| parse_int(s).unsigned_abs().min(u32::MAX as u64) as u32;
    let color = if parts.len() == 3 {
        parse_border_color(Some(parts[2]))
    } else {
        Rgb::BLACK
    };
    Some(Directive::Letterbox {
        width: size(parts[0]),
        height: size(parts[1]),
        color,
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    PendingCropFlag,
    Sequential,
    Terminal,
}

/// Hands out directives in dispatch order and applies the width/height
/// exclusivity rule as results come back.
#[derive(Debug)]
pub struct Dispatcher {
    state: DispatchState,
    pending: VecDeque<Directive>,
    allow_chaining: bool,
}

impl Dispatcher {
    pub fn new(directives: Vec<Directive>, allow_chaining: bool) -> Self {
        Self {
            state: DispatchState::PendingCropFlag,
            pending: directives.into(),
            allow_chaining,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// The next directive to attempt, or `None` once the queue is exhausted.
    pub fn next_directive(&mut self) -> Option<Directive> {
        if self.state == DispatchState::PendingCropFlag {
            self.state = DispatchState::Sequential;
            if let Some(pos) = self
                .pending
                .iter()
                .position(|d| matches!(d, Directive::CropFlag { .. }))
            {
                let flag = self.pending.remove(pos);
                self.pending
                    .retain(|d| !matches!(d, Directive::Width(_) | Directive::Height(_)));
                return flag;
            }
        }
        if self.state == DispatchState::Terminal {
            return None;
        }
        let next = self.pending.pop_front();
        if next.is_none() {
            self.state = DispatchState::Terminal;
        }
        next
    }

    /// Report the outcome of `directive`. An applied `w` drops a pending `h`
    /// (and vice versa) unless chaining is allowed.
    pub fn complete(&mut self, directive: &Directive, applied: bool) {
        if !applied || self.allow_chaining {
            return;
        }
        match directive {
            Directive::Width(_) => self.pending.retain(|d| !matches!(d, Directive::Height(_))),
            Directive::Height(_) => self.pending.retain(|d| !matches!(d, Directive::Width(_))),
            _ => {}
        }
    }
}
