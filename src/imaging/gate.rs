//! Validity gate: the last check before a geometry touches the image.
//!
//! A rejected geometry is a no-op. The caller must not mutate any state
//! (dimensions, applied-operation list) when [`GateContext::check`] fails.

use super::calculations::{Dimensions, MIN_DIMENSION};
use std::fmt;

/// Why a proposed output size was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Same size as now and nothing else asks for a re-encode.
    Unchanged,
    /// A side below [`MIN_DIMENSION`].
    TooSmall,
    /// Larger on both axes without `upscale=1`.
    UpscaleNotAllowed,
    /// Larger on both axes and past the upscale pixel ceiling.
    UpscaleCeiling,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Unchanged => "unchanged dimensions",
            Self::TooSmall => "below minimum dimension",
            Self::UpscaleNotAllowed => "upscale not authorized",
            Self::UpscaleCeiling => "upscale ceiling exceeded",
        };
        f.write_str(reason)
    }
}

/// Everything the gate needs to know about the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateContext {
    pub current: Dimensions,
    pub upscale_allowed: bool,
    /// Per-axis ceiling for upscaled output (the GIF ceiling for animations).
    pub upscale_max: u32,
    /// A JPEG with a pending `quality` or `strip`: same-size output still re-encodes.
    pub reencode_pending: bool,
}

impl GateContext {
    /// Same context with upscale granted, as `resize` does for its own call.
    pub fn with_upscale(self) -> Self {
        Self {
            upscale_allowed: true,
            ..self
        }
    }

    pub fn check(&self, width: u32, height: u32) -> Result<(), Rejection> {
        let current = self.current;

        if width == current.width && height == current.height && !self.reencode_pending {
            return Err(Rejection::Unchanged);
        }
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            return Err(Rejection::TooSmall);
        }
        if width > current.width && height > current.height {
            if !self.upscale_allowed {
                return Err(Rejection::UpscaleNotAllowed);
            }
            if width > self.upscale_max || height > self.upscale_max {
                return Err(Rejection::UpscaleCeiling);
            }
        }
        Ok(())
    }
}
