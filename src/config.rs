//! Proxy configuration module.
//!
//! Handles loading, validating, and merging the proxy's `config.toml`. The
//! configuration is read once at process start and is immutable afterwards;
//! every request borrows the same [`ProxyConfig`].
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [limits]
//! upscale_max_pixels = 1024      # Largest upscaled edge for still images
//! upscale_max_pixels_gif = 1024  # Largest upscaled edge for animated GIFs
//! image_max_width = 20000        # Sources wider than this are refused
//! image_max_height = 20000       # Sources taller than this are refused
//! allow_dims_chaining = false    # Apply both w and h instead of the first one
//! memory_limit = 134217728       # Filter memory gate ceiling, in bytes
//!
//! [quality]
//! jpeg_max = 100
//! png_max = 100
//! png_zlib_level = 2
//! png_filter = 1
//! webp_max = 100
//! webp_lossless = false
//! # webp_default_strip = "info"
//! normalize_color_profile = true
//!
//! [optimizers]
//! disabled = false
//! # pngquant = "/usr/bin/pngquant"
//! pass_timeout_ms = 10000
//!
//! [response]
//! # max_age = 63115200
//! nosniff = true
//! etag = false
//! bytes_saved = false
//! client_hints = false
//!
//! [processing]
//! max_processes = 4              # Batch workers (omit for auto = CPU cores)
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::StripMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Proxy configuration loaded from `config.toml`.
///
/// All fields have defaults; a config file only names what it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub limits: LimitsConfig,
    pub quality: QualityConfig,
    pub optimizers: OptimizersConfig,
    pub response: ResponseConfig,
    pub processing: ProcessingConfig,
}

impl ProxyConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("quality.jpeg_max", self.quality.jpeg_max),
            ("quality.png_max", self.quality.png_max),
            ("quality.webp_max", self.quality.webp_max),
        ] {
            if !(1..=100).contains(&value) {
                return Err(ConfigError::Validation(format!("{name} must be 1-100")));
            }
        }
        if self.quality.png_zlib_level > 9 {
            return Err(ConfigError::Validation(
                "quality.png_zlib_level must be 0-9".into(),
            ));
        }
        if self.quality.png_filter > 5 {
            return Err(ConfigError::Validation(
                "quality.png_filter must be 0-5".into(),
            ));
        }
        let limits = &self.limits;
        if limits.upscale_max_pixels == 0
            || limits.upscale_max_pixels_gif == 0
            || limits.image_max_width == 0
            || limits.image_max_height == 0
            || limits.memory_limit == 0
        {
            return Err(ConfigError::Validation(
                "limits values must be non-zero".into(),
            ));
        }
        if self.optimizers.pass_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "optimizers.pass_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Policy limits applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Ceiling, per axis, for an authorized upscale of a still image.
    pub upscale_max_pixels: u32,
    /// Same ceiling for animated GIFs.
    pub upscale_max_pixels_gif: u32,
    pub image_max_width: u32,
    pub image_max_height: u32,
    /// When false, applying `w` drops a pending `h` and vice versa.
    pub allow_dims_chaining: bool,
    /// Filters whose projected working set reaches this many bytes are skipped.
    pub memory_limit: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            upscale_max_pixels: 1024,
            upscale_max_pixels_gif: 1024,
            image_max_width: 20000,
            image_max_height: 20000,
            allow_dims_chaining: false,
            memory_limit: 128 * 1024 * 1024,
        }
    }
}

/// Encoder quality ceilings and PNG compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    pub jpeg_max: u32,
    pub png_max: u32,
    /// zlib level 0-9; with `png_filter` forms the PNG compression setting.
    pub png_zlib_level: u32,
    /// PNG row filter 0-5 (5 = adaptive).
    pub png_filter: u32,
    pub webp_max: u32,
    pub webp_lossless: bool,
    /// Metadata stripped from WebP output when the request names none.
    pub webp_default_strip: Option<StripMode>,
    pub normalize_color_profile: bool,
}

impl QualityConfig {
    /// Compression setting handed to the PNG encoder: `zlib * 10 + filter`.
    pub fn png_compression(&self) -> u32 {
        self.png_zlib_level * 10 + self.png_filter
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            jpeg_max: 100,
            png_max: 100,
            png_zlib_level: 2,
            png_filter: 1,
            webp_max: 100,
            webp_lossless: false,
            webp_default_strip: None,
            normalize_color_profile: true,
        }
    }
}

/// Paths to external optimizer binaries. An absent path disables the pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizersConfig {
    /// Turn off every external pass, whatever paths are configured.
    pub disabled: bool,
    pub pngquant: Option<PathBuf>,
    pub optipng: Option<PathBuf>,
    pub pngcrush: Option<PathBuf>,
    pub jpegoptim: Option<PathBuf>,
    pub jpegtran: Option<PathBuf>,
    pub cwebp: Option<PathBuf>,
    /// Deadline for a single external pass.
    pub pass_timeout_ms: u64,
    /// Directory for working files. Defaults to the system temp directory.
    pub temp_dir: Option<PathBuf>,
}

impl OptimizersConfig {
    fn tool(&self, path: &Option<PathBuf>) -> Option<PathBuf> {
        if self.disabled {
            None
        } else {
            path.clone()
        }
    }

    pub fn pngquant(&self) -> Option<PathBuf> {
        self.tool(&self.pngquant)
    }

    pub fn optipng(&self) -> Option<PathBuf> {
        self.tool(&self.optipng)
    }

    pub fn pngcrush(&self) -> Option<PathBuf> {
        self.tool(&self.pngcrush)
    }

    pub fn jpegoptim(&self) -> Option<PathBuf> {
        self.tool(&self.jpegoptim)
    }

    pub fn jpegtran(&self) -> Option<PathBuf> {
        self.tool(&self.jpegtran)
    }

    pub fn cwebp(&self) -> Option<PathBuf> {
        self.tool(&self.cwebp)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_millis(self.pass_timeout_ms)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for OptimizersConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            pngquant: None,
            optipng: None,
            pngcrush: None,
            jpegoptim: None,
            jpegtran: None,
            cwebp: None,
            pass_timeout_ms: 10_000,
            temp_dir: None,
        }
    }
}

/// Optional response headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponseConfig {
    /// Seconds for `Expires` / `Cache-Control`; absent sends neither.
    pub max_age: Option<u64>,
    pub nosniff: bool,
    pub etag: bool,
    pub bytes_saved: bool,
    /// Honour the client's `DPR` header as a zoom hint.
    pub client_hints: bool,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            max_age: None,
            nosniff: true,
            etag: false,
            bytes_saved: false,
            client_hints: false,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel batch workers.
    /// When absent or null, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// Base layer for merging a user file on top.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(ProxyConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist, `Err` if it holds invalid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<ProxyConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ProxyConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the proxy config.
///
/// With no path, or a path that does not exist, the stock defaults apply.
/// User values are merged on top of the defaults, unknown keys are rejected,
/// and the result is validated.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    let base = stock_defaults_value();
    let overlay = match path {
        Some(path) => load_raw_config(path)?,
        None => None,
    };
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Image Proxy Configuration
# =========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Policy limits
# ---------------------------------------------------------------------------
[limits]
# Largest edge, in pixels, an authorized upscale may produce (upscale=1).
upscale_max_pixels = 1024
# Same ceiling for animated GIFs.
upscale_max_pixels_gif = 1024
# Sources larger than this on either axis are refused before decoding.
image_max_width = 20000
image_max_height = 20000
# With chaining off, "w=100&h=150" applies only the first of the two.
# With chaining on, the width applies and then the height.
allow_dims_chaining = false
# Filters (brightness, contrast, ...) and unletterbox are skipped when their
# projected working set would reach this many bytes.
memory_limit = 134217728

# ---------------------------------------------------------------------------
# Encoding quality
# ---------------------------------------------------------------------------
[quality]
# Ceiling for JPEG quality. Without an explicit quality parameter the
# source JPEG's own quality is kept when it is lower.
jpeg_max = 100
# Ceiling for PNG quality (used as the pngquant floor).
png_max = 100
# PNG zlib compression level (0-9) and row filter (0-5, 5 = adaptive).
png_zlib_level = 2
png_filter = 1
# Ceiling for WebP quality.
webp_max = 100
# Produce lossless WebP.
webp_lossless = false
# Metadata stripped from WebP output when the request has no strip parameter:
# "all", "info", "color" or "none". Unset keeps everything.
# webp_default_strip = "info"
# Drop embedded colour profiles before encoding; invalid profiles are
# always dropped when this is on.
normalize_color_profile = true

# ---------------------------------------------------------------------------
# External optimizers
# ---------------------------------------------------------------------------
[optimizers]
# Turn off every external pass (sends X-Optim-Disabled).
disabled = false
# Paths to optimizer binaries. A pass runs only when its path is set.
# pngquant = "/usr/bin/pngquant"
# optipng = "/usr/bin/optipng"
# pngcrush = "/usr/bin/pngcrush"
# jpegoptim = "/usr/bin/jpegoptim"
# jpegtran = "/usr/bin/jpegtran"
# cwebp = "/usr/bin/cwebp"
# Kill a pass that runs longer than this, in milliseconds.
pass_timeout_ms = 10000
# Directory for working files (default: system temp directory).
# temp_dir = "/dev/shm"

# ---------------------------------------------------------------------------
# Response headers
# ---------------------------------------------------------------------------
[response]
# Seconds for Expires and Cache-Control. Unset sends neither.
# max_age = 63115200
# Send X-Content-Type-Options: nosniff.
nosniff = true
# Send an ETag.
etag = false
# Report optimizer savings in X-Bytes-Saved.
bytes_saved = false
# Honour the DPR client hint as a zoom factor and echo Content-DPR.
client_hints = false

# ---------------------------------------------------------------------------
# Parallel processing
# ---------------------------------------------------------------------------
[processing]
# Maximum number of parallel batch workers.
# Omit to auto-detect (uses all CPU cores).
# Values larger than the core count are clamped down.
# max_processes = 4
"##
}
