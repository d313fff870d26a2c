//! The transformation engine: one request from source bytes to final bytes.
//!
//! ```text
//! admit ─▶ load ─▶ dispatch loop ─────────────▶ encode ─▶ WebP ─▶ optimizers
//!                  zoom → geometry → gate → apply          or
//! ```
//!
//! [`Engine::transform`] owns a single [`ImageSubject`] for the duration of
//! the request and threads it through every step. A directive either
//! applies completely (pixels, dimensions and the applied list all move
//! together) or leaves the subject untouched.
//!
//! GIF sources are handed to the animated collaborator instead: geometry and
//! filters are queued on it, and it reports what it actually applied.

use crate::config::ProxyConfig;
use crate::directives::{self, Directive, Dispatcher};
use crate::encode::{self, EncodeOptions};
use crate::imaging::{
    AnimatedImage, AnimatedOp, BackendError, Dimensions, Effect, GateContext, Geometry,
    ImageBackend, MimeType, Offset, OffsetRegion, PixelLayout, RasterImage, Rgb, SourceFormat,
    ZoomResolver, crop, crop_offset, detect_content_band, fit, letterbox, resize, set_height,
    set_width,
};
use crate::jpeg_header::JpegHeader;
use crate::optimize::{self, Optimizer, PassOutcome, ToolRunner};
use crate::request::ClientRequest;
use crate::source;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bytes per pixel of the decoded working set.
const BYTES_PER_PIXEL: f64 = 4.0;
/// Working-set multiplier of a pixel operation.
const WORKING_SET_MULTIPLIER: f64 = 1.7;
/// Extra cost of the colour-space round trip filters go through.
const FILTER_CONVERSION_MULTIPLIER: f64 = 2.5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid source image: {0}")]
    InvalidSource(String),
    #[error("Sorry, the parameters you provided were not valid")]
    InvalidParameters,
    #[error("Image processing failed: {0}")]
    Backend(#[from] BackendError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Working state of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSubject {
    /// Size after the last applied operation.
    pub dimensions: Dimensions,
    pub format: SourceFormat,
    /// Layout the source was loaded with.
    pub layout: PixelLayout,
    pub has_transparency: bool,
    pub mime_type: MimeType,
    /// Quality the output was encoded at.
    pub quality: Option<u32>,
    /// Zoom to echo as `Content-DPR`.
    pub content_dpr: Option<f64>,
    /// Labels of applied operations, in order.
    pub applied: Vec<&'static str>,
    pub bytes_saved: u64,
    /// Size of a malformed ICC profile dropped before encode.
    pub icc_profile_removed: Option<usize>,
}

impl ImageSubject {
    pub fn new(dimensions: Dimensions, format: SourceFormat, layout: PixelLayout) -> Self {
        Self {
            dimensions,
            format,
            layout,
            has_transparency: layout.has_alpha(),
            mime_type: format.mime_type(),
            quality: None,
            content_dpr: None,
            applied: Vec::new(),
            bytes_saved: 0,
            icc_profile_removed: None,
        }
    }

    fn record(&mut self, label: &'static str, dimensions: Dimensions) {
        self.dimensions = dimensions;
        self.applied.push(label);
    }
}

/// Result of [`Engine::transform`].
#[derive(Debug)]
pub struct Transformed {
    pub bytes: Vec<u8>,
    pub subject: ImageSubject,
    /// Optimizer passes that ran, WebP conversion included.
    pub passes: Vec<PassOutcome>,
    /// The source bytes were served unmodified.
    pub passthrough: bool,
}

impl Transformed {
    pub fn mime_type(&self) -> MimeType {
        self.subject.mime_type
    }
}

/// The image being edited: a still raster or a queued animation.
enum Canvas<'c> {
    Still(&'c mut dyn RasterImage),
    Animated(&'c mut dyn AnimatedImage),
}

/// Per-request policy that does not change while directives run.
#[derive(Debug, Clone, Copy)]
struct Policy {
    upscale_allowed: bool,
    upscale_max: u32,
    reencode_pending: bool,
    zoom: ZoomResolver,
}

impl Policy {
    fn gate(&self, current: Dimensions) -> GateContext {
        GateContext {
            current,
            upscale_allowed: self.upscale_allowed,
            upscale_max: self.upscale_max,
            reencode_pending: self.reencode_pending,
        }
    }
}

/// Outcome of one directive.
enum Step {
    Applied,
    Rejected(&'static str),
}

pub struct Engine<'a> {
    config: &'a ProxyConfig,
    backend: &'a dyn ImageBackend,
    runner: &'a dyn ToolRunner,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a ProxyConfig,
        backend: &'a dyn ImageBackend,
        runner: &'a dyn ToolRunner,
    ) -> Self {
        Self {
            config,
            backend,
            runner,
        }
    }

    /// Apply the directives of `request` to `source`.
    pub fn transform(
        &self,
        source: &[u8],
        request: &ClientRequest,
    ) -> Result<Transformed, EngineError> {
        let info = source::admit(source, &self.config.limits)
            .map_err(|e| EngineError::InvalidSource(e.to_string()))?;
        let zoom = ZoomResolver::resolve(
            request.dpr_hint(self.config.response.client_hints),
            request.zoom(),
        );
        let dispatcher = Dispatcher::new(
            directives::parse(request),
            self.config.limits.allow_dims_chaining,
        );

        if info.is_gif() {
            self.transform_animation(source, request, dispatcher, zoom)
        } else {
            self.transform_still(source, request, dispatcher, zoom)
        }
    }

    fn transform_animation(
        &self,
        source: &[u8],
        request: &ClientRequest,
        dispatcher: Dispatcher,
        zoom: ZoomResolver,
    ) -> Result<Transformed, EngineError> {
        let mut animation = self
            .backend
            .load_animation(source)
            .map_err(|e| EngineError::InvalidSource(e.to_string()))?;
        let mut subject = ImageSubject::new(
            animation.dimensions(),
            SourceFormat::Gif,
            PixelLayout::Palette,
        );
        let policy = Policy {
            upscale_allowed: request.upscale(),
            upscale_max: self.config.limits.upscale_max_pixels_gif,
            reencode_pending: false,
            zoom,
        };

        self.run(
            &mut Canvas::Animated(animation.as_mut()),
            &mut subject,
            dispatcher,
            &policy,
        )?;

        subject.applied = animation.applied();
        if subject.applied.is_empty() {
            return Ok(passthrough(source, subject));
        }
        let bytes = animation.render().map_err(|e| {
            warn!(error = %e, "animation refused its queued operations");
            EngineError::InvalidParameters
        })?;
        info!(applied = ?subject.applied, size = bytes.len(), "rendered animation");
        Ok(Transformed {
            bytes,
            subject,
            passes: Vec::new(),
            passthrough: false,
        })
    }

    fn transform_still(
        &self,
        source: &[u8],
        request: &ClientRequest,
        dispatcher: Dispatcher,
        zoom: ZoomResolver,
    ) -> Result<Transformed, EngineError> {
        let mut image = self
            .backend
            .load(source)
            .map_err(|e| EngineError::InvalidSource(e.to_string()))?;
        let mut subject = ImageSubject::new(image.dimensions(), image.format(), image.layout());
        let policy = Policy {
            upscale_allowed: request.upscale(),
            upscale_max: self.config.limits.upscale_max_pixels,
            reencode_pending: subject.format == SourceFormat::Jpeg
                && (request.quality().is_some() || request.strip_requested()),
            zoom,
        };

        self.run(
            &mut Canvas::Still(image.as_mut()),
            &mut subject,
            dispatcher,
            &policy,
        )?;

        let optimizer = Optimizer::new(&self.config.optimizers, self.runner);
        let webp = optimizer.webp_available()
            && request.accepts_webp()
            && subject.format != SourceFormat::Gif;
        if subject.applied.is_empty()
            && request.quality().is_none()
            && !request.strip_requested()
            && !webp
        {
            debug!("nothing applied, serving source unmodified");
            return Ok(passthrough(source, subject));
        }

        self.finish_still(source, request, image.as_mut(), subject, &optimizer, webp)
    }

    /// Encode, negotiate WebP or optimize, and read back the final bytes.
    fn finish_still(
        &self,
        source: &[u8],
        request: &ClientRequest,
        image: &mut dyn RasterImage,
        mut subject: ImageSubject,
        optimizer: &Optimizer<'_>,
        webp: bool,
    ) -> Result<Transformed, EngineError> {
        let working = tempfile::Builder::new()
            .prefix("pre-")
            .tempfile_in(optimizer.temp_dir())?;
        let path = working.path();

        let format = encode::output_format(subject.format, subject.layout);
        let options = EncodeOptions {
            quality: &self.config.quality,
            pngquant_available: self.config.optimizers.pngquant().is_some(),
            requested_quality: request.quality(),
            jpeg_header: (subject.format == SourceFormat::Jpeg)
                .then(|| JpegHeader::parse(source))
                .flatten(),
            original_layout: subject.layout,
        };
        let encoded = encode::encode_still(image, format, &options, path)?;
        subject.mime_type = encoded.mime_type;
        subject.quality = Some(encoded.quality);
        subject.icc_profile_removed = encoded.icc_profile_removed;

        let mut passes = Vec::new();
        let webp_strip = request.strip().or(if request.strip_requested() {
            None
        } else {
            self.config.quality.webp_default_strip
        });
        let converted = if webp {
            encode::negotiate_webp(optimizer, &self.config.quality, path, &encoded, webp_strip)
        } else {
            None
        };
        match converted {
            Some(outcome) => {
                subject.mime_type = MimeType::WebP;
                passes.push(outcome);
            }
            None if encoded.mime_type == MimeType::Png => {
                passes.extend(optimizer.optimize_png(path, encoded.quality));
            }
            None => {
                passes.extend(optimizer.optimize_jpeg(path, request.strip(), encoded.quality));
            }
        }

        let bytes = std::fs::read(path)?;
        subject.bytes_saved = optimize::bytes_saved(encoded.size, bytes.len() as u64);
        info!(
            applied = ?subject.applied,
            mime = %subject.mime_type,
            size = bytes.len(),
            bytes_saved = subject.bytes_saved,
            "transformed"
        );
        Ok(Transformed {
            bytes,
            subject,
            passes,
            passthrough: false,
        })
    }

    /// The dispatch loop. Rejections are logged and skipped; backend
    /// failures abort the request.
    fn run(
        &self,
        canvas: &mut Canvas<'_>,
        subject: &mut ImageSubject,
        mut dispatcher: Dispatcher,
        policy: &Policy,
    ) -> Result<(), EngineError> {
        while let Some(directive) = dispatcher.next_directive() {
            let applied = match self.dispatch(canvas, subject, &directive, policy)? {
                Step::Applied => true,
                Step::Rejected(reason) => {
                    debug!(?directive, reason, "directive skipped");
                    false
                }
            };
            dispatcher.complete(&directive, applied);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        canvas: &mut Canvas<'_>,
        subject: &mut ImageSubject,
        directive: &Directive,
        policy: &Policy,
    ) -> Result<Step, EngineError> {
        let current = subject.dimensions;
        let gate = policy.gate(current);
        let zoom = &policy.zoom;

        let (label, geometry, gate) = match *directive {
            Directive::CropFlag { width, height } => {
                let Some(geometry) = crop(current, width, height) else {
                    return Ok(Step::Rejected("crop needs a width or height"));
                };
                ("crop", geometry, gate)
            }
            Directive::CropOffset(region) => ("crop_offset", crop_offset(current, &region), gate),
            Directive::Resize { width, height } => {
                let (width, height) = zoom.scale_pair(width, height, current);
                let Some(geometry) =
                    resize(current, width as i64, height as i64, policy.upscale_max)
                else {
                    return Ok(Step::Rejected("resize outside bounds"));
                };
                ("resize_and_crop", geometry, gate.with_upscale())
            }
            Directive::Fit { width, height } => {
                let (width, height) = zoom.scale_pair(width, height, current);
                let Some(geometry) = fit(current, width as i64, height as i64) else {
                    return Ok(Step::Rejected("box does not fit"));
                };
                ("fit_in_box", geometry, gate)
            }
            Directive::Width(length) => {
                let Some(geometry) = set_width(current, zoom.scale_length(length)) else {
                    return Ok(Step::Rejected("zero width"));
                };
                ("set_width", geometry, gate)
            }
            Directive::Height(length) => {
                let Some(geometry) = set_height(current, zoom.scale_length(length)) else {
                    return Ok(Step::Rejected("zero height"));
                };
                ("set_height", geometry, gate)
            }
            Directive::Letterbox {
                width,
                height,
                color,
            } => return self.letterbox(canvas, subject, width, height, color, policy),
            Directive::Unletterbox => return self.unletterbox(canvas, subject, &gate),
            Directive::Effect(effect) => return self.effect(canvas, subject, &effect),
        };

        if let Err(rejection) = gate.check(geometry.width, geometry.height) {
            debug!(label, %rejection, width = geometry.width, height = geometry.height, "gate refused");
            return Ok(Step::Rejected("gate"));
        }
        apply_geometry(canvas, subject, label, &geometry)?;
        // Content-DPR describes the served pixels: a zoomed directive the gate
        // refused leaves the image at its original density, so nothing is echoed.
        if matches!(
            directive,
            Directive::Resize { .. } | Directive::Fit { .. } | Directive::Width(_) | Directive::Height(_)
        ) && let Some(dpr) = zoom.content_dpr()
        {
            subject.content_dpr = Some(dpr);
        }
        Ok(Step::Applied)
    }

    fn letterbox(
        &self,
        canvas: &mut Canvas<'_>,
        subject: &mut ImageSubject,
        width: u32,
        height: u32,
        color: Rgb,
        policy: &Policy,
    ) -> Result<Step, EngineError> {
        let Canvas::Still(image) = canvas else {
            return Ok(Step::Rejected("letterbox is not available for animations"));
        };
        let Some(plan) = letterbox(subject.dimensions, width, height, policy.upscale_max) else {
            return Ok(Step::Rejected("letterbox outside bounds"));
        };

        if plan.scaled != subject.dimensions {
            image.scale(plan.scaled.width, plan.scaled.height)?;
        }
        image.border(color, plan.border_width, plan.border_height)?;
        if plan.needs_trim() {
            image.crop(
                plan.target.width,
                plan.target.height,
                plan.trim_x,
                plan.trim_y,
            )?;
        }
        subject.record("letterbox", plan.target);
        Ok(Step::Applied)
    }

    fn unletterbox(
        &self,
        canvas: &mut Canvas<'_>,
        subject: &mut ImageSubject,
        gate: &GateContext,
    ) -> Result<Step, EngineError> {
        let Canvas::Still(image) = canvas else {
            return Ok(Step::Rejected("unletterbox is not available for animations"));
        };
        if !self.within_memory(subject.dimensions, 1.0) {
            return Ok(Step::Rejected("memory limit"));
        }
        let current = subject.dimensions;
        let Some(band) = detect_content_band(current.height, |y| image.pixel_row(y)) else {
            return Ok(Step::Rejected("no uniform border"));
        };

        let region = OffsetRegion {
            x: Offset::pixels(0),
            y: Offset::pixels(band.top as i64),
            width: Offset::pixels(current.width as i64),
            height: Offset::pixels(band.height() as i64),
        };
        let geometry = crop_offset(current, &region);
        if let Err(rejection) = gate.check(geometry.width, geometry.height) {
            debug!(%rejection, "gate refused unletterbox");
            return Ok(Step::Rejected("gate"));
        }
        apply_geometry(canvas, subject, "unletterbox", &geometry)?;
        Ok(Step::Applied)
    }

    fn effect(
        &self,
        canvas: &mut Canvas<'_>,
        subject: &mut ImageSubject,
        effect: &Effect,
    ) -> Result<Step, EngineError> {
        let label = effect.label();
        match canvas {
            Canvas::Animated(animation) => {
                animation.add_operation(label, AnimatedOp::Effect(*effect));
            }
            Canvas::Still(image) => {
                if !self.within_memory(subject.dimensions, FILTER_CONVERSION_MULTIPLIER) {
                    return Ok(Step::Rejected("memory limit"));
                }
                image.apply_effect(effect)?;
            }
        }
        subject.applied.push(label);
        Ok(Step::Applied)
    }

    /// Whether an operation with the given conversion cost fits under the
    /// configured memory ceiling.
    fn within_memory(&self, dimensions: Dimensions, conversion: f64) -> bool {
        let working = dimensions.width as f64 * dimensions.height as f64 * BYTES_PER_PIXEL;
        let projected = working + working * WORKING_SET_MULTIPLIER * conversion;
        let fits = projected < self.config.limits.memory_limit as f64;
        if !fits {
            debug!(projected, limit = self.config.limits.memory_limit, "memory gate");
        }
        fits
    }
}

fn apply_geometry(
    canvas: &mut Canvas<'_>,
    subject: &mut ImageSubject,
    label: &'static str,
    geometry: &Geometry,
) -> Result<(), EngineError> {
    match canvas {
        Canvas::Still(image) => {
            if geometry.needs_crop(subject.dimensions) {
                image.crop(
                    geometry.crop_width,
                    geometry.crop_height,
                    geometry.offset_x,
                    geometry.offset_y,
                )?;
            }
            if geometry.needs_scale() {
                image.scale(geometry.width, geometry.height)?;
            }
        }
        Canvas::Animated(animation) => {
            animation.add_operation(label, AnimatedOp::Geometry(*geometry));
        }
    }
    subject.record(label, geometry.output());
    Ok(())
}

fn passthrough(source: &[u8], mut subject: ImageSubject) -> Transformed {
    subject.mime_type = subject.format.mime_type();
    Transformed {
        bytes: source.to_vec(),
        subject,
        passes: Vec::new(),
        passthrough: true,
    }
}
