//! # Image Proxy
//!
//! An on-the-fly image transformation proxy. Given source image bytes and a
//! query string such as `w=200&quality=80`, it produces the resized, cropped,
//! filtered and re-encoded image plus the response headers to serve it with.
//!
//! # Architecture: One Request, One Pass
//!
//! ```text
//! query ─▶ directives ─▶ ┌ zoom ─▶ geometry ─▶ gate ─▶ raster ┐ per directive
//!                        └────────────────────────────────────┘
//!                     ─▶ encode ─▶ WebP or optimizers ─▶ headers
//! ```
//!
//! Directive dispatch, geometry and the validity gate are pure and never see
//! pixels. The raster work sits behind the [`imaging::ImageBackend`] trait so
//! the whole dispatch loop is testable against a recording mock.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `config.toml` loading, stock defaults, merging and validation |
//! | [`request`] | Ordered query pairs and client capability signals (`Accept`, `DPR`) |
//! | [`directives`] | Typed directives and the dispatch-order state machine |
//! | [`imaging`] | Geometry, zoom, validity gate, letterbox and the raster backend |
//! | [`source`] | Header sniffing and size limits before anything is decoded |
//! | [`jpeg_header`] | JPEG density and estimated quality from the marker segments |
//! | [`orientation`] | EXIF orientation baked into pixels before metadata is stripped |
//! | [`engine`] | The per-request dispatch loop over an `ImageSubject` |
//! | [`encode`] | Output format, quality policy and WebP negotiation |
//! | [`optimize`] | External optimizer passes with deadlines and atomic replace |
//! | [`response`] | Response headers in emission order |
//! | [`batch`] | JSON job lists transformed on a rayon pool |
//!
//! # Design Decisions
//!
//! ## Query Order Is the Dispatch Order
//!
//! Directives run in the order they first appear in the query string, so
//! `h=100&w=50` and `w=50&h=100` are different requests. The request keeps
//! its parameters as an ordered list of pairs rather than a map. The only
//! exception is `crop=1`, which always runs first and absorbs `w` and `h`.
//!
//! ## Rejections Are Values
//!
//! A directive that would produce a too-small, unchanged or unauthorized
//! upscaled image is skipped, not reported as an error. If nothing applies,
//! the source bytes are served untouched. Only a failing raster operation
//! aborts the request.
//!
//! ## External Tools Never Corrupt the Working File
//!
//! Every optimizer writes into its own temp file. The working file is
//! replaced by rename only when the tool exits zero, in time, with a
//! non-empty result.

pub mod batch;
pub mod config;
pub mod directives;
pub mod encode;
pub mod engine;
pub mod imaging;
pub mod jpeg_header;
pub mod optimize;
pub mod orientation;
pub mod request;
pub mod response;
pub mod source;
