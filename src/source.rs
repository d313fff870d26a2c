//! Source admission.
//!
//! Before anything is decoded, the source bytes are sniffed for their
//! dimensions (GIF logical screen, PNG IHDR, or the JPEG frame header) and
//! refused when they exceed the configured maximum width or height. A
//! malicious 60000x60000 PNG is rejected here, from 24 header bytes, instead
//! of being handed to a decoder.

use crate::config::LimitsConfig;
use crate::imaging::{Dimensions, SourceFormat};
use crate::jpeg_header::JpegHeader;
use thiserror::Error;

/// Shortest input that can carry a PNG IHDR.
pub const MIN_SOURCE_LEN: usize = 24;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("source is {0} bytes, too short to be an image")]
    TooShort(usize),
    #[error("source is {width}x{height}, larger than {max_width}x{max_height}")]
    TooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
}

/// What the header says about a source, before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub format: SourceFormat,
    /// `None` when the header could not be read (the decoder decides).
    pub dimensions: Option<Dimensions>,
}

impl SourceInfo {
    pub fn is_gif(&self) -> bool {
        self.format == SourceFormat::Gif
    }
}

/// Sniff format and dimensions from the first bytes of `data`.
pub fn sniff(data: &[u8]) -> SourceInfo {
    if data.starts_with(b"GIF8") && data.len() >= 10 {
        let width = u16::from_le_bytes([data[6], data[7]]) as u32;
        let height = u16::from_le_bytes([data[8], data[9]]) as u32;
        return SourceInfo {
            format: SourceFormat::Gif,
            dimensions: Some(Dimensions::new(width, height)),
        };
    }

    if data.starts_with(PNG_SIGNATURE) && data.len() >= 24 && &data[12..16] == b"IHDR" {
        let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        return SourceInfo {
            format: SourceFormat::Png,
            dimensions: Some(Dimensions::new(width, height)),
        };
    }

    if let Some(header) = JpegHeader::parse(data) {
        return SourceInfo {
            format: SourceFormat::Jpeg,
            dimensions: Some(Dimensions::new(header.width, header.height)),
        };
    }

    let format = match image::guess_format(data) {
        Ok(image::ImageFormat::Bmp) => SourceFormat::Bmp,
        Ok(image::ImageFormat::WebP) => SourceFormat::WebP,
        Ok(image::ImageFormat::Jpeg) => SourceFormat::Jpeg,
        _ => SourceFormat::Other,
    };
    SourceInfo {
        format,
        dimensions: None,
    }
}

/// Admit `data` for processing, or explain why it is refused.
///
/// A side exactly at its maximum is admitted; either side past it refuses
/// the source.
pub fn admit(data: &[u8], limits: &LimitsConfig) -> Result<SourceInfo, AdmissionError> {
    if data.len() < MIN_SOURCE_LEN {
        return Err(AdmissionError::TooShort(data.len()));
    }

    let info = sniff(data);
    if let Some(dims) = info.dimensions
        && (dims.width > limits.image_max_width || dims.height > limits.image_max_height)
    {
        return Err(AdmissionError::TooLarge {
            width: dims.width,
            height: dims.height,
            max_width: limits.image_max_width,
            max_height: limits.image_max_height,
        });
    }
    Ok(info)
}
