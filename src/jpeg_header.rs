//! Narrow JPEG marker parser.
//!
//! Reads three hints from a JPEG header without decoding pixels:
//! - frame dimensions from the first SOF segment
//! - pixel density from the JFIF APP0 segment
//! - the encoder quality, estimated from the luminance quantization table
//!
//! Scanning stops at SOS (start of scan); nothing past the header is read.

/// Hints recovered from a JPEG header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegHeader {
    pub width: u32,
    pub height: u32,
    /// Dots per inch, when the JFIF segment states an absolute unit.
    pub density: Option<(u16, u16)>,
    /// Estimated IJG quality (1-100) of the luminance table.
    pub quality: Option<u32>,
}

const SOI: u8 = 0xD8;
const SOS: u8 = 0xDA;
const DQT: u8 = 0xDB;
const APP0: u8 = 0xE0;
const JFIF_ID: &[u8] = b"JFIF\0";

/// IJG reference luminance table (ITU T.81 Annex K).
const STD_LUMINANCE: [u16; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61, //
    12, 12, 14, 19, 26, 58, 60, 55, //
    14, 13, 16, 24, 40, 57, 69, 56, //
    14, 17, 22, 29, 51, 87, 80, 62, //
    18, 22, 37, 56, 68, 109, 103, 77, //
    24, 35, 55, 64, 81, 104, 113, 92, //
    49, 64, 78, 87, 103, 121, 120, 101, //
    72, 92, 95, 98, 112, 100, 103, 99,
];

impl JpegHeader {
    /// Parse a JPEG header. `None` when the data is not a JPEG or has no frame header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
            return None;
        }

        let mut dimensions = None;
        let mut density = None;
        let mut quality = None;

        for (marker, payload) in Segments::new(data) {
            match marker {
                APP0 if density.is_none() => density = jfif_density(payload),
                DQT if quality.is_none() => quality = luminance_quality(payload),
                m if is_sof(m) && dimensions.is_none() => dimensions = frame_size(payload),
                _ => {}
            }
        }

        let (width, height) = dimensions?;
        Some(Self {
            width,
            height,
            density,
            quality,
        })
    }
}

// ---------------------------------------------------------------------------
// Segment walking
// ---------------------------------------------------------------------------

/// Iterator over `(marker, payload)` pairs up to SOS.
struct Segments<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Segments<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 2 }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        loop {
            // skip to a marker, then past any fill bytes
            while self.pos < data.len() && data[self.pos] != 0xFF {
                self.pos += 1;
            }
            while self.pos < data.len() && data[self.pos] == 0xFF {
                self.pos += 1;
            }
            let marker = *data.get(self.pos)?;
            self.pos += 1;

            if marker == SOS {
                self.pos = data.len();
                return None;
            }
            // standalone markers carry no length
            if marker == 0x01 || marker == SOI || (0xD0..=0xD7).contains(&marker) {
                continue;
            }

            let len_bytes = data.get(self.pos..self.pos + 2)?;
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            if len < 2 {
                return None;
            }
            let start = self.pos + 2;
            let end = (self.pos + len).min(data.len());
            self.pos += len;
            return Some((marker, &data[start..end]));
        }
    }
}

fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

// ---------------------------------------------------------------------------
// Segment payloads
// ---------------------------------------------------------------------------

/// SOF: precision (1), height (2), width (2).
fn frame_size(payload: &[u8]) -> Option<(u32, u32)> {
    let bytes = payload.get(1..5)?;
    let height = u16::from_be_bytes([bytes[0], bytes[1]]) as u32;
    let width = u16::from_be_bytes([bytes[2], bytes[3]]) as u32;
    Some((width, height))
}

/// JFIF APP0: identifier (5), version (2), units (1), x density (2), y density (2).
fn jfif_density(payload: &[u8]) -> Option<(u16, u16)> {
    if !payload.starts_with(JFIF_ID) {
        return None;
    }
    let bytes = payload.get(7..12)?;
    let x = u16::from_be_bytes([bytes[1], bytes[2]]);
    let y = u16::from_be_bytes([bytes[3], bytes[4]]);
    match bytes[0] {
        1 => Some((x, y)),
        // dots per centimetre
        2 => Some((
            (x as f64 * 2.54).round() as u16,
            (y as f64 * 2.54).round() as u16,
        )),
        _ => None,
    }
}

/// Estimate quality from table 0 of a DQT payload.
///
/// The table is compared with the IJG reference by total magnitude, which
/// is independent of the zig-zag storage order, then the IJG scaling
/// (`200 - 2q` above 50, `5000 / q` below) is inverted.
fn luminance_quality(payload: &[u8]) -> Option<u32> {
    let mut pos = 0;
    while pos < payload.len() {
        let info = payload[pos];
        let wide = info >> 4 != 0;
        let id = info & 0x0F;
        let size = if wide { 128 } else { 64 };
        let table = payload.get(pos + 1..pos + 1 + size)?;
        pos += 1 + size;
        if id != 0 {
            continue;
        }

        let total: u64 = if wide {
            table
                .chunks_exact(2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]) as u64)
                .sum()
        } else {
            table.iter().map(|&b| b as u64).sum()
        };
        let reference: u64 = STD_LUMINANCE.iter().map(|&v| v as u64).sum();
        let scale = total as f64 * 100.0 / reference as f64;

        let quality = if scale <= 100.0 {
            (200.0 - scale) / 2.0
        } else {
            5000.0 / scale
        };
        return Some((quality.round() as u32).clamp(1, 100));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageEncoder;
    use image::codecs::jpeg::{JpegEncoder, PixelDensity, PixelDensityUnit};

    fn encode(width: u32, height: u32, quality: u8, density: Option<u16>) -> Vec<u8> {
        let pixels = vec![128u8; (width * height * 3) as usize];
        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        if let Some(dpi) = density {
            encoder.set_pixel_density(PixelDensity {
                density: (dpi, dpi),
                unit: PixelDensityUnit::Inches,
            });
        }
        encoder
            .write_image(&pixels, width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        buf
    }

    #[test]
    fn reads_frame_dimensions() {
        let header = JpegHeader::parse(&encode(120, 45, 80, None)).unwrap();
        assert_eq!((header.width, header.height), (120, 45));
    }

    #[test]
    fn estimates_encoder_quality() {
        for quality in [50u8, 75, 90] {
            let header = JpegHeader::parse(&encode(16, 16, quality, None)).unwrap();
            let estimate = header.quality.unwrap() as i32;
            assert!(
                (estimate - quality as i32).abs() <= 2,
                "quality {quality} estimated as {estimate}"
            );
        }
    }

    #[test]
    fn reads_absolute_density_only() {
        let header = JpegHeader::parse(&encode(8, 8, 80, Some(300))).unwrap();
        assert_eq!(header.density, Some((300, 300)));

        // the default JFIF header only states an aspect ratio
        let header = JpegHeader::parse(&encode(8, 8, 80, None)).unwrap();
        assert_eq!(header.density, None);
    }

    #[test]
    fn dots_per_centimetre_convert_to_inches() {
        let mut payload = JFIF_ID.to_vec();
        payload.extend_from_slice(&[1, 1, 2, 0, 118, 0, 118]);
        assert_eq!(jfif_density(&payload), Some((300, 300)));
    }

    #[test]
    fn rejects_non_jpeg_and_truncated_data() {
        assert_eq!(JpegHeader::parse(b"\x89PNG\r\n\x1a\n"), None);
        let jpeg = encode(8, 8, 80, None);
        assert_eq!(JpegHeader::parse(&jpeg[..20]), None);
    }

    #[test]
    fn sof_marker_classification() {
        assert!(is_sof(0xC0));
        assert!(is_sof(0xC2));
        assert!(!is_sof(0xC4));
        assert!(!is_sof(0xDB));
    }
}
