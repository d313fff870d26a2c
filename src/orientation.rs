//! EXIF-orientation correction of a working JPEG file.
//!
//! Optimizer passes that strip EXIF would otherwise lose the orientation tag
//! and serve a sideways photo. Before such a pass, the rotation is baked into
//! the pixels and the EXIF block is dropped; the ICC profile is kept.

use crate::imaging::BackendError;
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use img_parts::jpeg::Jpeg;
use img_parts::{Bytes, ImageEXIF, ImageICC};
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::debug;

/// EXIF orientation (1-8) of `data`, if tagged.
pub fn read_orientation(data: &[u8]) -> Option<u32> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()?;
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .filter(|value| (1..=8).contains(value))
}

/// Rotate and flip `image` so that it displays upright without the tag.
pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Bake the EXIF orientation of the JPEG at `path` into its pixels.
///
/// Returns `Ok(false)` when the file carries no rotation. The file is replaced
/// atomically; on error it is left untouched.
pub fn rotate_using_exif(path: &Path, quality: u32) -> Result<bool, BackendError> {
    let data = std::fs::read(path)?;
    let Some(orientation) = read_orientation(&data).filter(|&o| o != 1) else {
        return Ok(false);
    };

    let decoded = image::load_from_memory(&data)
        .map_err(|e| BackendError::ProcessingFailed(format!("EXIF rotate decode: {e}")))?;
    let upright = apply_orientation(decoded, orientation);

    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100) as u8);
    DynamicImage::ImageRgb8(upright.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| BackendError::ProcessingFailed(format!("EXIF rotate encode: {e}")))?;

    let profile = Jpeg::from_bytes(Bytes::from(data))
        .ok()
        .and_then(|jpeg| jpeg.icc_profile());
    let mut jpeg = Jpeg::from_bytes(Bytes::from(encoded))
        .map_err(|e| BackendError::ProcessingFailed(format!("EXIF rotate reparse: {e}")))?;
    jpeg.set_icc_profile(profile);
    jpeg.set_exif(None);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".rotate-")
        .tempfile_in(dir)?;
    jpeg.encoder().write_to(&mut tmp)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| BackendError::Io(e.error))?;

    debug!(orientation, path = %path.display(), "applied EXIF orientation");
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::imaging::rust_backend::tests::synthetic_jpeg;
    use image::GenericImageView;

    /// Big-endian TIFF block with a single Orientation entry.
    fn exif_with_orientation(value: u16) -> Vec<u8> {
        let mut tiff = b"MM\x00\x2a".to_vec();
        tiff.extend_from_slice(&8u32.to_be_bytes());
        tiff.extend_from_slice(&1u16.to_be_bytes());
        tiff.extend_from_slice(&0x0112u16.to_be_bytes());
        tiff.extend_from_slice(&3u16.to_be_bytes());
        tiff.extend_from_slice(&1u32.to_be_bytes());
        tiff.extend_from_slice(&value.to_be_bytes());
        tiff.extend_from_slice(&[0, 0]);
        tiff.extend_from_slice(&0u32.to_be_bytes());
        tiff
    }

    /// Gradient JPEG carrying an EXIF Orientation tag.
    pub(crate) fn tagged_jpeg(width: u32, height: u32, orientation: u16) -> Vec<u8> {
        let mut jpeg = Jpeg::from_bytes(Bytes::from(synthetic_jpeg(width, height))).unwrap();
        jpeg.set_exif(Some(Bytes::from(exif_with_orientation(orientation))));
        let mut out = Vec::new();
        jpeg.encoder().write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn reads_orientation_tag() {
        assert_eq!(read_orientation(&tagged_jpeg(8, 4, 6)), Some(6));
        assert_eq!(read_orientation(&synthetic_jpeg(8, 4)), None);
    }

    #[test]
    fn quarter_turns_swap_axes() {
        let image = DynamicImage::new_rgb8(20, 10);
        assert_eq!(apply_orientation(image.clone(), 6).dimensions(), (10, 20));
        assert_eq!(apply_orientation(image.clone(), 3).dimensions(), (20, 10));
        assert_eq!(apply_orientation(image, 9).dimensions(), (20, 10));
    }

    #[test]
    fn rotates_file_in_place_and_drops_tag() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("work.jpg");
        std::fs::write(&path, tagged_jpeg(20, 10, 6)).unwrap();

        assert!(rotate_using_exif(&path, 90).unwrap());

        let data = std::fs::read(&path).unwrap();
        assert_eq!(read_orientation(&data), None);
        assert_eq!(image::load_from_memory(&data).unwrap().dimensions(), (10, 20));
    }

    #[test]
    fn untagged_file_is_left_alone() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("work.jpg");
        let original = synthetic_jpeg(20, 10);
        std::fs::write(&path, &original).unwrap();

        assert!(!rotate_using_exif(&path, 90).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }
}
