//! JPEG data URL encoding shared by the dispatcher, the overlay and the
//! loopback service.

use std::io::Cursor;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::{DynamicImage, RgbImage, codecs::jpeg::JpegEncoder};

use crate::CoachError;

pub const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Encodes a frame as a JPEG data URL. `quality` is clamped to 1-100.
pub fn encode_jpeg_data_url(frame: &RgbImage, quality: u8) -> Result<String, CoachError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|e| CoachError::FrameEncodingError { source: e })?;

    let mut url = String::with_capacity(JPEG_DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(JPEG_DATA_URL_PREFIX);
    BASE64.encode_string(&jpeg, &mut url);
    Ok(url)
}

/// Decodes an image data URL (or bare base64 payload) into an image. The
/// whole image is decoded before this returns.
pub fn decode_data_url(payload: &str) -> Result<DynamicImage, CoachError> {
    let encoded = match payload.split_once(',') {
        Some((header, data)) => {
            if !header.starts_with("data:image/") || !header.ends_with(";base64") {
                return Err(CoachError::InvalidImagePayload {
                    reason: format!("unsupported data URL header '{header}'"),
                });
            }
            data
        }
        None => payload,
    };
    if encoded.is_empty() {
        return Err(CoachError::InvalidImagePayload {
            reason: "empty image payload".to_string(),
        });
    }

    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CoachError::InvalidImagePayload {
            reason: e.to_string(),
        })?;
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CoachError::InvalidImagePayload {
            reason: e.to_string(),
        })?
        .decode()
        .map_err(|e| CoachError::ImageDecodeError { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_encoded_frame_decodes_with_same_size() {
        let frame = RgbImage::from_pixel(24, 16, Rgb([200, 40, 40]));
        let url = encode_jpeg_data_url(&frame, 65).unwrap();
        assert!(url.starts_with(JPEG_DATA_URL_PREFIX));

        let decoded = decode_data_url(&url).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
    }

    #[test]
    fn test_bare_base64_payload_is_accepted() {
        let frame = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let url = encode_jpeg_data_url(&frame, 90).unwrap();
        let bare = url.trim_start_matches(JPEG_DATA_URL_PREFIX);
        assert!(decode_data_url(bare).is_ok());
    }

    #[test]
    fn test_garbage_payloads_are_rejected() {
        assert!(matches!(
            decode_data_url(""),
            Err(CoachError::InvalidImagePayload { .. })
        ));
        assert!(matches!(
            decode_data_url("data:text/plain;base64,aGVsbG8="),
            Err(CoachError::InvalidImagePayload { .. })
        ));
        assert!(matches!(
            decode_data_url("data:image/jpeg;base64,!!!"),
            Err(CoachError::InvalidImagePayload { .. })
        ));
        // valid base64, not an image
        assert!(decode_data_url("data:image/jpeg;base64,aGVsbG8gd29ybGQ=").is_err());
    }
}
