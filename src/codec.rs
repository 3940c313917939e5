use std::io::Cursor;

use base64::Engine;
use bytes::Bytes;
use image::ImageReader;

use crate::error::{GenerationError, Result};

const BASE64_MARKER: &str = ";base64,";

/// Raw image bytes plus their media type, as sent to and received from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub media_type: String,
    pub bytes: Bytes,
}

impl ImagePayload {
    pub fn new(media_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { media_type: media_type.into(), bytes: bytes.into() }
    }

    /// Builds a payload from base64 text (the wire form used by Gemini).
    pub fn from_base64(media_type: impl Into<String>, data: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|_| GenerationError::InvalidImageFormat)?;
        Ok(Self::new(media_type, bytes))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{}{}{}", self.media_type, BASE64_MARKER, self.to_base64())
    }

    /// Pixel dimensions read from the image header. The pixels are not decoded.
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        let reader = ImageReader::new(Cursor::new(&self.bytes[..]))
            .with_guessed_format()
            .map_err(|_| GenerationError::InvalidImageFormat)?;
        if reader.format().is_none() {
            return Err(GenerationError::InvalidImageFormat);
        }
        Ok(reader.into_dimensions()?)
    }

    /// Short description for logs, never the payload itself.
    pub fn summary(&self) -> String {
        format!("{} [{} bytes]", self.media_type, self.bytes.len())
    }
}

/// Parses `data:<mediaType>;base64,<payload>`.
pub fn decode(data_url: &str) -> Result<ImagePayload> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or(GenerationError::InvalidImageFormat)?;
    let marker = rest.rfind(BASE64_MARKER).ok_or(GenerationError::InvalidImageFormat)?;
    let media_type = &rest[..marker];
    let data = &rest[marker + BASE64_MARKER.len()..];
    if media_type.is_empty() || data.is_empty() {
        return Err(GenerationError::InvalidImageFormat);
    }
    ImagePayload::from_base64(media_type, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_then_encode_round_trips() {
        let url = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUg==";
        let payload = decode(url).unwrap();
        assert_eq!(payload.media_type, "image/png");
        assert_eq!(&payload.bytes[..4], &[0x89, b'P', b'N', b'G']);
        assert_eq!(payload.to_data_url(), url);
    }

    #[test]
    fn binary_payload_survives_round_trip() {
        let bytes: Vec<u8> = (0..=255).collect();
        let original = ImagePayload::new("image/jpeg", bytes.clone());
        let decoded = decode(&original.to_data_url()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn rejects_malformed_urls() {
        for bad in [
            "",
            "image/png;base64,AAAA",
            "data:image/png,AAAA",
            "data:;base64,AAAA",
            "data:image/png;base64,",
            "data:image/png;base64,@@not base64@@",
        ] {
            assert!(
                matches!(decode(bad), Err(GenerationError::InvalidImageFormat)),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn dimensions_come_from_the_header() {
        use crate::testing::encoded;
        use image::ImageFormat;

        for format in [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP, ImageFormat::Gif] {
            let payload = encoded(37, 21, [200, 10, 10], format);
            assert_eq!(payload.dimensions().unwrap(), (37, 21), "{format:?}");
        }
    }

    #[test]
    fn dimensions_reject_garbage_bytes() {
        let payload = ImagePayload::new("image/png", vec![1u8, 2, 3]);
        assert!(matches!(payload.dimensions(), Err(GenerationError::InvalidImageFormat)));
    }
}
