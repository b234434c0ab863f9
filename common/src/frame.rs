use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};
use std::io::Cursor;

/// A captured camera frame with timestamp metadata.
///
/// Frames are decoded to RGB on capture so that change detection and
/// encoding never have to care which source or container produced them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Unix millis at capture time.
    pub captured_at_ms: i64,
    /// Per-source sequence number.
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    /// Decode an encoded image (JPEG, PNG, ...). The format is guessed from the bytes.
    pub fn decode(data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(Self::new(img.to_rgb8(), captured_at_ms, seq))
    }

    /// Encode as baseline RGB JPEG, the transport format for analysis and alerts.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
            .encode_image(&self.image)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Capture time formatted for logs and captions.
    pub fn captured_at(&self) -> String {
        let dt = chrono::DateTime::from_timestamp_millis(self.captured_at_ms)
            .unwrap_or_else(chrono::Utc::now);
        dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("image payload is empty")]
    Empty,
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode JPEG: {0}")]
    Encode(String),
}
