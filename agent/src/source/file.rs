use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use frame_sentinel_common::frame::Frame;
use tracing::debug;

use super::{CaptureError, FrameSource};

/// Polls a still image at a fixed path, re-reading it on every tick.
pub struct FileFrameSource {
    path: PathBuf,
    name: String,
    seq: u64,
}

impl FileFrameSource {
    pub fn new(path: PathBuf) -> Self {
        let name = format!("file:{}", path.display());
        Self { path, name, seq: 0 }
    }
}

#[async_trait]
impl FrameSource for FileFrameSource {
    async fn capture(&mut self) -> Result<Frame, CaptureError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => CaptureError::NotFound(self.path.clone()),
            _ => CaptureError::Read {
                path: self.path.clone(),
                source: e,
            },
        })?;

        let frame = Frame::decode(&bytes, Utc::now().timestamp_millis(), self.seq)?;
        debug!(
            path = self.path.display().to_string(),
            bytes = bytes.len(),
            width = frame.width(),
            height = frame.height(),
            seq = self.seq,
            "read frame from file"
        );
        self.seq += 1;
        Ok(frame)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileFrameSource::new(dir.path().join("frame.jpg"));
        let err = source.capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::NotFound(_)));
    }

    #[tokio::test]
    async fn undecodable_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();
        let mut source = FileFrameSource::new(path);
        let err = source.capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::Decode(_)));
    }

    #[tokio::test]
    async fn rereads_the_file_each_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(8, 6, Rgb([0, 0, 0])).save(&path).unwrap();

        let mut source = FileFrameSource::new(path.clone());
        let first = source.capture().await.unwrap();
        assert_eq!((first.width(), first.height()), (8, 6));
        assert_eq!(first.seq, 0);

        RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])).save(&path).unwrap();
        let second = source.capture().await.unwrap();
        assert_eq!((second.width(), second.height()), (4, 4));
        assert_eq!(second.seq, 1);
        assert!(source.name().starts_with("file:"));
    }
}
