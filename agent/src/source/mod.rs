pub mod file;
pub mod mjpeg;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use frame_sentinel_common::config::{SourceConfig, SourceMode};
use frame_sentinel_common::frame::{Frame, FrameError};

pub use file::FileFrameSource;
pub use mjpeg::MjpegFrameSource;

/// Produces the current frame once per tick.
#[async_trait]
pub trait FrameSource: Send {
    /// Capture a frame. Errors are per-tick and never fatal.
    async fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Human-readable description for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Open the source selected by the config. Failing here is fatal.
pub async fn open(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceInitError> {
    match config.mode {
        SourceMode::File => Ok(Box::new(FileFrameSource::new(config.path.clone()))),
        SourceMode::Mjpeg => {
            let url = config.url.as_deref().ok_or(SourceInitError::MissingUrl)?;
            let source = MjpegFrameSource::open(
                url,
                Duration::from_secs(config.connect_timeout_secs),
                Duration::from_secs(config.read_timeout_secs),
            )
            .await?;
            Ok(Box::new(source))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("image not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Decode(#[from] FrameError),
    #[error("camera stream unavailable")]
    Unavailable,
    #[error("no new frame since seq {0}")]
    Stale(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceInitError {
    #[error("mjpeg source selected but no camera URL configured")]
    MissingUrl,
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("failed to connect to camera: {0}")]
    Connect(reqwest::Error),
    #[error("camera answered with HTTP status {0}")]
    HttpStatus(u16),
}
