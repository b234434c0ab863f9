use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use frame_sentinel_common::frame::Frame;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CaptureError, FrameSource, SourceInitError};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
/// A single part larger than this means we lost sync with the stream.
const MAX_PART_BYTES: usize = 8 * 1024 * 1024;

/// Newest JPEG published by the reader task.
#[derive(Debug, Clone)]
struct StreamFrame {
    jpeg: Bytes,
    captured_at_ms: i64,
    seq: u64,
}

/// Live camera source reading an MJPEG `multipart/x-mixed-replace` stream.
///
/// The connection is opened once in [`MjpegFrameSource::open`]. A background
/// task then drains the stream continuously and keeps only the newest frame,
/// so a tick always sees the current scene rather than a buffered backlog.
/// The task reconnects with exponential backoff and is aborted on drop.
pub struct MjpegFrameSource {
    name: String,
    latest: watch::Receiver<Option<StreamFrame>>,
    last_seq: Option<u64>,
    reader: JoinHandle<()>,
}

impl MjpegFrameSource {
    /// `idle_timeout` bounds the wait for the next body chunk; a stream that
    /// stays silent longer is dropped and reconnected.
    pub async fn open(
        url: &str,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, SourceInitError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(SourceInitError::Client)?;

        let response = connect(&client, url).await?;
        info!(url, status = %response.status(), "connected to MJPEG stream");

        let (tx, rx) = watch::channel(None);
        let reader = tokio::spawn(run_reader(
            client,
            url.to_string(),
            response,
            idle_timeout,
            tx,
        ));
        Ok(Self::with_receiver(format!("mjpeg:{url}"), rx, reader))
    }

    fn with_receiver(
        name: String,
        latest: watch::Receiver<Option<StreamFrame>>,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            latest,
            last_seq: None,
            reader,
        }
    }
}

#[async_trait]
impl FrameSource for MjpegFrameSource {
    async fn capture(&mut self) -> Result<Frame, CaptureError> {
        let current = self.latest.borrow_and_update().clone();
        let Some(frame) = current else {
            return Err(CaptureError::Unavailable);
        };
        if self.last_seq == Some(frame.seq) {
            return Err(CaptureError::Stale(frame.seq));
        }
        self.last_seq = Some(frame.seq);

        let decoded = Frame::decode(&frame.jpeg, frame.captured_at_ms, frame.seq)?;
        debug!(
            seq = frame.seq,
            bytes = frame.jpeg.len(),
            width = decoded.width(),
            height = decoded.height(),
            "took newest frame from stream"
        );
        Ok(decoded)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MjpegFrameSource {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn connect(client: &reqwest::Client, url: &str) -> Result<reqwest::Response, SourceInitError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceInitError::Connect)?;

    if !response.status().is_success() {
        return Err(SourceInitError::HttpStatus(response.status().as_u16()));
    }
    Ok(response)
}

/// Drain the stream into `tx`, reconnecting with exponential backoff.
async fn run_reader(
    client: reqwest::Client,
    url: String,
    first: reqwest::Response,
    idle_timeout: Duration,
    tx: watch::Sender<Option<StreamFrame>>,
) {
    let mut seq: u64 = 0;
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);
    let mut pending = Some(first);

    loop {
        let response = match pending.take() {
            Some(r) => Ok(r),
            None => {
                info!(url, "reconnecting to MJPEG stream");
                connect(&client, &url).await
            }
        };

        match response {
            Ok(response) => {
                let before = seq;
                match consume_stream(response, idle_timeout, &tx, &mut seq).await {
                    Ok(()) => info!(url, "stream ended, reconnecting"),
                    Err(e) => error!(error = %e, url, "stream error, reconnecting in {:?}", backoff),
                }
                if seq > before {
                    backoff = Duration::from_secs(2);
                }
            }
            Err(e) => {
                error!(error = %e, url, "camera unreachable, retrying in {:?}", backoff);
            }
        }

        // Ticks must not analyze a frame from a dead stream.
        tx.send_replace(None);
        if tx.is_closed() {
            debug!(url, "frame source dropped, stopping reader");
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("no data from camera for {0:?}")]
    Idle(Duration),
}

async fn consume_stream(
    response: reqwest::Response,
    idle_timeout: Duration,
    tx: &watch::Sender<Option<StreamFrame>>,
    seq: &mut u64,
) -> Result<(), StreamError> {
    let boundary = boundary_from_content_type(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );
    debug!(boundary, "parsing multipart stream");

    let mut parser = MjpegParser::new(&boundary);
    let mut byte_stream = response.bytes_stream();

    loop {
        let next = tokio::time::timeout(idle_timeout, byte_stream.next())
            .await
            .map_err(|_| StreamError::Idle(idle_timeout))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        for jpeg in parser.push(&chunk) {
            *seq += 1;
            tx.send_replace(Some(StreamFrame {
                jpeg,
                captured_at_ms: Utc::now().timestamp_millis(),
                seq: *seq,
            }));
        }
        if tx.is_closed() {
            return Ok(());
        }
    }

    Ok(())
}

/// Extract the multipart boundary from a `Content-Type` header value.
/// Some cameras send the boundary with its leading dashes; those are dropped.
pub fn boundary_from_content_type(content_type: Option<&str>) -> String {
    content_type
        .and_then(|ct| {
            ct.split(';')
                .map(str::trim)
                .find_map(|param| param.strip_prefix("boundary="))
        })
        .map(|b| b.trim_matches('"').trim_start_matches("--").to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string())
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` JPEG streams.
pub struct MjpegParser {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset in `buffer` already scanned for the next delimiter.
    scan_from: usize,
}

impl MjpegParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            delimiter: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Feed a chunk of the HTTP body and return every JPEG it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        let _ = self.buffer.split_to(pos + self.delimiter.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case the boundary spans chunks
                        if self.buffer.len() > self.delimiter.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.delimiter.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let found = find_subsequence(&self.buffer[self.scan_from..], &self.delimiter);
                    let Some(pos) = found else {
                        if self.buffer.len() > MAX_PART_BYTES {
                            warn!(
                                bytes = self.buffer.len(),
                                "multipart part too large, resynchronising"
                            );
                            self.buffer.clear();
                            self.scan_from = 0;
                            self.state = ParseState::SeekingBoundary;
                            break;
                        }
                        self.scan_from = self.buffer.len().saturating_sub(self.delimiter.len());
                        break;
                    };

                    let delimiter_at = self.scan_from + pos;
                    // Strip trailing \r\n before the boundary
                    let end = if delimiter_at >= 2 && &self.buffer[delimiter_at - 2..delimiter_at] == b"\r\n" {
                        delimiter_at - 2
                    } else {
                        delimiter_at
                    };

                    let jpeg = self.buffer.split_to(end).freeze();
                    let _ = self.buffer.split_to(delimiter_at - end + self.delimiter.len());
                    if !jpeg.is_empty() {
                        frames.push(jpeg);
                    }

                    // Already past the boundary, go to header parsing
                    self.scan_from = 0;
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
