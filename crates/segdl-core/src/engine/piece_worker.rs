//! Piece worker - transfers one byte range of a download into the
//! destination file
//!
//! Workers of the same download share the destination file but each one
//! only writes inside its own range. A worker never retries by itself:
//! whatever happens ends up as the [`Outcome`] handed back to the
//! coordinator.

use crate::engine::fetcher::{FetchRequest, HttpFetcher};
use crate::engine::metadata::{content_range_start, fetch_error_outcome, unexpected_status};
use crate::engine::persistence::DownloadDatabase;
use crate::engine::signal::StopSignal;
use crate::outcome::Outcome;
use crate::storage;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH,
    CONTENT_RANGE, IF_MATCH, RANGE, RETRY_AFTER, TRANSFER_ENCODING,
};
use reqwest::{Response, Version};
use segdl_types::{DownloadHeader, DownloadInfo, DownloadPiece, EngineEvent, StatusCode};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Size of a single read from the response body
pub const BUFFER_SIZE: usize = 8 * 1024;
/// Progress must exceed this many bytes before a checkpoint...
pub const CHECKPOINT_BYTES: u64 = 64 * 1024;
/// ...and this much time must have passed since the previous one
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(2000);
/// Minimum interval between speed samples
pub const SPEED_INTERVAL: Duration = Duration::from_millis(500);

/// Everything the workers of one download attempt share
#[derive(Debug, Clone)]
pub struct PieceContext {
    pub info: Arc<DownloadInfo>,
    pub headers: Arc<Vec<DownloadHeader>>,
    pub db: DownloadDatabase,
    pub fetcher: HttpFetcher,
    pub signal: StopSignal,
    pub events: broadcast::Sender<EngineEvent>,
}

/// Downloads a single piece
pub struct PieceWorker {
    ctx: PieceContext,
    index: u32,
}

impl PieceWorker {
    pub fn new(ctx: PieceContext, index: u32) -> Self {
        Self { ctx, index }
    }

    /// Run the piece to completion and persist its final status
    pub async fn run(self) -> Outcome {
        let id = self.ctx.info.id;
        let mut piece = match self.ctx.db.get_piece(id, self.index).await {
            Ok(Some(piece)) => piece,
            Ok(None) => return Outcome::stopped(),
            Err(e) => {
                return Outcome::new(StatusCode::UnknownError, "Cannot load piece").with_cause(e)
            }
        };

        if piece.status_code == StatusCode::Success {
            debug!("Piece {} of {} already complete", self.index, id);
            return Outcome::success();
        }

        piece.status_code = StatusCode::Running;
        piece.status_msg = None;
        match self.persist(&piece).await {
            Ok(true) => {}
            Ok(false) => return Outcome::stopped(),
            Err(outcome) => return outcome,
        }

        let outcome = self.download(&mut piece).await;

        piece.status_code = match (outcome.status(), self.ctx.signal.reason()) {
            (StatusCode::Stopped, Some(reason)) => reason.status(),
            (status, _) => status,
        };
        piece.status_msg = outcome.describe();
        if piece.status_code.is_error() {
            piece.num_failed += 1;
        }
        if let Err(e) = self.persist(&piece).await {
            warn!("Piece {} of {}: cannot save final state: {}", self.index, id, e);
        }

        info!(
            "Piece {} of {} finished: {} at byte {}",
            self.index, id, outcome, piece.cur_bytes
        );
        outcome
    }

    async fn download(&self, piece: &mut DownloadPiece) -> Outcome {
        let info = &self.ctx.info;
        let start = info.piece_start(piece.index);
        let end = match piece.size {
            Some(0) => return Outcome::success(),
            Some(size) => Some(start + size - 1),
            None => None,
        };

        if !info.partial_support && piece.cur_bytes != start {
            piece.cur_bytes = start;
            if let Err(e) = storage::truncate(&info.file_path(), start).await {
                return Outcome::new(StatusCode::FileError, "Cannot truncate file").with_cause(e);
            }
        }
        if end.is_some_and(|end| piece.cur_bytes == end + 1) {
            return Outcome::success();
        }

        let request = build_request(info, &self.ctx.headers, piece.cur_bytes, start, end);
        debug!(
            "Piece {} of {}: requesting bytes {}-{:?}",
            piece.index, info.id, piece.cur_bytes, end
        );
        let response = match self.ctx.fetcher.fetch(&request, &self.ctx.signal).await {
            Ok(response) => response,
            Err(e) => return fetch_error_outcome(e),
        };

        let code = response.status();
        match code {
            206 => {
                let served = response.header(CONTENT_RANGE).map(content_range_start);
                if let Some(served) = served.filter(|s| *s != Some(piece.cur_bytes)) {
                    return Outcome::new(
                        StatusCode::HttpDataError,
                        format!(
                            "Server sent range starting at {:?}, requested {}",
                            served, piece.cur_bytes
                        ),
                    );
                }
            }
            200 if piece.cur_bytes == start && start == 0 => {}
            200 => {
                return Outcome::new(StatusCode::CannotResume, "Server ignored the range request")
            }
            412 => {
                return Outcome::new(StatusCode::CannotResume, "Resource changed on the server")
            }
            503 => {
                let mut outcome = Outcome::new(StatusCode::Upstream(503), response.message());
                if let Some(delay) = response
                    .header(RETRY_AFTER)
                    .and_then(|v| parse_retry_after(v, Utc::now()))
                {
                    outcome = outcome.with_retry_after(delay);
                }
                return outcome;
            }
            500 => return Outcome::new(StatusCode::Upstream(500), response.message()),
            code => return Outcome::new(unexpected_status(code), response.message()),
        }

        if !end_detectable(response.response.version(), response.response.headers()) {
            return Outcome::new(
                StatusCode::CannotResume,
                "Server does not mark the end of the data",
            );
        }

        self.transfer(piece, response.response, end).await
    }

    async fn transfer(
        &self,
        piece: &mut DownloadPiece,
        response: Response,
        end: Option<u64>,
    ) -> Outcome {
        let path = self.ctx.info.file_path();
        let mut file = match storage::open_for_pieces(&path).await {
            Ok(file) => file,
            Err(e) => return Outcome::new(StatusCode::FileError, "Cannot open file").with_cause(e),
        };
        if let Err(e) = file.seek(SeekFrom::Start(piece.cur_bytes)).await {
            return Outcome::new(StatusCode::FileError, "Cannot seek in file").with_cause(e);
        }

        let outcome = self.stream_into(&mut file, piece, response, end).await;

        let flushed = match file.flush().await {
            Ok(()) => file.sync_data().await,
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            if outcome.status() == StatusCode::Success {
                return Outcome::new(StatusCode::FileError, "Cannot flush file").with_cause(e);
            }
            warn!("Piece {}: flush failed: {}", piece.index, e);
        }
        outcome
    }

    async fn stream_into(
        &self,
        file: &mut File,
        piece: &mut DownloadPiece,
        response: Response,
        end: Option<u64>,
    ) -> Outcome {
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let reader = StreamReader::new(stream);
        tokio::pin!(reader);
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut progress = Progress::new(piece.cur_bytes, Instant::now());

        loop {
            let read = tokio::select! {
                biased;
                _ = self.ctx.signal.stopped() => return Outcome::stopped(),
                read = reader.read(&mut buf) => read,
            };
            let mut n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    return Outcome::new(StatusCode::HttpDataError, "Transfer interrupted")
                        .with_cause(e)
                }
            };
            if let Some(end) = end {
                let remaining = end + 1 - piece.cur_bytes;
                n = n.min(usize::try_from(remaining).unwrap_or(usize::MAX));
                if n == 0 {
                    break;
                }
            }

            if let Err(e) = file.write_all(&buf[..n]).await {
                return Outcome::new(StatusCode::FileError, "Write failed").with_cause(e);
            }
            piece.cur_bytes += n as u64;

            let now = Instant::now();
            if progress.sample_speed(piece, now) {
                let _ = self.ctx.events.send(EngineEvent::PieceProgress {
                    id: piece.info_id,
                    index: piece.index,
                    cur_bytes: piece.cur_bytes,
                    speed: piece.speed,
                });
            }
            if progress.checkpoint_due(piece.cur_bytes, now) {
                if let Err(e) = file.sync_data().await {
                    return Outcome::new(StatusCode::FileError, "Sync failed").with_cause(e);
                }
                match self.persist(piece).await {
                    Ok(true) => progress.checkpointed(piece.cur_bytes, now),
                    Ok(false) => {
                        info!("Piece {} of {} was deleted", piece.index, piece.info_id);
                        return Outcome::stopped();
                    }
                    Err(outcome) => return outcome,
                }
            }

            if end.is_some_and(|end| piece.cur_bytes > end) {
                break;
            }
        }

        match end {
            Some(end) if piece.cur_bytes != end + 1 => Outcome::new(
                StatusCode::LengthMismatch,
                format!(
                    "Expected {} bytes, got {}",
                    end + 1 - self.ctx.info.piece_start(piece.index),
                    piece.cur_bytes - self.ctx.info.piece_start(piece.index)
                ),
            ),
            _ => Outcome::success(),
        }
    }

    /// Save the piece row; `Ok(false)` means the row no longer exists
    async fn persist(&self, piece: &DownloadPiece) -> Result<bool, Outcome> {
        self.ctx
            .db
            .update_piece(piece)
            .await
            .map(|rows| rows > 0)
            .map_err(|e| Outcome::new(StatusCode::UnknownError, "Cannot save piece").with_cause(e))
    }
}

/// Checkpoint and speed bookkeeping for one transfer
struct Progress {
    saved_bytes: u64,
    saved_at: Instant,
    sampled_bytes: u64,
    sampled_at: Instant,
}

impl Progress {
    fn new(cur_bytes: u64, now: Instant) -> Self {
        Self {
            saved_bytes: cur_bytes,
            saved_at: now,
            sampled_bytes: cur_bytes,
            sampled_at: now,
        }
    }

    /// Refresh the smoothed speed (3:1 old to new); true when a sample was taken
    fn sample_speed(&mut self, piece: &mut DownloadPiece, now: Instant) -> bool {
        let elapsed = now.duration_since(self.sampled_at);
        if elapsed <= SPEED_INTERVAL {
            return false;
        }
        let millis = (elapsed.as_millis() as u64).max(1);
        let sample = (piece.cur_bytes - self.sampled_bytes) * 1000 / millis;
        piece.speed = if piece.speed == 0 {
            sample
        } else {
            (piece.speed * 3 + sample) / 4
        };
        self.sampled_bytes = piece.cur_bytes;
        self.sampled_at = now;
        true
    }

    fn checkpoint_due(&self, cur_bytes: u64, now: Instant) -> bool {
        cur_bytes - self.saved_bytes > CHECKPOINT_BYTES
            && now.duration_since(self.saved_at) > CHECKPOINT_INTERVAL
    }

    fn checkpointed(&mut self, cur_bytes: u64, now: Instant) {
        self.saved_bytes = cur_bytes;
        self.saved_at = now;
    }
}

/// Request for the download's URL carrying its stored headers.
///
/// The stored ETag is returned separately instead of being sent.
pub fn base_request(info: &DownloadInfo, headers: &[DownloadHeader]) -> (FetchRequest, Option<String>) {
    let mut request = FetchRequest::new(info.url.clone());
    let mut etag = None;

    for header in headers {
        if header.name.eq_ignore_ascii_case("etag") {
            etag = Some(header.value.clone());
            continue;
        }
        if header.name.eq_ignore_ascii_case("referer") {
            request.referer = Some(header.value.clone());
            continue;
        }
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) {
            (Ok(name), Ok(value)) => {
                request.headers.insert(name, value);
            }
            _ => warn!("Skipping invalid header {:?} for {}", header.name, info.id),
        }
    }
    (request, etag)
}

/// Build the range request for a piece resuming at `cur_bytes`
pub fn build_request(
    info: &DownloadInfo,
    headers: &[DownloadHeader],
    cur_bytes: u64,
    start: u64,
    end: Option<u64>,
) -> FetchRequest {
    let (mut request, etag) = base_request(info, headers);

    request
        .headers
        .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    request
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));

    let range = match end {
        Some(end) => format!("bytes={}-{}", cur_bytes, end),
        None => format!("bytes={}-", cur_bytes),
    };
    if let Ok(value) = HeaderValue::from_str(&range) {
        request.headers.insert(RANGE, value);
    }

    if cur_bytes != start {
        if let Some(value) = etag.and_then(|tag| HeaderValue::from_str(&tag).ok()) {
            request.headers.insert(IF_MATCH, value);
        }
    }
    request
}

/// Whether the end of the body can be told apart from a dropped connection
pub fn end_detectable(version: Version, headers: &HeaderMap) -> bool {
    if version >= Version::HTTP_2 {
        return true;
    }
    let has = |name: HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    };
    headers.contains_key(CONTENT_LENGTH) || has(CONNECTION, "close") || has(TRANSFER_ENCODING, "chunked")
}

/// `Retry-After` as delta-seconds or an HTTP date, relative to `now`
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (date.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
