//! Shared types for segdl
//!
//! This crate contains the data structures shared by the engine, the
//! persistence layer and the CLI: download records, byte-range pieces,
//! the status taxonomy, settings and engine events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Status Types
// ============================================================================

/// Status of a download or of one of its pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Pending,
    Running,
    WaitingToRetry,
    WaitingForNetwork,
    Paused,
    Stopped,
    Success,

    // Client-request errors
    BadRequest,
    MalformedUrl,
    CannotResume,
    InsufficientSpace,

    // Transport and server errors
    FileError,
    HttpDataError,
    LengthMismatch,
    UnhandledRedirect,
    UnhandledHttpCode,
    TooManyRedirects,
    TlsError,
    /// A raw HTTP status returned by the server
    Upstream(u16),
    UnknownError,
}

impl StatusCode {
    /// Whether the download will not make progress again without user action
    pub fn is_finished(&self) -> bool {
        matches!(self, StatusCode::Success | StatusCode::Stopped) || self.is_error()
    }

    /// Whether this status is one of the error family
    pub fn is_error(&self) -> bool {
        self.is_client_error() || self.is_server_error()
    }

    pub fn is_client_error(&self) -> bool {
        match self {
            StatusCode::BadRequest
            | StatusCode::MalformedUrl
            | StatusCode::CannotResume
            | StatusCode::InsufficientSpace => true,
            StatusCode::Upstream(code) => (400..500).contains(code),
            _ => false,
        }
    }

    pub fn is_server_error(&self) -> bool {
        match self {
            StatusCode::FileError
            | StatusCode::HttpDataError
            | StatusCode::LengthMismatch
            | StatusCode::UnhandledRedirect
            | StatusCode::UnhandledHttpCode
            | StatusCode::TooManyRedirects
            | StatusCode::TlsError
            | StatusCode::UnknownError => true,
            StatusCode::Upstream(code) => !(400..500).contains(code),
            _ => false,
        }
    }

    /// Whether the coordinator may schedule another attempt after this status
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::HttpDataError
                | StatusCode::FileError
                | StatusCode::Upstream(500)
                | StatusCode::Upstream(503)
        )
    }

    /// Whether the download is waiting to be (re)started by the scheduler
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            StatusCode::Pending | StatusCode::WaitingToRetry | StatusCode::WaitingForNetwork
        )
    }

    /// Rank used when several pieces end with different statuses.
    ///
    /// Higher wins. Pause and stop are handled before ranking.
    pub fn precedence(&self) -> u8 {
        match self {
            StatusCode::Paused => 7,
            StatusCode::Stopped => 6,
            StatusCode::WaitingForNetwork => 5,
            StatusCode::WaitingToRetry => 4,
            s if s.is_error() && !s.is_retryable() => 3,
            s if s.is_error() => 2,
            StatusCode::Pending | StatusCode::Running => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Pending => "pending",
            StatusCode::Running => "running",
            StatusCode::WaitingToRetry => "waiting_to_retry",
            StatusCode::WaitingForNetwork => "waiting_for_network",
            StatusCode::Paused => "paused",
            StatusCode::Stopped => "stopped",
            StatusCode::Success => "success",
            StatusCode::BadRequest => "bad_request",
            StatusCode::MalformedUrl => "malformed_url",
            StatusCode::CannotResume => "cannot_resume",
            StatusCode::InsufficientSpace => "insufficient_space",
            StatusCode::FileError => "file_error",
            StatusCode::HttpDataError => "http_data_error",
            StatusCode::LengthMismatch => "length_mismatch",
            StatusCode::UnhandledRedirect => "unhandled_redirect",
            StatusCode::UnhandledHttpCode => "unhandled_http_code",
            StatusCode::TooManyRedirects => "too_many_redirects",
            StatusCode::TlsError => "tls_error",
            StatusCode::Upstream(code) => return write!(f, "upstream_{}", code),
            StatusCode::UnknownError => "unknown_error",
        };
        f.write_str(s)
    }
}

impl FromStr for StatusCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "pending" => StatusCode::Pending,
            "running" => StatusCode::Running,
            "waiting_to_retry" => StatusCode::WaitingToRetry,
            "waiting_for_network" => StatusCode::WaitingForNetwork,
            "paused" => StatusCode::Paused,
            "stopped" => StatusCode::Stopped,
            "success" => StatusCode::Success,
            "bad_request" => StatusCode::BadRequest,
            "malformed_url" => StatusCode::MalformedUrl,
            "cannot_resume" => StatusCode::CannotResume,
            "insufficient_space" => StatusCode::InsufficientSpace,
            "file_error" => StatusCode::FileError,
            "http_data_error" => StatusCode::HttpDataError,
            "length_mismatch" => StatusCode::LengthMismatch,
            "unhandled_redirect" => StatusCode::UnhandledRedirect,
            "unhandled_http_code" => StatusCode::UnhandledHttpCode,
            "too_many_redirects" => StatusCode::TooManyRedirects,
            "tls_error" => StatusCode::TlsError,
            "unknown_error" => StatusCode::UnknownError,
            other => {
                let code = other
                    .strip_prefix("upstream_")
                    .and_then(|c| c.parse::<u16>().ok())
                    .ok_or_else(|| format!("Invalid status code: {}", other))?;
                StatusCode::Upstream(code)
            }
        };
        Ok(status)
    }
}

// ============================================================================
// Download Types
// ============================================================================

/// Represents a single download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: Uuid,
    pub url: String,
    pub dir_path: PathBuf,
    pub file_name: String,
    pub description: Option<String>,
    pub mime_type: String,
    /// `None` until the server reports a length
    pub total_bytes: Option<u64>,
    pub num_pieces: u32,
    pub status_code: StatusCode,
    pub status_msg: Option<String>,
    /// Server honors byte-range requests for this resource
    pub partial_support: bool,
    /// User allows automatic retries
    pub retry: bool,
    pub unmetered_only: bool,
    pub num_failed: u32,
    /// Server-advised delay before the next attempt, in milliseconds
    pub retry_after: Option<u64>,
    /// When the status was last set
    pub last_modify: DateTime<Utc>,
    pub date_added: DateTime<Utc>,
    /// A probe request has completed for the current URL
    pub has_metadata: bool,
}

impl DownloadInfo {
    pub fn new(url: String, dir_path: PathBuf, file_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url,
            dir_path,
            file_name,
            description: None,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            total_bytes: None,
            num_pieces: 1,
            status_code: StatusCode::Pending,
            status_msg: None,
            partial_support: false,
            retry: true,
            unmetered_only: false,
            num_failed: 0,
            retry_after: None,
            last_modify: now,
            date_added: now,
            has_metadata: false,
        }
    }

    /// Full path of the destination file
    pub fn file_path(&self) -> PathBuf {
        self.dir_path.join(&self.file_name)
    }

    /// Set the status and message, stamping `last_modify`
    pub fn set_status(&mut self, status: StatusCode, msg: Option<String>) {
        self.status_code = status;
        self.status_msg = msg;
        self.last_modify = Utc::now();
    }

    /// Clamp `num_pieces` to what the known size and range support allow
    pub fn fit_num_pieces(&mut self) {
        self.num_pieces = match self.total_bytes {
            Some(total) if self.partial_support && total > 0 => {
                let max = u32::try_from(total).unwrap_or(u32::MAX);
                self.num_pieces.clamp(1, max)
            }
            _ => 1,
        };
    }

    /// Nominal piece length (`totalBytes / numPieces`), if the size is known
    pub fn piece_length(&self) -> Option<u64> {
        self.total_bytes
            .map(|total| total / u64::from(self.num_pieces.max(1)))
    }

    /// Absolute file offset where the piece at `index` starts
    pub fn piece_start(&self, index: u32) -> u64 {
        self.piece_length()
            .map(|len| u64::from(index) * len)
            .unwrap_or(0)
    }

    /// Build the piece set for the current size and piece count.
    ///
    /// The last piece absorbs the remainder of the integer division.
    pub fn make_pieces(&self) -> Vec<DownloadPiece> {
        let count = self.num_pieces.max(1);
        let Some(total) = self.total_bytes else {
            return vec![DownloadPiece::new(self.id, 0, None)];
        };

        let len = total / u64::from(count);
        (0..count)
            .map(|index| {
                let size = if index == count - 1 {
                    total - u64::from(index) * len
                } else {
                    len
                };
                let mut piece = DownloadPiece::new(self.id, index, Some(size));
                piece.cur_bytes = u64::from(index) * len;
                piece
            })
            .collect()
    }
}

/// Generic MIME type reported when nothing better is known
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// One contiguous byte range of a download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadPiece {
    pub info_id: Uuid,
    pub index: u32,
    /// `None` only for a lone piece of unknown length
    pub size: Option<u64>,
    /// Absolute file offset of the next byte to write
    pub cur_bytes: u64,
    pub status_code: StatusCode,
    pub status_msg: Option<String>,
    pub num_failed: u32,
    /// Smoothed transfer speed in bytes per second
    pub speed: u64,
}

impl DownloadPiece {
    pub fn new(info_id: Uuid, index: u32, size: Option<u64>) -> Self {
        Self {
            info_id,
            index,
            size,
            cur_bytes: 0,
            status_code: StatusCode::Pending,
            status_msg: None,
            num_failed: 0,
            speed: 0,
        }
    }
}

/// A custom request header stored with a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHeader {
    pub info_id: Uuid,
    pub name: String,
    pub value: String,
}

impl DownloadHeader {
    pub fn new(info_id: Uuid, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            info_id,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Fields a user may change on an existing download
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeableParams {
    pub url: Option<String>,
    pub description: Option<String>,
    pub unmetered_only: Option<bool>,
    pub retry: Option<bool>,
    pub dir_path: Option<PathBuf>,
    pub file_name: Option<String>,
    pub num_pieces: Option<u32>,
}

impl ChangeableParams {
    pub fn is_empty(&self) -> bool {
        self == &ChangeableParams::default()
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Network a download is allowed to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Any,
    Unmetered,
    NotRoaming,
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_download_path: PathBuf,
    /// Maximum number of downloads running at once
    pub max_active_downloads: u32,
    pub default_pieces: u32,
    /// Maximum number of automatic retries for failed downloads
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds
    pub retry_base_delay_secs: u64,
    pub min_retry_after_secs: u64,
    pub max_retry_after_secs: u64,
    pub preallocate_disk_space: bool,
    pub delete_file_on_error: bool,
    pub unmetered_only: bool,
    pub enable_roaming: bool,
    pub only_charging: bool,
    pub battery_control: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: String,
    /// Move finished downloads into this directory
    pub move_after_download_to: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_download_path: dirs::download_dir()
                .map(|p| p.join("segdl"))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_active_downloads: 3,
            default_pieces: 1,
            max_retries: 5,
            retry_base_delay_secs: 30,
            min_retry_after_secs: 30,
            max_retry_after_secs: 24 * 60 * 60,
            preallocate_disk_space: true,
            delete_file_on_error: false,
            unmetered_only: false,
            enable_roaming: true,
            only_charging: false,
            battery_control: false,
            connect_timeout_secs: 20,
            read_timeout_secs: 20,
            user_agent: format!("segdl/{}", env!("CARGO_PKG_VERSION")),
            move_after_download_to: None,
        }
    }
}

impl Settings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn min_retry_after(&self) -> Duration {
        Duration::from_secs(self.min_retry_after_secs)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Added {
        id: Uuid,
    },
    StatusChanged {
        id: Uuid,
        status: StatusCode,
        message: Option<String>,
    },
    PieceProgress {
        id: Uuid,
        index: u32,
        cur_bytes: u64,
        speed: u64,
    },
    Finished {
        id: Uuid,
        status: StatusCode,
    },
    ParamsApplied {
        id: Uuid,
        error: Option<String>,
    },
    Deleted {
        id: Uuid,
    },
    /// No download is running any more
    Idle,
}
