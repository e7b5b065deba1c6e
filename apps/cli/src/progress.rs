//! Progress bar utilities for CLI downloads

use crate::output::format_speed;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use segdl_types::{DownloadInfo, DownloadPiece, EngineEvent, StatusCode};
use std::collections::HashMap;
use uuid::Uuid;

struct Tracked {
    bar: ProgressBar,
    info: DownloadInfo,
    /// Bytes done and speed per piece index
    pieces: HashMap<u32, (u64, u64)>,
}

impl Tracked {
    fn done(&self) -> u64 {
        self.pieces.values().map(|(done, _)| done).sum()
    }

    fn speed(&self) -> u64 {
        self.pieces.values().map(|(_, speed)| speed).sum()
    }
}

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, Tracked>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a download
    pub fn track(&mut self, info: &DownloadInfo) {
        let pb = self.multi.add(ProgressBar::new(info.total_bytes.unwrap_or(0)));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        pb.set_prefix(display_name(info));

        let tracked = Tracked {
            bar: pb,
            info: info.clone(),
            pieces: HashMap::new(),
        };
        self.bars.insert(info.id, tracked);
    }

    /// Whether the size of a tracked download is still unknown
    pub fn needs_refresh(&self, id: Uuid) -> bool {
        self.bars
            .get(&id)
            .map(|tracked| !tracked.info.has_metadata)
            .unwrap_or(false)
    }

    /// Pick up metadata discovered since the download was tracked
    pub fn refresh(&mut self, info: &DownloadInfo) {
        if let Some(tracked) = self.bars.get_mut(&info.id) {
            if let Some(total) = info.total_bytes {
                tracked.bar.set_length(total);
            }
            tracked.bar.set_prefix(display_name(info));
            tracked.info = info.clone();
        }
    }

    /// Start from the progress already stored for the pieces
    pub fn seed(&mut self, id: Uuid, pieces: &[DownloadPiece]) {
        if let Some(tracked) = self.bars.get_mut(&id) {
            for piece in pieces {
                let done = piece
                    .cur_bytes
                    .saturating_sub(tracked.info.piece_start(piece.index));
                tracked.pieces.insert(piece.index, (done, 0));
            }
            tracked.bar.set_position(tracked.done());
        }
    }

    /// Update a progress bar from an event
    pub fn handle_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::PieceProgress {
                id,
                index,
                cur_bytes,
                speed,
            } => {
                if let Some(tracked) = self.bars.get_mut(id) {
                    let done = cur_bytes.saturating_sub(tracked.info.piece_start(*index));
                    tracked.pieces.insert(*index, (done, *speed));
                    tracked.bar.set_position(tracked.done());
                    tracked.bar.set_message(format_speed(tracked.speed()));
                }
            }

            EngineEvent::StatusChanged {
                id,
                status,
                message,
            } => {
                if let Some(tracked) = self.bars.get(id) {
                    let pb = &tracked.bar;
                    match status {
                        StatusCode::Success => {
                            if let Some(total) = tracked.info.total_bytes {
                                pb.set_position(total);
                            }
                            pb.finish_with_message(format!(
                                "{} Download complete",
                                style("✓").green().bold()
                            ));
                        }
                        StatusCode::Paused => {
                            pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
                        }
                        StatusCode::Stopped => {
                            pb.abandon_with_message(format!("{} Stopped", style("○").dim()));
                        }
                        StatusCode::WaitingToRetry | StatusCode::WaitingForNetwork => {
                            pb.set_message(format!(
                                "{} {}",
                                style("↻").yellow(),
                                message.as_deref().unwrap_or("Waiting")
                            ));
                        }
                        status if status.is_error() => {
                            pb.abandon_with_message(format!(
                                "{} Failed: {}",
                                style("✗").red().bold(),
                                message.as_deref().unwrap_or("Unknown error")
                            ));
                        }
                        _ => {}
                    }
                }
            }

            EngineEvent::Deleted { id } => {
                if let Some(tracked) = self.bars.remove(id) {
                    tracked.bar.finish_and_clear();
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, tracked) in self.bars.drain() {
            if !tracked.bar.is_finished() {
                tracked.bar.abandon();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn display_name(info: &DownloadInfo) -> String {
    if info.file_name.is_empty() {
        info.url.clone()
    } else {
        info.file_name.clone()
    }
}
