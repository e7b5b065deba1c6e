//! Download coordinator - runs one attempt of one download
//!
//! The coordinator discovers metadata on the first attempt, prepares the
//! destination file, runs one [`PieceWorker`] per piece, waits for all of
//! them and turns their outcomes into the download's next status. It is the
//! only writer of the download row while it runs.

use crate::conditions::{Conditions, NetworkState};
use crate::engine::fetcher::HttpFetcher;
use crate::engine::metadata::{self, FALLBACK_FILE_NAME};
use crate::engine::persistence::DownloadDatabase;
use crate::engine::piece_worker::{base_request, PieceContext, PieceWorker};
use crate::engine::signal::{StopReason, StopSignal};
use crate::outcome::Outcome;
use crate::storage;
use parking_lot::RwLock;
use segdl_types::{DownloadHeader, DownloadInfo, EngineEvent, Settings, StatusCode};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators shared by the engine and every coordinator
#[derive(Debug, Clone)]
pub struct Shared {
    pub db: DownloadDatabase,
    pub fetcher: HttpFetcher,
    pub settings: Arc<RwLock<Settings>>,
    pub conditions: Conditions,
    pub events: broadcast::Sender<EngineEvent>,
}

impl Shared {
    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Lifecycle state of a download as seen by its coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Pending,
    FetchingMetadata,
    Running,
    WaitingToRetry,
    WaitingForNetwork,
    Paused,
    Stopped,
    Success,
    Failed(StatusCode),
}

/// Inputs that move a [`CoordinatorState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Start { has_metadata: bool },
    MetadataReady,
    /// All pieces joined and the retry policy settled on a status
    Settled(StatusCode),
    Stop(StopReason),
    Rescheduled,
}

impl CoordinatorState {
    /// Transition table:
    ///
    /// | from                          | event              | to                         |
    /// |-------------------------------|--------------------|----------------------------|
    /// | Pending                       | Start (no meta)    | FetchingMetadata           |
    /// | Pending                       | Start (meta known) | Running                    |
    /// | FetchingMetadata              | MetadataReady      | Running                    |
    /// | FetchingMetadata, Running     | Settled(status)    | state for status           |
    /// | any non-terminal              | Stop(reason)       | Paused / Stopped / Pending |
    /// | WaitingToRetry, WaitingForNet | Rescheduled        | Pending                    |
    ///
    /// Anything else leaves the state unchanged.
    pub fn next(self, event: CoordinatorEvent) -> Self {
        use CoordinatorEvent as E;
        use CoordinatorState as S;

        match (self, event) {
            (S::Pending, E::Start { has_metadata: false }) => S::FetchingMetadata,
            (S::Pending, E::Start { has_metadata: true }) => S::Running,
            (S::FetchingMetadata, E::MetadataReady) => S::Running,
            (S::FetchingMetadata | S::Running, E::Settled(status)) => Self::from_status(status),
            (state, E::Stop(reason)) if !state.is_terminal() => Self::from_status(reason.status()),
            (S::WaitingToRetry | S::WaitingForNetwork, E::Rescheduled) => S::Pending,
            (state, event) => {
                debug!("Ignoring {:?} in state {:?}", event, state);
                state
            }
        }
    }

    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::Pending => CoordinatorState::Pending,
            StatusCode::Running => CoordinatorState::Running,
            StatusCode::WaitingToRetry => CoordinatorState::WaitingToRetry,
            StatusCode::WaitingForNetwork => CoordinatorState::WaitingForNetwork,
            StatusCode::Paused => CoordinatorState::Paused,
            StatusCode::Stopped => CoordinatorState::Stopped,
            StatusCode::Success => CoordinatorState::Success,
            error => CoordinatorState::Failed(error),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CoordinatorState::Pending => StatusCode::Pending,
            CoordinatorState::FetchingMetadata | CoordinatorState::Running => StatusCode::Running,
            CoordinatorState::WaitingToRetry => StatusCode::WaitingToRetry,
            CoordinatorState::WaitingForNetwork => StatusCode::WaitingForNetwork,
            CoordinatorState::Paused => StatusCode::Paused,
            CoordinatorState::Stopped => StatusCode::Stopped,
            CoordinatorState::Success => StatusCode::Success,
            CoordinatorState::Failed(status) => *status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Success | CoordinatorState::Stopped | CoordinatorState::Failed(_)
        )
    }
}

/// How a coordinator run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The attempt completed; the download was left with this status
    Finished(StatusCode),
    /// The stop signal fired before the attempt completed
    Cancelled(StopReason),
}

/// Runs one attempt of a download
pub struct Coordinator {
    id: Uuid,
    shared: Shared,
    signal: StopSignal,
}

impl Coordinator {
    pub fn new(id: Uuid, shared: Shared, signal: StopSignal) -> Self {
        Self { id, shared, signal }
    }

    pub async fn run(self) -> RunResult {
        let mut info = match self.shared.db.get_info(self.id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                info!("Download {} no longer exists", self.id);
                return RunResult::Cancelled(StopReason::Stopped);
            }
            Err(e) => {
                error!("Cannot load download {}: {}", self.id, e);
                return RunResult::Cancelled(StopReason::Stopped);
            }
        };
        if info.status_code == StatusCode::Success {
            return RunResult::Finished(StatusCode::Success);
        }

        let settings = self.shared.settings.read().clone();
        let network = self.shared.conditions.network();
        let mut state = CoordinatorState::Pending.next(CoordinatorEvent::Start {
            has_metadata: info.has_metadata,
        });

        info!(
            "Starting download {} ({} pieces, attempt {})",
            self.id,
            info.num_pieces,
            info.num_failed + 1
        );
        info.set_status(StatusCode::Running, None);
        self.save(&info).await;

        let outcome = self
            .attempt(&mut info, &mut state, &settings)
            .await
            .unwrap_or_else(|outcome| outcome);

        self.finish(info, state, outcome, &settings, &network).await
    }

    async fn attempt(
        &self,
        info: &mut DownloadInfo,
        state: &mut CoordinatorState,
        settings: &Settings,
    ) -> Result<Outcome, Outcome> {
        if *state == CoordinatorState::FetchingMetadata {
            self.fetch_metadata(info).await?;
            *state = state.next(CoordinatorEvent::MetadataReady);
        }

        if self.prepare_file(info, settings).await? {
            return Ok(Outcome::success());
        }
        self.ensure_pieces(info).await?;

        let outcomes = self.run_pieces(info).await?;
        self.aggregate(info, outcomes).await
    }

    async fn fetch_metadata(&self, info: &mut DownloadInfo) -> Result<(), Outcome> {
        let db = &self.shared.db;
        let headers = db.get_headers(self.id).await.map_err(db_outcome)?;
        let (request, _) = base_request(info, &headers);
        let metadata =
            metadata::discover(&self.shared.fetcher, &request, &self.signal).await?;

        if let Some(url) = &metadata.permanent_url {
            info!("Download {} moved permanently to {}", self.id, url);
            info.url = url.to_string();
        }
        info.total_bytes = metadata.total_bytes;
        info.partial_support = metadata.partial_support;
        info.mime_type = metadata.mime_type.clone();
        if info.file_name.is_empty() {
            info.file_name = storage::unique_name(&info.dir_path, &metadata.file_name);
        }

        match &metadata.etag {
            Some(tag) => db
                .set_header(&DownloadHeader::new(self.id, "ETag", tag.as_str()))
                .await
                .map_err(db_outcome)?,
            None => db.remove_header(self.id, "ETag").await.map_err(db_outcome)?,
        }
        if let Some(referer) = &metadata.referer {
            db.set_header(&DownloadHeader::new(self.id, "Referer", referer.as_str()))
                .await
                .map_err(db_outcome)?;
        }

        info.has_metadata = true;
        info.fit_num_pieces();
        db.replace_pieces(self.id, &info.make_pieces())
            .await
            .map_err(db_outcome)?;
        db.update_info(info).await.map_err(db_outcome)?;

        info!(
            "Download {}: size={:?} ranges={} pieces={} name={}",
            self.id, info.total_bytes, info.partial_support, info.num_pieces, info.file_name
        );
        Ok(())
    }

    /// Check free space and reserve the file. `Ok(true)` means there is
    /// nothing to transfer.
    async fn prepare_file(
        &self,
        info: &mut DownloadInfo,
        settings: &Settings,
    ) -> Result<bool, Outcome> {
        if info.file_name.is_empty() {
            info.file_name = storage::unique_name(&info.dir_path, FALLBACK_FILE_NAME);
        }
        let Some(total) = info.total_bytes else {
            return Ok(false);
        };
        let path = info.file_path();

        if total == 0 {
            storage::open_for_pieces(&path).await.map_err(file_outcome)?;
            storage::truncate(&path, 0).await.map_err(file_outcome)?;
            info!("Download {} is empty", self.id);
            return Ok(true);
        }

        let on_disk = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let needed = total.saturating_sub(on_disk);
        if let Some(dir) = storage::existing_ancestor(&info.dir_path) {
            match storage::free_space(dir) {
                Ok(free) if free < needed => {
                    return Err(Outcome::new(
                        StatusCode::InsufficientSpace,
                        format!("Need {} bytes, {} available", needed, free),
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!("Cannot query free space for {:?}: {}", dir, e),
            }
        }

        if settings.preallocate_disk_space {
            let reserved = match storage::open_for_pieces(&path).await {
                Ok(file) => storage::preallocate(&file, total).await,
                Err(e) => Err(e),
            };
            if let Err(e) = reserved {
                warn!("Preallocation for {} failed: {}", self.id, e);
            }
        }
        Ok(false)
    }

    /// Rebuild the piece set if it does not match the piece count
    async fn ensure_pieces(&self, info: &DownloadInfo) -> Result<(), Outcome> {
        let pieces = self.shared.db.get_pieces(self.id).await.map_err(db_outcome)?;
        if pieces.len() != info.num_pieces as usize {
            warn!(
                "Download {} has {} pieces, expected {}; rebuilding",
                self.id,
                pieces.len(),
                info.num_pieces
            );
            self.shared
                .db
                .replace_pieces(self.id, &info.make_pieces())
                .await
                .map_err(db_outcome)?;
        }
        Ok(())
    }

    async fn run_pieces(&self, info: &DownloadInfo) -> Result<Vec<(u32, Outcome)>, Outcome> {
        let headers = self.shared.db.get_headers(self.id).await.map_err(db_outcome)?;
        let ctx = PieceContext {
            info: Arc::new(info.clone()),
            headers: Arc::new(headers),
            db: self.shared.db.clone(),
            fetcher: self.shared.fetcher.clone(),
            signal: self.signal.clone(),
            events: self.shared.events.clone(),
        };

        let mut workers = JoinSet::new();
        for index in 0..info.num_pieces {
            let worker = PieceWorker::new(ctx.clone(), index);
            workers.spawn(async move { (index, worker.run().await) });
        }

        let mut outcomes = Vec::with_capacity(info.num_pieces as usize);
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => {
                    error!("Piece worker of {} crashed: {}", self.id, e);
                    outcomes.push((
                        u32::MAX,
                        Outcome::new(StatusCode::UnknownError, "Piece worker crashed").with_cause(e),
                    ));
                }
            }
        }
        Ok(outcomes)
    }

    async fn aggregate(
        &self,
        info: &mut DownloadInfo,
        outcomes: Vec<(u32, Outcome)>,
    ) -> Result<Outcome, Outcome> {
        if self.signal.is_stopped() {
            return Ok(Outcome::stopped());
        }

        let pieces = self.shared.db.get_pieces(self.id).await.map_err(db_outcome)?;
        if pieces.len() != info.num_pieces as usize {
            return Ok(Outcome::new(
                StatusCode::UnknownError,
                format!("Expected {} pieces, found {}", info.num_pieces, pieces.len()),
            ));
        }

        let outcome = dominant_outcome(outcomes);
        if outcome.status() == StatusCode::Success && info.total_bytes.is_none() {
            if let [piece] = pieces.as_slice() {
                info!("Download {} turned out to be {} bytes", self.id, piece.cur_bytes);
                info.total_bytes = Some(piece.cur_bytes);
                let mut piece = piece.clone();
                piece.size = Some(piece.cur_bytes);
                self.shared.db.update_piece(&piece).await.map_err(db_outcome)?;
            }
        }
        Ok(outcome)
    }

    async fn finish(
        &self,
        mut info: DownloadInfo,
        mut state: CoordinatorState,
        outcome: Outcome,
        settings: &Settings,
        network: &NetworkState,
    ) -> RunResult {
        if let Some(reason) = self.signal.reason() {
            state = state.next(CoordinatorEvent::Stop(reason));
            let message = match reason {
                StopReason::Paused => "Paused",
                StopReason::Stopped => "Stopped",
                StopReason::Interrupted => "Waiting for required conditions",
                StopReason::Reconfigure => "Restarting with new parameters",
            };
            info.set_status(state.status(), Some(message.to_string()));
            self.save(&info).await;
            info!("Download {} stopped: {:?}", self.id, reason);
            return RunResult::Cancelled(reason);
        }

        let (status, message) = self.retry_policy(&mut info, &outcome, settings, network).await;
        state = state.next(CoordinatorEvent::Settled(status));
        info.set_status(state.status(), message);
        self.save(&info).await;

        if matches!(state, CoordinatorState::Failed(_)) && settings.delete_file_on_error {
            if let Err(e) = storage::delete_file(&info.file_path()).await {
                warn!("Cannot delete partial file of {}: {}", self.id, e);
            }
            if let Err(e) = self.shared.db.replace_pieces(self.id, &info.make_pieces()).await {
                error!("Cannot reset pieces of {}: {}", self.id, e);
            }
        }

        info!("Download {} settled in {:?} ({})", self.id, state, outcome);
        self.shared.emit(EngineEvent::Finished {
            id: self.id,
            status: state.status(),
        });
        RunResult::Finished(state.status())
    }

    /// Decide between retrying and giving up; returns the status to persist
    async fn retry_policy(
        &self,
        info: &mut DownloadInfo,
        outcome: &Outcome,
        settings: &Settings,
        network: &NetworkState,
    ) -> (StatusCode, Option<String>) {
        let status = outcome.status();
        info.retry_after = None;

        if status == StatusCode::Success {
            info.num_failed = 0;
            return (status, None);
        }
        if !status.is_retryable() || !info.retry {
            return (status, outcome.describe());
        }

        info.num_failed += 1;
        if info.num_failed >= settings.max_retries {
            warn!(
                "Download {} failed {} times, giving up",
                self.id, info.num_failed
            );
            return (status, outcome.describe());
        }

        if info.partial_support && self.made_progress(info).await && !self.has_etag().await {
            return (
                StatusCode::CannotResume,
                Some("Cannot resume safely without an ETag".to_string()),
            );
        }

        if let Some(delay) = outcome.retry_after() {
            let clamped = delay
                .max(settings.min_retry_after())
                .min(settings.max_retry_after());
            info.retry_after = Some(clamped.as_millis() as u64);
        }

        let now = self.shared.conditions.network();
        let next = if now.connected && now.identity == network.identity {
            StatusCode::WaitingToRetry
        } else {
            StatusCode::WaitingForNetwork
        };
        debug!("Download {}: {} -> {}", self.id, status, next);
        (next, outcome.describe())
    }

    async fn made_progress(&self, info: &DownloadInfo) -> bool {
        match self.shared.db.get_pieces(self.id).await {
            Ok(pieces) => pieces
                .iter()
                .any(|p| p.cur_bytes > info.piece_start(p.index)),
            Err(_) => false,
        }
    }

    async fn has_etag(&self) -> bool {
        match self.shared.db.get_headers(self.id).await {
            Ok(headers) => headers.iter().any(|h| h.name.eq_ignore_ascii_case("etag")),
            Err(_) => false,
        }
    }

    async fn save(&self, info: &DownloadInfo) {
        if let Err(e) = self.shared.db.update_info(info).await {
            error!("Cannot save download {}: {}", self.id, e);
        }
        self.shared.emit(EngineEvent::StatusChanged {
            id: self.id,
            status: info.status_code,
            message: info.status_msg.clone(),
        });
    }
}

/// Pick the outcome that decides the download's status.
///
/// Higher [`StatusCode::precedence`] wins; among equals the lowest piece
/// index wins.
pub fn dominant_outcome(outcomes: Vec<(u32, Outcome)>) -> Outcome {
    outcomes
        .into_iter()
        .min_by(|(ia, a), (ib, b)| {
            b.status()
                .precedence()
                .cmp(&a.status().precedence())
                .then(ia.cmp(ib))
        })
        .map(|(_, outcome)| outcome)
        .unwrap_or_else(|| Outcome::new(StatusCode::UnknownError, "No piece ran"))
}

fn db_outcome(error: crate::error::SegdlError) -> Outcome {
    Outcome::new(StatusCode::UnknownError, "Database error").with_cause(error)
}

fn file_outcome(error: crate::error::SegdlError) -> Outcome {
    Outcome::new(StatusCode::FileError, "File error").with_cause(error)
}
