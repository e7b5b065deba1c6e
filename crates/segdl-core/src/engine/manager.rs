//! Download engine - manages all downloads of a process
//!
//! This is the top-level orchestrator that:
//! - Hands downloads to the work scheduler and runs them when it says so
//! - Enforces the limit on concurrently running downloads
//! - Pauses, resumes, stops and deletes downloads
//! - Serializes parameter changes against execution
//! - Reacts to network and power condition changes
//!
//! Only the engine mutates the set of active downloads. The check for free
//! capacity and the insertion of a new coordinator happen under the same
//! write lock, and so does the check for a pending parameter change.

use crate::conditions::{Conditions, SystemState};
use crate::engine::backoff::{next_attempt_delay, Constraints};
use crate::engine::coordinator::{Coordinator, RunResult, Shared};
use crate::engine::fetcher::HttpFetcher;
use crate::engine::metadata::sanitize_file_name;
use crate::engine::persistence::DownloadDatabase;
use crate::engine::signal::{StopReason, StopSignal};
use crate::error::SegdlError;
use crate::queue::OverflowQueue;
use crate::scheduler::{work_tag, WorkRequest, WorkScheduler};
use crate::storage;
use chrono::Utc;
use parking_lot::Mutex;
use segdl_types::{
    ChangeableParams, DownloadHeader, DownloadInfo, EngineEvent, Settings, StatusCode,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Capacity of the event channel; slow subscribers miss older events
const EVENT_CAPACITY: usize = 1024;

/// A download to add
#[derive(Debug, Clone, Default)]
pub struct NewDownload {
    pub url: String,
    /// Defaults to the configured download directory
    pub dir_path: Option<PathBuf>,
    /// Discovered from the server when not given
    pub file_name: Option<String>,
    pub description: Option<String>,
    /// Defaults to the configured piece count
    pub num_pieces: Option<u32>,
    pub unmetered_only: bool,
    /// Extra request headers sent with every request
    pub headers: Vec<(String, String)>,
}

/// A running coordinator
struct ActiveDownload {
    signal: StopSignal,
    constraints: Constraints,
    /// Cancelled once the coordinator and its completion handling are done
    done: CancellationToken,
}

/// Process-wide download engine
pub struct Engine {
    shared: Shared,
    scheduler: Arc<dyn WorkScheduler>,
    active: RwLock<HashMap<Uuid, ActiveDownload>>,
    queue: OverflowQueue,
    /// Downloads under an exclusive parameter change
    changing: Mutex<HashSet<Uuid>>,
    /// Changes staged until the running coordinator exits
    pending_changes: Mutex<HashMap<Uuid, ChangeableParams>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled by [`Engine::shutdown`]; nothing starts or reschedules after
    closed: CancellationToken,
}

impl Engine {
    /// Create a new engine
    pub fn new(
        db: DownloadDatabase,
        settings: Settings,
        conditions: Conditions,
        scheduler: Arc<dyn WorkScheduler>,
    ) -> Result<Arc<Self>, SegdlError> {
        let fetcher = HttpFetcher::new(&settings)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new(Self {
            shared: Shared {
                db,
                fetcher,
                settings: Arc::new(parking_lot::RwLock::new(settings)),
                conditions,
                events,
            },
            scheduler,
            active: RwLock::new(HashMap::new()),
            queue: OverflowQueue::new(),
            changing: Mutex::new(HashSet::new()),
            pending_changes: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            closed: CancellationToken::new(),
        }))
    }

    /// Get the database reference
    pub fn db(&self) -> &DownloadDatabase {
        &self.shared.db
    }

    pub fn settings(&self) -> Settings {
        self.shared.settings.read().clone()
    }

    pub fn conditions(&self) -> &Conditions {
        &self.shared.conditions
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.active.read().await.contains_key(&id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub fn is_queued(&self, id: Uuid) -> bool {
        self.queue.contains(id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Add a download and schedule it
    pub async fn add_download(&self, new: NewDownload) -> Result<DownloadInfo, SegdlError> {
        let url = Url::parse(&new.url).map_err(|_| SegdlError::InvalidUrl(new.url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SegdlError::InvalidUrl(new.url));
        }

        let settings = self.settings();
        let dir_path = new
            .dir_path
            .unwrap_or_else(|| settings.default_download_path.clone());
        let file_name = new
            .file_name
            .map(|name| sanitize_file_name(&name))
            .unwrap_or_default();

        let mut info = DownloadInfo::new(url.to_string(), dir_path, file_name);
        info.description = new.description;
        info.num_pieces = new.num_pieces.unwrap_or(settings.default_pieces).max(1);
        info.unmetered_only = new.unmetered_only;

        let headers: Vec<_> = new
            .headers
            .into_iter()
            .map(|(name, value)| DownloadHeader::new(info.id, name, value))
            .collect();
        self.shared.db.add_info(&info, &headers).await?;

        info!("Added download {}: {}", info.id, info.url);
        self.shared.emit(EngineEvent::Added { id: info.id });
        self.schedule(info.id).await?;
        Ok(info)
    }

    /// Hand a download to the work scheduler with its delay and constraints
    pub async fn schedule(&self, id: Uuid) -> Result<(), SegdlError> {
        let info = self
            .shared
            .db
            .get_info(id)
            .await?
            .ok_or(SegdlError::NotFound(id))?;
        let settings = self.settings();

        let delay = {
            let mut rng = rand::rng();
            next_attempt_delay(&info, &settings, Utc::now(), &mut rng)
        };
        let constraints = Constraints::for_download(&info, &settings);
        debug!("Scheduling {} in {:?} with {:?}", id, delay, constraints);

        self.scheduler.enqueue(WorkRequest {
            tag: work_tag(id),
            id,
            delay,
            constraints,
        });
        Ok(())
    }

    /// Entry point for the scheduler: start the download unless it is
    /// already running, being changed, or the engine is at capacity.
    pub async fn run_download(self: &Arc<Self>, id: Uuid) -> Result<(), SegdlError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        let Some(info) = self.shared.db.get_info(id).await? else {
            debug!("Download {} vanished before it could start", id);
            return Ok(());
        };
        if !info.status_code.is_waiting() && info.status_code != StatusCode::Running {
            debug!("Not starting {} in status {}", id, info.status_code);
            return Ok(());
        }

        let settings = self.settings();
        let mut active = self.active.write().await;
        if active.contains_key(&id) {
            return Ok(());
        }
        if self.changing.lock().contains(&id) {
            debug!("Download {} is being changed, not starting", id);
            return Ok(());
        }
        if active.len() >= settings.max_active_downloads as usize {
            if self.queue.push(id) {
                info!("Download {} queued, {} already running", id, active.len());
            }
            return Ok(());
        }
        self.queue.remove(id);

        let signal = StopSignal::new();
        let done = CancellationToken::new();
        let coordinator = Coordinator::new(id, self.shared.clone(), signal.clone());
        let engine = Arc::clone(self);
        let finished = done.clone();
        tokio::spawn(async move {
            let result = coordinator.run().await;
            engine.on_finished(id, result).await;
            finished.cancel();
        });

        active.insert(
            id,
            ActiveDownload {
                signal,
                constraints: Constraints::for_download(&info, &settings),
                done,
            },
        );
        Ok(())
    }

    /// Drain ready ids from the scheduler until the channel closes
    pub async fn serve(self: Arc<Self>, mut ready: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(id) = ready.recv().await {
            if let Err(e) = self.run_download(id).await {
                warn!("Cannot start download {}: {}", id, e);
            }
        }
    }

    async fn on_finished(self: &Arc<Self>, id: Uuid, result: RunResult) {
        self.active.write().await.remove(&id);
        let closing = self.closed.is_cancelled();

        if !closing {
            if let Some(next) = self.queue.pop() {
                if let Err(e) = self.schedule(next).await {
                    warn!("Cannot start queued download {}: {}", next, e);
                }
            }
        }

        if result == RunResult::Finished(StatusCode::Success) {
            self.move_after_download(id).await;
        }

        // The coordinator may have settled before it saw the stop request
        let staged = self.pending_changes.lock().remove(&id);
        if let Some(params) = staged {
            self.apply_change(id, params).await;
            self.changing.lock().remove(&id);
        }

        let waiting = match self.shared.db.get_info(id).await {
            Ok(Some(info)) => info.status_code.is_waiting(),
            Ok(None) => false,
            Err(e) => {
                warn!("Cannot load {} after it finished: {}", id, e);
                false
            }
        };
        let reschedule = waiting && !closing;
        if reschedule {
            if let Err(e) = self.schedule(id).await {
                warn!("Cannot reschedule {}: {}", id, e);
            }
        }
        debug!("Download {} exited with {:?}, rescheduled: {}", id, result, reschedule);

        if self.active.read().await.is_empty() && self.queue.is_empty() {
            self.shared.emit(EngineEvent::Idle);
        }
    }

    async fn move_after_download(&self, id: Uuid) {
        let Some(target_dir) = self.settings().move_after_download_to else {
            return;
        };
        let mut info = match self.shared.db.get_info(id).await {
            Ok(Some(info)) => info,
            _ => return,
        };
        if info.dir_path == target_dir {
            return;
        }

        let target = target_dir.join(&info.file_name);
        match storage::move_file(&info.file_path(), &target).await {
            Ok(()) => {
                info!("Moved {} to {:?}", id, target);
                info.dir_path = target_dir;
                if let Err(e) = self.shared.db.update_info(&info).await {
                    warn!("Cannot save new location of {}: {}", id, e);
                }
            }
            Err(e) => warn!("Cannot move finished download {}: {}", id, e),
        }
    }

    // ========================================================================
    // User control
    // ========================================================================

    /// Pause a download, keeping its progress
    pub async fn pause(&self, id: Uuid) -> Result<(), SegdlError> {
        if let Some(active) = self.active.read().await.get(&id) {
            info!("Pausing download {}", id);
            active.signal.stop(StopReason::Paused);
            return Ok(());
        }
        self.set_idle_status(id, StatusCode::Paused, "Paused").await
    }

    /// Stop a download; it keeps its file and record
    pub async fn stop(&self, id: Uuid) -> Result<(), SegdlError> {
        if let Some(active) = self.active.read().await.get(&id) {
            info!("Stopping download {}", id);
            active.signal.stop(StopReason::Stopped);
            return Ok(());
        }
        self.set_idle_status(id, StatusCode::Stopped, "Stopped").await
    }

    /// Set the status of a download that is not running
    async fn set_idle_status(
        &self,
        id: Uuid,
        status: StatusCode,
        message: &str,
    ) -> Result<(), SegdlError> {
        let mut info = self
            .shared
            .db
            .get_info(id)
            .await?
            .ok_or(SegdlError::NotFound(id))?;
        if !info.status_code.is_waiting() && info.status_code != StatusCode::Paused {
            return Ok(());
        }

        self.scheduler.cancel(&work_tag(id));
        self.queue.remove(id);
        info.set_status(status, Some(message.to_string()));
        self.shared.db.update_info(&info).await?;
        self.shared.emit(EngineEvent::StatusChanged {
            id,
            status,
            message: info.status_msg.clone(),
        });
        Ok(())
    }

    /// Resume a paused, stopped or failed download.
    ///
    /// A failed download whose partial data cannot be validated against an
    /// ETag starts over from the first byte.
    pub async fn resume(&self, id: Uuid) -> Result<(), SegdlError> {
        if self.is_active(id).await {
            return Ok(());
        }
        let mut info = self
            .shared
            .db
            .get_info(id)
            .await?
            .ok_or(SegdlError::NotFound(id))?;

        match info.status_code {
            StatusCode::Success => return Ok(()),
            status if status.is_waiting() => {}
            status => {
                info!("Resuming download {} from {}", id, status);
                if status.is_error() {
                    info.num_failed = 0;
                    info.retry_after = None;
                }
                info.set_status(StatusCode::Pending, None);
                if status == StatusCode::CannotResume
                    || (status.is_error() && !self.has_etag(id).await?)
                {
                    info!("Download {} cannot continue where it left off", id);
                    self.start_over(&mut info).await?;
                }
                self.shared.db.update_info(&info).await?;
                self.shared.emit(EngineEvent::StatusChanged {
                    id,
                    status: StatusCode::Pending,
                    message: None,
                });
            }
        }
        self.schedule(id).await
    }

    /// Pause every running or waiting download
    pub async fn pause_all(&self) -> Result<(), SegdlError> {
        for info in self.shared.db.list_infos().await? {
            if self.is_active(info.id).await || info.status_code.is_waiting() {
                self.pause(info.id).await?;
            }
        }
        Ok(())
    }

    /// Resume every download that is not finished, including paused ones
    pub async fn resume_all(&self) -> Result<(), SegdlError> {
        for info in self.shared.db.list_infos().await? {
            if info.status_code.is_waiting() || info.status_code == StatusCode::Paused {
                self.resume(info.id).await?;
            }
        }
        Ok(())
    }

    /// Reschedule every waiting download; user-paused ones stay paused
    pub async fn resume_waiting(&self) -> Result<usize, SegdlError> {
        let mut count = 0;
        for info in self.shared.db.list_infos().await? {
            if info.status_code.is_waiting() && !self.is_active(info.id).await {
                self.schedule(info.id).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete a download, optionally together with its file
    pub async fn delete(&self, id: Uuid, with_file: bool) -> Result<(), SegdlError> {
        let info = self
            .shared
            .db
            .get_info(id)
            .await?
            .ok_or(SegdlError::NotFound(id))?;

        let done = self.active.read().await.get(&id).map(|active| {
            active.signal.stop(StopReason::Stopped);
            active.done.clone()
        });
        if let Some(done) = done {
            done.cancelled().await;
        }

        self.scheduler.cancel(&work_tag(id));
        self.queue.remove(id);
        self.changing.lock().remove(&id);
        self.pending_changes.lock().remove(&id);
        self.shared.db.delete_info(id).await?;

        if with_file && !info.file_name.is_empty() {
            storage::delete_file(&info.file_path()).await?;
        }

        info!("Deleted download {} (with file: {})", id, with_file);
        self.shared.emit(EngineEvent::Deleted { id });
        Ok(())
    }

    /// Re-schedule downloads left unfinished by a previous run
    pub async fn restore(&self) -> Result<usize, SegdlError> {
        let mut count = 0;
        for mut info in self.shared.db.list_infos().await? {
            if info.status_code == StatusCode::Running {
                info.set_status(StatusCode::Pending, None);
                self.shared.db.update_info(&info).await?;
            }
            if info.status_code.is_waiting() {
                self.schedule(info.id).await?;
                count += 1;
            }
        }
        info!("Restored {} downloads", count);
        Ok(count)
    }

    /// Stop everything; interrupted downloads are picked up by [`Engine::restore`]
    pub async fn shutdown(&self) {
        self.closed.cancel();
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        let done: Vec<_> = self
            .active
            .read()
            .await
            .values()
            .map(|active| {
                active.signal.stop(StopReason::Interrupted);
                active.done.clone()
            })
            .collect();
        for token in done {
            token.cancelled().await;
        }
    }

    // ========================================================================
    // Parameter changes
    // ========================================================================

    /// Change parameters of a download.
    ///
    /// A running download is stopped first and the change is applied once it
    /// has exited; it is then restarted. Move failures are reported through
    /// [`EngineEvent::ParamsApplied`] and do not undo the other changes.
    pub async fn change_params(
        &self,
        id: Uuid,
        params: ChangeableParams,
    ) -> Result<(), SegdlError> {
        if params.is_empty() {
            return Ok(());
        }
        if let Some(url) = &params.url {
            Url::parse(url).map_err(|_| SegdlError::InvalidUrl(url.clone()))?;
        }
        if self.shared.db.get_info(id).await?.is_none() {
            return Err(SegdlError::NotFound(id));
        }

        {
            let active = self.active.write().await;
            if !self.changing.lock().insert(id) {
                return Err(SegdlError::InvalidOperation(format!(
                    "Download {} is already being changed",
                    id
                )));
            }
            if let Some(running) = active.get(&id) {
                info!("Stopping {} to apply new parameters", id);
                self.pending_changes.lock().insert(id, params);
                running.signal.stop(StopReason::Reconfigure);
                return Ok(());
            }
        }

        self.apply_change(id, params).await;
        self.changing.lock().remove(&id);

        let waiting = matches!(
            self.shared.db.get_info(id).await?,
            Some(info) if info.status_code.is_waiting()
        );
        if waiting {
            self.schedule(id).await?;
        }
        Ok(())
    }

    async fn apply_change(&self, id: Uuid, params: ChangeableParams) {
        let error = match self.try_apply_change(id, params).await {
            Ok(move_error) => move_error,
            Err(e) => Some(e.to_string()),
        };
        if let Some(e) = &error {
            warn!("Change of {} incomplete: {}", id, e);
        }
        self.shared.emit(EngineEvent::ParamsApplied { id, error });
    }

    /// Apply `params`; returns the move error, if the file could not be moved
    async fn try_apply_change(
        &self,
        id: Uuid,
        params: ChangeableParams,
    ) -> Result<Option<String>, SegdlError> {
        let db = &self.shared.db;
        let mut info = db.get_info(id).await?.ok_or(SegdlError::NotFound(id))?;

        if let Some(description) = params.description {
            info.description = Some(description);
        }
        if let Some(unmetered_only) = params.unmetered_only {
            info.unmetered_only = unmetered_only;
        }
        if let Some(retry) = params.retry {
            info.retry = retry;
        }

        if let Some(url) = params.url.filter(|url| *url != info.url) {
            info!("Download {} now points to {}, starting over", id, url);
            info.url = url;
            info.num_failed = 0;
            info.retry_after = None;
            db.remove_header(id, "ETag").await?;
            if info.status_code != StatusCode::Paused {
                info.set_status(StatusCode::Pending, None);
            }
            self.start_over(&mut info).await?;
        }
        if let Some(num_pieces) = params.num_pieces {
            info.num_pieces = num_pieces.max(1);
            info.fit_num_pieces();
            db.replace_pieces(id, &info.make_pieces()).await?;
        }

        let mut move_error = None;
        let new_dir = params.dir_path.unwrap_or_else(|| info.dir_path.clone());
        let new_name = params
            .file_name
            .map(|name| sanitize_file_name(&name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| info.file_name.clone());
        if new_dir != info.dir_path || new_name != info.file_name {
            let target = new_dir.join(&new_name);
            let moved = if info.file_name.is_empty() {
                Ok(())
            } else {
                storage::move_file(&info.file_path(), &target).await
            };
            match moved {
                Ok(()) => {
                    info.dir_path = new_dir;
                    info.file_name = new_name;
                }
                Err(e) => move_error = Some(e.to_string()),
            }
        }

        db.update_info(&info).await?;
        Ok(move_error)
    }

    /// Forget the metadata and every downloaded byte so the next attempt
    /// reads the metadata again and fetches the whole file
    async fn start_over(&self, info: &mut DownloadInfo) -> Result<(), SegdlError> {
        info.has_metadata = false;
        info.total_bytes = None;
        info.partial_support = false;
        if !info.file_name.is_empty() {
            storage::truncate(&info.file_path(), 0).await?;
        }
        self.shared.db.replace_pieces(info.id, &info.make_pieces()).await
    }

    async fn has_etag(&self, id: Uuid) -> Result<bool, SegdlError> {
        let headers = self.shared.db.get_headers(id).await?;
        Ok(headers.iter().any(|h| h.name.eq_ignore_ascii_case("etag")))
    }

    // ========================================================================
    // Settings and conditions
    // ========================================================================

    /// Replace the settings and re-evaluate running downloads against them.
    ///
    /// Timeouts and the user agent apply to engines created afterwards.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), SegdlError> {
        *self.shared.settings.write() = settings;
        self.refresh_constraints().await;

        let state = self.shared.conditions.current();
        self.stop_unsatisfied(&state).await;
        self.resume_waiting().await?;
        Ok(())
    }

    /// Start reacting to network and power changes
    pub fn watch_conditions(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.shared.conditions.subscribe();
        let handle = tokio::spawn(async move {
            let mut previous = rx.borrow_and_update().clone();
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                engine.on_conditions_changed(&previous, &current).await;
                previous = current;
            }
        });

        if let Some(old) = self.watcher.lock().replace(handle) {
            old.abort();
        }
    }

    /// Tightened conditions stop downloads that no longer qualify; relaxed
    /// ones trigger a sweep over waiting downloads.
    pub async fn on_conditions_changed(&self, previous: &SystemState, current: &SystemState) {
        let settings = self.settings();
        let power_watched = settings.only_charging || settings.battery_control;

        self.stop_unsatisfied(current).await;

        if relaxed(previous, current, power_watched) {
            match self.resume_waiting().await {
                Ok(count) => debug!("Conditions relaxed, rescheduled {} downloads", count),
                Err(e) => warn!("Cannot reschedule waiting downloads: {}", e),
            }
        }
    }

    async fn stop_unsatisfied(&self, state: &SystemState) {
        for (id, active) in self.active.read().await.iter() {
            if !active.constraints.satisfied_by(state) {
                info!("Conditions for {} no longer hold, interrupting", id);
                active.signal.stop(StopReason::Interrupted);
            }
        }
    }

    async fn refresh_constraints(&self) {
        let settings = self.settings();
        let ids: Vec<Uuid> = self.active.read().await.keys().copied().collect();
        for id in ids {
            let Ok(Some(info)) = self.shared.db.get_info(id).await else {
                continue;
            };
            if let Some(active) = self.active.write().await.get_mut(&id) {
                active.constraints = Constraints::for_download(&info, &settings);
            }
        }
    }
}

/// Whether any watched condition got better
fn relaxed(previous: &SystemState, current: &SystemState, power_watched: bool) -> bool {
    let (p, c) = (&previous.network, &current.network);
    let network = (!p.connected && c.connected)
        || (p.metered && !c.metered)
        || (p.roaming && !c.roaming)
        || (c.connected && p.identity != c.identity);
    let power = power_watched
        && ((!previous.power.charging && current.power.charging)
            || (previous.power.battery_low && !current.power.battery_low));
    network || power
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingScheduler {
        requests: Mutex<Vec<WorkRequest>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl RecordingScheduler {
        fn scheduled(&self, id: Uuid) -> usize {
            self.requests.lock().iter().filter(|r| r.id == id).count()
        }
    }

    impl WorkScheduler for RecordingScheduler {
        fn enqueue(&self, work: WorkRequest) {
            self.requests.lock().push(work);
        }

        fn cancel(&self, tag: &str) {
            self.cancelled.lock().push(tag.to_string());
        }
    }

    async fn engine_with(settings: Settings) -> (Arc<Engine>, Arc<RecordingScheduler>) {
        let db = DownloadDatabase::in_memory().await.unwrap();
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = Engine::new(db, settings, Conditions::default(), scheduler.clone()).unwrap();
        (engine, scheduler)
    }

    /// Poll `$cond` until it holds or give up after five seconds
    macro_rules! eventually {
        ($cond:expr) => {{
            let mut reached = false;
            for _ in 0..500 {
                if $cond {
                    reached = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(reached, "not reached in time: {}", stringify!($cond));
        }};
    }

    async fn status_of(engine: &Engine, id: Uuid) -> StatusCode {
        engine.db().get_info(id).await.unwrap().unwrap().status_code
    }

    async fn set_status(engine: &Engine, id: Uuid, status: StatusCode) {
        let mut info = engine.db().get_info(id).await.unwrap().unwrap();
        info.set_status(status, None);
        engine.db().update_info(&info).await.unwrap();
    }

    /// A server whose responses take long enough to pause or change mid-flight
    async fn slow_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"slow\"")
                    .set_body_bytes(vec![0u8; 100])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        server
    }

    fn new_download(server: &MockServer, dir: &TempDir, name: &str) -> NewDownload {
        NewDownload {
            url: format!("{}/{}", server.uri(), name),
            dir_path: Some(dir.path().to_path_buf()),
            file_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_validates_and_schedules() {
        let (engine, scheduler) = engine_with(Settings::default()).await;
        let mut events = engine.subscribe();

        let err = engine
            .add_download(NewDownload {
                url: "ftp://example.com/x".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SegdlError::InvalidUrl(_)));

        let info = engine
            .add_download(NewDownload {
                url: "http://example.com/a.iso".to_string(),
                num_pieces: Some(4),
                unmetered_only: true,
                headers: vec![("X-Token".to_string(), "t".to_string())],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(info.num_pieces, 4);
        assert_eq!(info.file_name, "");
        assert_eq!(events.recv().await.unwrap(), EngineEvent::Added { id: info.id });

        let requests = scheduler.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tag, work_tag(info.id));
        assert_eq!(requests[0].delay, Duration::ZERO);
        assert_eq!(requests[0].constraints.network, segdl_types::NetworkType::Unmetered);

        let headers = engine.db().get_headers(info.id).await.unwrap();
        assert_eq!(headers.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_gate_queues_then_starts() {
        let server = slow_server().await;
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            max_active_downloads: 1,
            ..Settings::default()
        };
        let (engine, scheduler) = engine_with(settings).await;

        let a = engine.add_download(new_download(&server, &dir, "a")).await.unwrap();
        let b = engine.add_download(new_download(&server, &dir, "b")).await.unwrap();

        engine.run_download(a.id).await.unwrap();
        engine.run_download(b.id).await.unwrap();
        assert!(engine.is_active(a.id).await);
        assert!(!engine.is_active(b.id).await);
        assert!(engine.is_queued(b.id));
        assert_eq!(engine.active_count().await, 1);

        engine.pause(a.id).await.unwrap();
        eventually!(scheduler.scheduled(b.id) == 2);
        assert!(!engine.is_queued(b.id));
        assert_eq!(status_of(&engine, a.id).await, StatusCode::Paused);

        engine.run_download(b.id).await.unwrap();
        assert!(engine.is_active(b.id).await);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_keeps_progress() {
        let server = slow_server().await;
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine_with(Settings::default()).await;

        let info = engine.add_download(new_download(&server, &dir, "p")).await.unwrap();
        let mut stored = engine.db().get_info(info.id).await.unwrap().unwrap();
        stored.has_metadata = true;
        stored.total_bytes = Some(100);
        stored.partial_support = true;
        engine.db().update_info(&stored).await.unwrap();
        let mut piece = engine.db().get_piece(info.id, 0).await.unwrap().unwrap();
        piece.size = Some(100);
        piece.cur_bytes = 40;
        engine.db().update_piece(&piece).await.unwrap();

        engine.run_download(info.id).await.unwrap();
        eventually!(status_of(&engine, info.id).await == StatusCode::Running);
        engine.pause(info.id).await.unwrap();
        eventually!(!engine.is_active(info.id).await);

        assert_eq!(status_of(&engine, info.id).await, StatusCode::Paused);
        let piece = engine.db().get_piece(info.id, 0).await.unwrap().unwrap();
        assert_eq!(piece.cur_bytes, 40);
        assert_eq!(piece.status_code, StatusCode::Paused);

        // Paused downloads are not started by the scheduler
        engine.run_download(info.id).await.unwrap();
        assert!(!engine.is_active(info.id).await);
    }

    #[tokio::test]
    async fn test_delete_with_file() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (engine, scheduler) = engine_with(Settings::default()).await;
        let mut events = engine.subscribe();

        let info = engine.add_download(new_download(&server, &dir, "d.bin")).await.unwrap();
        std::fs::write(info.file_path(), b"partial").unwrap();

        engine.delete(info.id, true).await.unwrap();
        assert!(engine.db().get_info(info.id).await.unwrap().is_none());
        assert!(engine.db().get_pieces(info.id).await.unwrap().is_empty());
        assert!(!info.file_path().exists());
        assert!(scheduler.cancelled.lock().contains(&work_tag(info.id)));

        let mut deleted = false;
        while let Ok(event) = events.try_recv() {
            deleted |= event == EngineEvent::Deleted { id: info.id };
        }
        assert!(deleted);

        // Without the file option the file stays
        let info = engine.add_download(new_download(&server, &dir, "k.bin")).await.unwrap();
        std::fs::write(info.file_path(), b"keep").unwrap();
        engine.delete(info.id, false).await.unwrap();
        assert!(info.file_path().exists());
    }

    #[tokio::test]
    async fn test_change_params_moves_file() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine_with(Settings::default()).await;
        let mut events = engine.subscribe();

        let info = engine.add_download(new_download(&server, &dir, "old.bin")).await.unwrap();
        std::fs::write(info.file_path(), b"data").unwrap();
        std::fs::write(dir.path().join("taken.bin"), b"other").unwrap();

        engine
            .change_params(
                info.id,
                ChangeableParams {
                    description: Some("first".to_string()),
                    file_name: Some("new.bin".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let changed = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert_eq!(changed.file_name, "new.bin");
        assert_eq!(changed.description.as_deref(), Some("first"));
        assert_eq!(std::fs::read(changed.file_path()).unwrap(), b"data");

        // A collision keeps the file where it is but applies the rest
        engine
            .change_params(
                info.id,
                ChangeableParams {
                    description: Some("second".to_string()),
                    file_name: Some("taken.bin".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let changed = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert_eq!(changed.file_name, "new.bin");
        assert_eq!(changed.description.as_deref(), Some("second"));

        let mut results = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ParamsApplied { error, .. } = event {
                results.push(error.is_some());
            }
        }
        assert_eq!(results, vec![false, true]);
    }

    #[tokio::test]
    async fn test_change_while_running_restarts_from_scratch() {
        let server = slow_server().await;
        let dir = TempDir::new().unwrap();
        let (engine, scheduler) = engine_with(Settings::default()).await;

        let info = engine.add_download(new_download(&server, &dir, "r")).await.unwrap();
        engine.run_download(info.id).await.unwrap();
        eventually!(status_of(&engine, info.id).await == StatusCode::Running);

        let new_url = format!("{}/elsewhere", server.uri());
        engine
            .change_params(
                info.id,
                ChangeableParams {
                    url: Some(new_url.clone()),
                    num_pieces: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        eventually!(scheduler.scheduled(info.id) == 2);
        let changed = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert_eq!(changed.url, new_url);
        assert!(!changed.has_metadata);
        assert_eq!(changed.num_pieces, 1);
        assert_eq!(changed.status_code, StatusCode::Pending);
        assert!(!engine.changing.lock().contains(&info.id));

        let err = engine
            .change_params(
                info.id,
                ChangeableParams {
                    url: Some("not a url".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SegdlError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_restore_reschedules_unfinished() {
        let (engine, scheduler) = engine_with(Settings::default()).await;
        let mut ids = Vec::new();
        for status in [StatusCode::Running, StatusCode::Paused, StatusCode::WaitingToRetry] {
            let mut info = DownloadInfo::new(
                "http://example.com/f".to_string(),
                PathBuf::from("/tmp"),
                "f".to_string(),
            );
            info.status_code = status;
            engine.db().add_info(&info, &[]).await.unwrap();
            ids.push(info.id);
        }

        assert_eq!(engine.restore().await.unwrap(), 2);
        assert_eq!(status_of(&engine, ids[0]).await, StatusCode::Pending);
        assert_eq!(scheduler.scheduled(ids[0]), 1);
        assert_eq!(scheduler.scheduled(ids[1]), 0);
        assert_eq!(scheduler.scheduled(ids[2]), 1);
    }

    #[tokio::test]
    async fn test_tightened_conditions_interrupt_and_relaxed_resume() {
        let server = slow_server().await;
        let dir = TempDir::new().unwrap();
        let (engine, scheduler) = engine_with(Settings::default()).await;

        let mut new = new_download(&server, &dir, "c");
        new.unmetered_only = true;
        let info = engine.add_download(new).await.unwrap();
        engine.run_download(info.id).await.unwrap();

        let before = engine.conditions().current();
        let mut metered = before.clone();
        metered.network.metered = true;
        engine.on_conditions_changed(&before, &metered).await;
        eventually!(!engine.is_active(info.id).await);
        assert_eq!(status_of(&engine, info.id).await, StatusCode::Pending);

        // Handed back to the scheduler, which waits for an unmetered network
        eventually!(scheduler.scheduled(info.id) == 2);
        engine.on_conditions_changed(&metered, &before).await;
        assert_eq!(scheduler.scheduled(info.id), 3);
    }

    #[tokio::test]
    async fn test_conditions_relaxed_before_exit_still_reschedule() {
        let server = slow_server().await;
        let dir = TempDir::new().unwrap();
        let (engine, scheduler) = engine_with(Settings::default()).await;

        let mut new = new_download(&server, &dir, "q");
        new.unmetered_only = true;
        let info = engine.add_download(new).await.unwrap();
        engine.run_download(info.id).await.unwrap();

        let before = engine.conditions().current();
        let mut metered = before.clone();
        metered.network.metered = true;
        engine.on_conditions_changed(&before, &metered).await;
        engine.on_conditions_changed(&metered, &before).await;

        eventually!(!engine.is_active(info.id).await);
        eventually!(scheduler.scheduled(info.id) >= 2);
        assert_eq!(status_of(&engine, info.id).await, StatusCode::Pending);
    }

    #[tokio::test]
    async fn test_exit_reschedules_only_waiting_downloads() {
        let (engine, scheduler) = engine_with(Settings::default()).await;
        let info = engine
            .add_download(NewDownload {
                url: "http://example.com/x.bin".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        for reason in [StopReason::Interrupted, StopReason::Reconfigure] {
            let before = scheduler.scheduled(info.id);
            engine.on_finished(info.id, RunResult::Cancelled(reason)).await;
            assert_eq!(scheduler.scheduled(info.id), before + 1);
        }

        let before = scheduler.scheduled(info.id);
        set_status(&engine, info.id, StatusCode::Paused).await;
        engine.on_finished(info.id, RunResult::Cancelled(StopReason::Paused)).await;
        set_status(&engine, info.id, StatusCode::Upstream(404)).await;
        engine
            .on_finished(info.id, RunResult::Finished(StatusCode::Upstream(404)))
            .await;
        assert_eq!(scheduler.scheduled(info.id), before);

        // Nothing is rescheduled or started once the engine shuts down
        set_status(&engine, info.id, StatusCode::Pending).await;
        engine.shutdown().await;
        engine
            .on_finished(info.id, RunResult::Cancelled(StopReason::Interrupted))
            .await;
        assert_eq!(scheduler.scheduled(info.id), before);
        engine.run_download(info.id).await.unwrap();
        assert!(!engine.is_active(info.id).await);
    }

    #[tokio::test]
    async fn test_change_staged_as_download_settles_is_applied() {
        let server = slow_server().await;
        let dir = TempDir::new().unwrap();
        let (engine, scheduler) = engine_with(Settings::default()).await;

        let info = engine.add_download(new_download(&server, &dir, "s")).await.unwrap();
        set_status(&engine, info.id, StatusCode::WaitingToRetry).await;

        // Staged after the coordinator passed its last stop check
        engine.changing.lock().insert(info.id);
        engine.pending_changes.lock().insert(
            info.id,
            ChangeableParams {
                description: Some("late".to_string()),
                ..Default::default()
            },
        );
        let scheduled = scheduler.scheduled(info.id);
        engine
            .on_finished(info.id, RunResult::Finished(StatusCode::WaitingToRetry))
            .await;

        let changed = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert_eq!(changed.description.as_deref(), Some("late"));
        assert!(!engine.changing.lock().contains(&info.id));
        assert!(engine.pending_changes.lock().is_empty());
        assert_eq!(scheduler.scheduled(info.id), scheduled + 1);

        engine.run_download(info.id).await.unwrap();
        assert!(engine.is_active(info.id).await);
        engine
            .change_params(
                info.id,
                ChangeableParams {
                    description: Some("again".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.shutdown().await;

        let changed = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert_eq!(changed.description.as_deref(), Some("again"));
        assert!(!engine.changing.lock().contains(&info.id));
    }

    #[tokio::test]
    async fn test_resume_after_cannot_resume_starts_over() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine_with(Settings::default()).await;

        let mut new = new_download(&server, &dir, "u.bin");
        new.num_pieces = Some(1);
        let info = engine.add_download(new).await.unwrap();
        let mut stored = engine.db().get_info(info.id).await.unwrap().unwrap();
        stored.has_metadata = true;
        stored.total_bytes = Some(10);
        stored.partial_support = true;
        engine.db().update_info(&stored).await.unwrap();
        let mut piece = engine.db().get_piece(info.id, 0).await.unwrap().unwrap();
        piece.size = Some(10);
        piece.cur_bytes = 5;
        engine.db().update_piece(&piece).await.unwrap();
        std::fs::write(info.file_path(), b"abcde").unwrap();

        engine.run_download(info.id).await.unwrap();
        eventually!(!engine.is_active(info.id).await);
        assert_eq!(status_of(&engine, info.id).await, StatusCode::CannotResume);

        server.reset().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=0-9"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"v2\"")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;

        engine.resume(info.id).await.unwrap();
        let reset = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert!(!reset.has_metadata);
        assert_eq!(reset.status_code, StatusCode::Pending);
        assert_eq!(std::fs::metadata(info.file_path()).unwrap().len(), 0);
        let pieces = engine.db().get_pieces(info.id).await.unwrap();
        assert_eq!(pieces[0].cur_bytes, 0);

        engine.run_download(info.id).await.unwrap();
        eventually!(status_of(&engine, info.id).await == StatusCode::Success);
        assert_eq!(std::fs::read(info.file_path()).unwrap(), b"0123456789");

        for request in server.received_requests().await.unwrap() {
            assert!(!request.headers.contains_key("if-match"));
            if let Some(range) = request.headers.get("range") {
                assert_eq!(range, "bytes=0-9");
            }
        }
    }

    #[test]
    fn test_relaxed() {
        let base = SystemState::default();
        let mut offline = base.clone();
        offline.network.connected = false;
        assert!(relaxed(&offline, &base, false));
        assert!(!relaxed(&base, &offline, false));

        let mut charging = base.clone();
        charging.power.charging = true;
        assert!(!relaxed(&base, &charging, false));
        assert!(relaxed(&base, &charging, true));
    }

    #[tokio::test]
    async fn test_end_to_end_with_tokio_scheduler() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("Range"))
            .respond_with(ResponseTemplate::new(206).set_body_string("segmented"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"e2e\"")
                    .set_body_string("segmented"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let done_dir = TempDir::new().unwrap();
        let settings = Settings {
            move_after_download_to: Some(done_dir.path().to_path_buf()),
            ..Settings::default()
        };

        let db = DownloadDatabase::in_memory().await.unwrap();
        let conditions = Conditions::default();
        let (scheduler, ready) = TokioScheduler::new(conditions.clone());
        let engine = Engine::new(db, settings, conditions, Arc::new(scheduler)).unwrap();
        tokio::spawn(Arc::clone(&engine).serve(ready));
        let mut events = engine.subscribe();

        let info = engine
            .add_download(NewDownload {
                url: format!("{}/files/e2e.txt", server.uri()),
                dir_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            })
            .await
            .unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == EngineEvent::Idle {
                break;
            }
        }

        let finished = engine.db().get_info(info.id).await.unwrap().unwrap();
        assert_eq!(finished.status_code, StatusCode::Success);
        assert_eq!(finished.file_name, "e2e.txt");
        assert_eq!(finished.dir_path, done_dir.path());
        assert_eq!(std::fs::read(finished.file_path()).unwrap(), b"segmented");
    }
}
