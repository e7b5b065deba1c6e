//! Work scheduling - hands downloads to whatever decides when they may run
//!
//! The engine only computes an initial delay and the constraints for each
//! unit of work. Gating on network and power is the scheduler's job; the
//! in-process [`TokioScheduler`] does it by watching [`Conditions`].

use crate::conditions::Conditions;
use crate::engine::Constraints;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// A uniquely tagged unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub tag: String,
    pub id: Uuid,
    pub delay: Duration,
    pub constraints: Constraints,
}

/// Unique work tag for a download
pub fn work_tag(id: Uuid) -> String {
    format!("download:{}", id)
}

/// External work scheduler
pub trait WorkScheduler: Send + Sync {
    /// Enqueue `work`, replacing any pending work with the same tag
    fn enqueue(&self, work: WorkRequest);

    /// Cancel pending work with `tag`
    fn cancel(&self, tag: &str);
}

/// Scheduler that runs inside the tokio runtime.
///
/// Ready download ids are sent on the channel returned by [`TokioScheduler::new`];
/// the owner feeds them to `Engine::run_download`.
pub struct TokioScheduler {
    ready_tx: mpsc::UnboundedSender<Uuid>,
    conditions: Conditions,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(conditions: Conditions) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            ready_tx,
            conditions,
            pending: Mutex::new(HashMap::new()),
        };
        (scheduler, ready_rx)
    }

    /// Number of work items not yet handed out
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|_, handle| !handle.is_finished());
        pending.len()
    }
}

impl WorkScheduler for TokioScheduler {
    fn enqueue(&self, work: WorkRequest) {
        let tag = work.tag.clone();
        let ready_tx = self.ready_tx.clone();
        let mut conditions = self.conditions.subscribe();

        let handle = tokio::spawn(async move {
            if !work.delay.is_zero() {
                tokio::time::sleep(work.delay).await;
            }
            let constraints = work.constraints;
            if conditions
                .wait_for(|state| constraints.satisfied_by(state))
                .await
                .is_err()
            {
                return;
            }
            debug!("Work {} is ready", work.tag);
            let _ = ready_tx.send(work.id);
        });

        if let Some(previous) = self.pending.lock().insert(tag, handle) {
            previous.abort();
        }
    }

    fn cancel(&self, tag: &str) {
        if let Some(handle) = self.pending.lock().remove(tag) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }
}
