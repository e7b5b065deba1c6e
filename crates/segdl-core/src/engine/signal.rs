//! Cooperative cancellation shared by a coordinator and its piece workers

use parking_lot::Mutex;
use segdl_types::StatusCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a running download was asked to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// User pause; progress is kept and the download is not rescheduled
    Paused,
    /// User stop; the download ends with a terminal status
    Stopped,
    /// Required network or power conditions no longer hold
    Interrupted,
    /// A parameter change is waiting for the download to exit
    Reconfigure,
}

impl StopReason {
    /// Status a download or piece is left in after stopping for this reason
    pub fn status(&self) -> StatusCode {
        match self {
            StopReason::Paused => StatusCode::Paused,
            StopReason::Stopped => StatusCode::Stopped,
            StopReason::Interrupted | StopReason::Reconfigure => StatusCode::Pending,
        }
    }
}

/// Cancellation token plus the reason of the first stop request
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first reason wins; later requests only re-cancel.
    pub fn stop(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Resolves once a stop was requested
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_first_reason_wins() {
        let signal = StopSignal::new();
        let worker = signal.clone();
        assert!(!worker.is_stopped());

        signal.stop(StopReason::Paused);
        signal.stop(StopReason::Stopped);

        worker.stopped().await;
        assert_eq!(worker.reason(), Some(StopReason::Paused));
    }

    #[test]
    fn test_stopped_wakes_waiters() {
        let signal = StopSignal::new();
        let mut waiter = task::spawn(signal.stopped());
        assert_pending!(waiter.poll());

        signal.stop(StopReason::Interrupted);
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert_eq!(signal.reason().map(|r| r.status()), Some(StatusCode::Pending));
    }
}
