use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::types::{AggregationSnapshot, PipelineInfo, PipelineStatus, StreamId};

/// Shared record of one pipeline. The stages write progress into it, the
/// orchestrator reads it and drives the control transitions.
#[derive(Debug)]
pub(crate) struct PipelineTracker {
    info: Mutex<PipelineInfo>,
    snapshot: RwLock<Option<Arc<AggregationSnapshot>>>,
    released: AtomicBool,
    state_bytes: AtomicUsize,
    in_flight_bytes: AtomicUsize,
    status: watch::Sender<PipelineStatus>,
}

impl PipelineTracker {
    pub(crate) fn new(stream_id: StreamId, chunk_size: usize) -> Self {
        let (status, _) = watch::channel(PipelineStatus::Running);
        Self {
            info: Mutex::new(PipelineInfo::new(stream_id, chunk_size)),
            snapshot: RwLock::new(None),
            released: AtomicBool::new(false),
            state_bytes: AtomicUsize::new(0),
            in_flight_bytes: AtomicUsize::new(0),
            status,
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.info.lock().stream_id
    }

    pub(crate) fn info(&self) -> PipelineInfo {
        let mut info = self.info.lock().clone();
        info.estimated_memory_bytes = self.memory_bytes();
        info
    }

    pub(crate) fn status(&self) -> PipelineStatus {
        self.info.lock().status
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut PipelineInfo)) {
        f(&mut self.info.lock());
    }

    pub(crate) fn record_retry(&self, delay: Duration) {
        let mut info = self.info.lock();
        info.retry_count += 1;
        info.last_retry_delay = Some(delay);
    }

    /// Moves a non-terminal pipeline from one of `from` to `to`. Returns the
    /// current status when the move is not allowed.
    pub(crate) fn transition(
        &self,
        from: &[PipelineStatus],
        to: PipelineStatus,
    ) -> Result<(), PipelineStatus> {
        let mut info = self.info.lock();
        if info.status == to {
            return Ok(());
        }
        if !from.contains(&info.status) {
            return Err(info.status);
        }
        info.status = to;
        if to.is_terminal() {
            info.finished_at = Some(Utc::now());
        }
        self.status.send_replace(to);
        Ok(())
    }

    /// Records a terminal status. The first terminal status wins, except that
    /// a consumer failure may still turn `completed` into `failed`.
    pub(crate) fn finish(&self, status: PipelineStatus, error: Option<String>) -> bool {
        let mut info = self.info.lock();
        let allowed = !info.status.is_terminal()
            || (info.status == PipelineStatus::Completed && status == PipelineStatus::Failed);
        if !allowed {
            return false;
        }
        info.status = status;
        if error.is_some() {
            info.error = error;
        }
        info.finished_at = Some(Utc::now());
        self.status.send_replace(status);
        true
    }

    pub(crate) fn publish_snapshot(&self, snapshot: AggregationSnapshot) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        *self.snapshot.write() = Some(Arc::new(snapshot));
    }

    pub(crate) fn frozen_snapshot(&self) -> Option<Arc<AggregationSnapshot>> {
        self.snapshot.read().clone()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Drops everything but the lightweight pipeline record.
    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.snapshot.write().take();
        self.state_bytes.store(0, Ordering::SeqCst);
        self.in_flight_bytes.store(0, Ordering::SeqCst);
    }

    pub(crate) fn set_state_bytes(&self, bytes: usize) {
        self.state_bytes.store(bytes, Ordering::SeqCst);
    }

    pub(crate) fn add_in_flight(&self, bytes: usize) {
        self.in_flight_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn sub_in_flight(&self, bytes: usize) {
        let _ = self
            .in_flight_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub(crate) fn memory_bytes(&self) -> usize {
        self.state_bytes.load(Ordering::SeqCst) + self.in_flight_bytes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PipelineTracker {
        PipelineTracker::new(StreamId::new(), 100)
    }

    #[test]
    fn first_terminal_status_wins() {
        let tracker = tracker();
        assert!(tracker.finish(PipelineStatus::Stopped, None));
        assert!(!tracker.finish(PipelineStatus::Failed, Some("late".to_string())));
        let info = tracker.info();
        assert_eq!(info.status, PipelineStatus::Stopped);
        assert!(info.error.is_none());
        assert!(info.finished_at.is_some());
    }

    #[test]
    fn consumer_failures_override_completion() {
        let tracker = tracker();
        assert!(tracker.finish(PipelineStatus::Completed, None));
        assert!(tracker.finish(PipelineStatus::Failed, Some("sink broke".to_string())));
        assert_eq!(tracker.status(), PipelineStatus::Failed);
        assert_eq!(tracker.info().error.as_deref(), Some("sink broke"));
    }

    #[test]
    fn transitions_check_the_current_status() {
        let tracker = tracker();
        let mut status = tracker.subscribe();
        assert!(tracker
            .transition(&[PipelineStatus::Running], PipelineStatus::Paused)
            .is_ok());
        assert_eq!(*status.borrow_and_update(), PipelineStatus::Paused);
        // Already there.
        assert!(tracker
            .transition(&[PipelineStatus::Running], PipelineStatus::Paused)
            .is_ok());
        tracker.finish(PipelineStatus::Completed, None);
        assert_eq!(
            tracker.transition(&[PipelineStatus::Paused], PipelineStatus::Running),
            Err(PipelineStatus::Completed)
        );
    }

    #[test]
    fn memory_accounting_never_underflows() {
        let tracker = tracker();
        tracker.set_state_bytes(100);
        tracker.add_in_flight(50);
        tracker.sub_in_flight(80);
        assert_eq!(tracker.memory_bytes(), 100);
        tracker.release();
        assert_eq!(tracker.info().estimated_memory_bytes, 0);
        assert!(tracker.is_released());
    }
}
