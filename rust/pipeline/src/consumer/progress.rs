use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::types::TransformedChunk;

/// Point-in-time progress of a consumer, for renderers polling it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub processed: u64,
    pub total: Option<u64>,
    pub percent_complete: Option<f64>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
}

#[derive(Debug)]
pub struct ProgressTracker {
    processed: u64,
    total: Option<u64>,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            processed: 0,
            total,
            started: Instant::now(),
        }
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    pub fn record(&mut self, records: u64) {
        self.processed += records;
    }

    pub fn observe(&mut self, chunk: &TransformedChunk) {
        self.record(chunk.chunk.len() as u64);
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Capped at 100, since totals are estimates.
    pub fn percent_complete(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.processed as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }

    /// Extrapolates the rate observed so far.
    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        let total = self.total?;
        if self.processed == 0 {
            return None;
        }
        let remaining = total.saturating_sub(self.processed);
        let ratio = remaining as f64 / self.processed as f64;
        Duration::try_from_secs_f64(self.elapsed().as_secs_f64() * ratio).ok()
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            processed: self.processed,
            total: self.total,
            percent_complete: self.percent_complete(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            estimated_remaining_ms: self
                .estimated_time_remaining()
                .map(|remaining| remaining.as_millis() as u64),
        }
    }
}
