use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::tracker::PipelineTracker;

/// Reports the memory a pipeline is using, in bytes.
pub trait MemoryProbe: Send + Sync + Debug {
    fn used_bytes(&self) -> usize;
}

/// A probe whose reading is set by hand. Clones share the reading.
#[derive(Clone, Debug, Default)]
pub struct ManualMemoryProbe {
    used: Arc<AtomicUsize>,
}

impl ManualMemoryProbe {
    pub fn new(used: usize) -> Self {
        Self {
            used: Arc::new(AtomicUsize::new(used)),
        }
    }

    pub fn set(&self, used: usize) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn used_bytes(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// Default probe: the pipeline's own estimate of its aggregation state plus
/// the chunks that are emitted but not yet aggregated.
#[derive(Debug)]
pub(crate) struct AccountingMemoryProbe {
    tracker: Arc<PipelineTracker>,
}

impl AccountingMemoryProbe {
    pub(crate) fn new(tracker: Arc<PipelineTracker>) -> Self {
        Self { tracker }
    }
}

impl MemoryProbe for AccountingMemoryProbe {
    fn used_bytes(&self) -> usize {
        self.tracker.memory_bytes()
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum MemoryVerdict {
    Normal,
    Degraded { from: usize, to: usize },
    Exhausted { used: usize, limit: usize },
}

/// Picks the size of the next chunk from the memory in use. Sizes only
/// shrink: a degraded pipeline keeps its smaller chunks until it ends.
#[derive(Debug)]
pub(crate) struct ChunkSizer {
    current: usize,
    min: usize,
    threshold_bytes: usize,
    limit_bytes: usize,
    degraded: bool,
}

impl ChunkSizer {
    pub(crate) fn new(chunk_size: usize, min: usize, threshold_bytes: usize, limit_bytes: usize) -> Self {
        Self {
            current: chunk_size,
            min: min.min(chunk_size),
            threshold_bytes,
            limit_bytes,
            degraded: false,
        }
    }

    pub(crate) fn current(&self) -> usize {
        self.current
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub(crate) fn observe(&mut self, used: usize) -> MemoryVerdict {
        if used > self.limit_bytes && self.current <= self.min {
            return MemoryVerdict::Exhausted {
                used,
                limit: self.limit_bytes,
            };
        }
        if used > self.threshold_bytes {
            self.degraded = true;
            if self.current > self.min {
                let from = self.current;
                self.current = (self.current / 2).max(self.min);
                return MemoryVerdict::Degraded {
                    from,
                    to: self.current,
                };
            }
        }
        MemoryVerdict::Normal
    }
}
