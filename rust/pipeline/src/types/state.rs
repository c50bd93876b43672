use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::{GroupBy, GroupKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl StreamId {
    pub fn new() -> Self {
        StreamId(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Paused,
    Failed,
    Completed,
    Stopped,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Failed | PipelineStatus::Completed | PipelineStatus::Stopped
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Stopped => "stopped",
        })
    }
}

/// Point-in-time view of one pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineInfo {
    pub stream_id: StreamId,
    pub status: PipelineStatus,
    pub records_fetched: u64,
    pub records_aggregated: u64,
    pub chunks_emitted: u64,
    pub chunks_aggregated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub estimated_memory_bytes: usize,
    pub current_chunk_size: usize,
    pub degraded_mode: bool,
    pub retry_count: u64,
    pub last_retry_delay: Option<Duration>,
    pub estimated_total: Option<u64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineInfo {
    pub(crate) fn new(stream_id: StreamId, chunk_size: usize) -> Self {
        Self {
            stream_id,
            status: PipelineStatus::Running,
            records_fetched: 0,
            records_aggregated: 0,
            chunks_emitted: 0,
            chunks_aggregated: 0,
            cache_hits: 0,
            cache_misses: 0,
            estimated_memory_bytes: 0,
            current_chunk_size: chunk_size,
            degraded_mode: false,
            retry_count: 0,
            last_retry_delay: None,
            estimated_total: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Selects pipelines by status. The default filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct PipelineFilter {
    statuses: Option<HashSet<PipelineStatus>>,
}

impl PipelineFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: PipelineStatus) -> Self {
        self.statuses.get_or_insert_with(HashSet::new).insert(status);
        self
    }

    pub fn active() -> Self {
        Self::all()
            .with_status(PipelineStatus::Running)
            .with_status(PipelineStatus::Paused)
    }

    pub fn matches(&self, info: &PipelineInfo) -> bool {
        self.statuses
            .as_ref()
            .map(|statuses| statuses.contains(&info.status))
            .unwrap_or(true)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounts {
    pub running: usize,
    pub paused: usize,
    pub failed: usize,
    pub completed: usize,
    pub stopped: usize,
}

impl PipelineCounts {
    pub(crate) fn add(&mut self, status: PipelineStatus) {
        match status {
            PipelineStatus::Running => self.running += 1,
            PipelineStatus::Paused => self.paused += 1,
            PipelineStatus::Failed => self.failed += 1,
            PipelineStatus::Completed => self.completed += 1,
            PipelineStatus::Stopped => self.stopped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.running + self.paused + self.failed + self.completed + self.stopped
    }
}

/// A sum over a value field. It stays an exact integer until the first
/// float is added.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Number {
    Int(i128),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }
}

/// Aggregates of one value field within one group. Functions that were not
/// requested for the level are left out.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FieldSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupSnapshot {
    pub key: GroupKey,
    pub record_count: u64,
    pub values: BTreeMap<String, FieldSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LevelSnapshot {
    pub level: u32,
    pub group_by: GroupBy,
    pub groups: Vec<GroupSnapshot>,
    pub group_count: usize,
    pub rejected_records: u64,
    pub at_capacity: bool,
}

impl LevelSnapshot {
    pub fn group(&self, key: &GroupKey) -> Option<&GroupSnapshot> {
        self.groups.iter().find(|group| &group.key == key)
    }
}

/// Read-only copy of every aggregation table of a pipeline. `finalized` is
/// set only for the snapshot frozen after the producer finished.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregationSnapshot {
    pub levels: Vec<LevelSnapshot>,
    pub records_aggregated: u64,
    pub chunks_aggregated: u64,
    pub finalized: bool,
}

impl AggregationSnapshot {
    pub fn level(&self, level: u32) -> Option<&LevelSnapshot> {
        self.levels.iter().find(|l| l.level == level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_by_status() {
        let mut info = PipelineInfo::new(StreamId::new(), 10);
        assert!(PipelineFilter::all().matches(&info));
        assert!(PipelineFilter::active().matches(&info));
        info.status = PipelineStatus::Completed;
        assert!(!PipelineFilter::active().matches(&info));
        assert!(PipelineFilter::all()
            .with_status(PipelineStatus::Completed)
            .matches(&info));
    }

    #[test]
    fn field_summaries_omit_unrequested_functions() {
        let summary = FieldSummary {
            sum: Some(Number::Int(3)),
            count: Some(2),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&summary).expect("serializes"),
            r#"{"sum":3,"count":2}"#
        );
        let mixed = FieldSummary {
            sum: Some(Number::Float(2.5)),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&mixed).expect("serializes"),
            r#"{"sum":2.5}"#
        );
    }

    #[test]
    fn statuses_render_in_snake_case() {
        assert_eq!(PipelineStatus::Completed.to_string(), "completed");
        assert_eq!(
            serde_json::to_string(&PipelineStatus::Paused).expect("serializes"),
            r#""paused""#
        );
        assert!(PipelineStatus::Stopped.is_terminal());
        assert!(!PipelineStatus::Paused.is_terminal());
    }
}
