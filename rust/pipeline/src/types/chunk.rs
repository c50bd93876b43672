use serde::Serialize;
use std::sync::Arc;

use super::Record;

/// An ordered page of records as emitted by the producer. The records are
/// shared with the query cache, never copied.
#[derive(Clone, Debug, Serialize)]
pub struct Chunk {
    pub chunk_index: u64,
    pub chunk_size: usize,
    /// Source offset of the first record.
    pub offset: u64,
    /// Records emitted by the producer up to and including this chunk.
    pub total_processed_so_far: u64,
    pub records: Arc<Vec<Record>>,
}

impl Chunk {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LevelGroupCount {
    pub level: u32,
    pub groups: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChunkMetadata {
    pub groups_per_level: Vec<LevelGroupCount>,
    /// Records of this chunk that hit a full aggregation table, summed over levels.
    pub records_rejected: u64,
    pub degraded_mode: bool,
    pub chunk_size: usize,
}

/// A chunk after aggregation, as delivered to consumers.
#[derive(Clone, Debug, Serialize)]
pub struct TransformedChunk {
    pub chunk: Chunk,
    pub metadata: ChunkMetadata,
}
