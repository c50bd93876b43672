use crate::types::{Chunk, Record};

/// Regroups the records of incoming chunks into batches of `batch_size`.
#[derive(Debug)]
pub struct RecordBuffer {
    batch_size: usize,
    pending: Vec<Record>,
}

impl RecordBuffer {
    /// A zero batch size is treated as one.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Adds one record, returning a batch when it completes one.
    pub fn push(&mut self, record: Record) -> Option<Vec<Record>> {
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.batch_size),
            ))
        } else {
            None
        }
    }

    /// Adds every record of `chunk`, returning the batches it completed.
    pub fn push_chunk(&mut self, chunk: &Chunk) -> Vec<Vec<Record>> {
        chunk
            .records()
            .iter()
            .filter_map(|record| self.push(record.clone()))
            .collect()
    }

    /// The remaining partial batch, at the end of the stream.
    pub fn flush(&mut self) -> Option<Vec<Record>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(ids: std::ops::Range<i64>) -> Chunk {
        let records: Vec<Record> = ids.map(|id| Record::new().with("id", id)).collect();
        Chunk {
            chunk_index: 0,
            chunk_size: records.len(),
            offset: 0,
            total_processed_so_far: records.len() as u64,
            records: Arc::new(records),
        }
    }

    #[test]
    fn batches_span_chunk_boundaries() {
        let mut buffer = RecordBuffer::new(3);
        assert!(buffer.push_chunk(&chunk(0..2)).is_empty());
        let batches = buffer.push_chunk(&chunk(2..7));
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3]);
        assert_eq!(batches[1][0].get("id"), Some(&crate::types::Value::Int(3)));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.flush().map(|b| b.len()), Some(1));
        assert!(buffer.flush().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn zero_batch_size_yields_single_records() {
        let mut buffer = RecordBuffer::new(0);
        assert_eq!(buffer.push(Record::new()).map(|b| b.len()), Some(1));
    }
}
