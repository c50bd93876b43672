use std::collections::{BTreeMap, HashMap};

use crate::types::{
    AggregationFunction, AggregationSnapshot, Chunk, FieldSummary, GroupKey, GroupSnapshot,
    LevelGroupCount, LevelSnapshot, Number, Record, ResolvedAggregation, SortDirection, Value,
};

/// Integer inputs are summed exactly; floats go to a separate sum that is
/// only mixed in when reporting.
#[derive(Clone, Debug)]
struct FieldAccumulator {
    int_sum: i128,
    float_sum: f64,
    saw_float: bool,
    count: u64,
    min: f64,
    max: f64,
}

impl Default for FieldAccumulator {
    fn default() -> Self {
        Self {
            int_sum: 0,
            float_sum: 0.0,
            saw_float: false,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl FieldAccumulator {
    /// Missing and non-numeric values do not count.
    fn add(&mut self, value: &Value) {
        let Some(numeric) = value.as_f64() else {
            return;
        };
        match value {
            Value::Int(i) => self.int_sum += i128::from(*i),
            _ => {
                self.float_sum += numeric;
                self.saw_float = true;
            }
        }
        self.count += 1;
        self.min = self.min.min(numeric);
        self.max = self.max.max(numeric);
    }

    fn sum(&self) -> Number {
        if self.saw_float {
            Number::Float(self.int_sum as f64 + self.float_sum)
        } else {
            Number::Int(self.int_sum)
        }
    }

    fn summary(&self, spec: &ResolvedAggregation) -> FieldSummary {
        let seen = self.count > 0;
        FieldSummary {
            sum: spec.computes(AggregationFunction::Sum).then(|| self.sum()),
            count: spec.computes(AggregationFunction::Count).then_some(self.count),
            avg: (spec.computes(AggregationFunction::Avg) && seen)
                .then(|| self.sum().as_f64() / self.count as f64),
            min: (spec.computes(AggregationFunction::Min) && seen).then_some(self.min),
            max: (spec.computes(AggregationFunction::Max) && seen).then_some(self.max),
        }
    }
}

/// Running aggregates of one group. `fields` follows the order of the
/// level's value fields.
#[derive(Clone, Debug)]
struct GroupAccumulator {
    record_count: u64,
    fields: Vec<FieldAccumulator>,
}

impl GroupAccumulator {
    fn new(value_fields: usize) -> Self {
        Self {
            record_count: 0,
            fields: vec![FieldAccumulator::default(); value_fields],
        }
    }

    fn add(&mut self, spec: &ResolvedAggregation, record: &Record) {
        self.record_count += 1;
        for (field, accumulator) in spec.value_fields.iter().zip(self.fields.iter_mut()) {
            if let Some(value) = record.get_path(field) {
                accumulator.add(value);
            }
        }
    }
}

/// The groups of one aggregation level, bounded to `max_groups` keys.
#[derive(Debug)]
struct GroupTable {
    spec: ResolvedAggregation,
    groups: HashMap<GroupKey, GroupAccumulator>,
    max_groups: usize,
    rejected_records: u64,
    warned_at_capacity: bool,
    estimated_bytes: usize,
}

impl GroupTable {
    fn new(spec: ResolvedAggregation, max_groups: usize) -> Self {
        Self {
            spec,
            groups: HashMap::new(),
            max_groups,
            rejected_records: 0,
            warned_at_capacity: false,
            estimated_bytes: 0,
        }
    }

    fn group_bytes(&self, key: &GroupKey) -> usize {
        key.estimated_bytes()
            + std::mem::size_of::<GroupAccumulator>()
            + self.spec.value_fields.len() * std::mem::size_of::<FieldAccumulator>()
    }

    /// Returns false when the record's group is new and the table is full.
    fn add(&mut self, record: &Record) -> bool {
        let key = self.spec.key_for(record);
        if let Some(group) = self.groups.get_mut(&key) {
            group.add(&self.spec, record);
            return true;
        }
        if self.groups.len() >= self.max_groups {
            self.rejected_records += 1;
            if !self.warned_at_capacity {
                self.warned_at_capacity = true;
                tracing::warn!(
                    level = self.spec.level,
                    max_groups = self.max_groups,
                    "Aggregation table is full, records of new groups are rejected"
                );
            }
            return false;
        }
        self.estimated_bytes += self.group_bytes(&key);
        let mut group = GroupAccumulator::new(self.spec.value_fields.len());
        group.add(&self.spec, record);
        self.groups.insert(key, group);
        true
    }

    fn snapshot(&self) -> LevelSnapshot {
        let mut groups: Vec<GroupSnapshot> = self
            .groups
            .iter()
            .map(|(key, group)| GroupSnapshot {
                key: key.clone(),
                record_count: group.record_count,
                values: self
                    .spec
                    .value_fields
                    .iter()
                    .zip(group.fields.iter())
                    .map(|(field, accumulator)| (field.clone(), accumulator.summary(&self.spec)))
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect();
        match self.spec.sort_direction {
            SortDirection::Asc => groups.sort_by(|a, b| a.key.cmp(&b.key)),
            SortDirection::Desc => groups.sort_by(|a, b| b.key.cmp(&a.key)),
        }
        LevelSnapshot {
            level: self.spec.level,
            group_by: self.spec.group_by.clone(),
            group_count: groups.len(),
            groups,
            rejected_records: self.rejected_records,
            at_capacity: self.groups.len() >= self.max_groups,
        }
    }
}

/// What consuming one chunk did to the tables.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ChunkEffect {
    pub(crate) groups_per_level: Vec<LevelGroupCount>,
    pub(crate) records_rejected: u64,
}

/// Cumulative grouped aggregation over every chunk of a pipeline.
#[derive(Debug)]
pub(crate) struct Aggregator {
    tables: Vec<GroupTable>,
    records_aggregated: u64,
    chunks_aggregated: u64,
}

impl Aggregator {
    pub(crate) fn new(specs: Vec<ResolvedAggregation>, max_groups: usize) -> Self {
        Self {
            tables: specs
                .into_iter()
                .map(|spec| GroupTable::new(spec, max_groups))
                .collect(),
            records_aggregated: 0,
            chunks_aggregated: 0,
        }
    }

    pub(crate) fn consume(&mut self, chunk: &Chunk) -> ChunkEffect {
        let mut records_rejected = 0;
        for record in chunk.records() {
            for table in &mut self.tables {
                if !table.add(record) {
                    records_rejected += 1;
                }
            }
        }
        self.records_aggregated += chunk.len() as u64;
        self.chunks_aggregated += 1;
        ChunkEffect {
            groups_per_level: self
                .tables
                .iter()
                .map(|table| LevelGroupCount {
                    level: table.spec.level,
                    groups: table.groups.len(),
                })
                .collect(),
            records_rejected,
        }
    }

    pub(crate) fn snapshot(&self, finalized: bool) -> AggregationSnapshot {
        AggregationSnapshot {
            levels: self.tables.iter().map(GroupTable::snapshot).collect(),
            records_aggregated: self.records_aggregated,
            chunks_aggregated: self.chunks_aggregated,
            finalized,
        }
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        self.tables.iter().map(|table| table.estimated_bytes).sum()
    }
}
