use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SourceError;
use crate::loader::LoadSpec;
use crate::types::Record;

mod memory;

pub use memory::{FetchLogEntry, InMemoryDataSource};

/// Describes what to read from a data source. Maps are ordered so that equal
/// queries serialize, and therefore fingerprint, identically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub resource: String,
    /// Field path to the value it must equal.
    #[serde(default)]
    pub filters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub preload: LoadSpec,
}

impl Query {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(field.into());
        self
    }
}

/// An offset/limit paginated source of records.
#[async_trait]
pub trait DataSource: Send + Sync + Debug {
    /// Stable name of the source, part of every cache fingerprint.
    fn identity(&self) -> String;

    /// Returns up to `limit` records starting at `offset`. Fewer than `limit`
    /// records means the result set is exhausted.
    async fn fetch(
        &self,
        query: &Query,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Record>, SourceError>;

    async fn count(&self, query: &Query) -> Result<u64, SourceError>;
}
