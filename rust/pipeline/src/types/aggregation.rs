use serde::{Deserialize, Serialize};

use super::{GroupKey, KeyValue, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggregationFunction {
    pub const ALL: [AggregationFunction; 5] = [
        AggregationFunction::Sum,
        AggregationFunction::Count,
        AggregationFunction::Avg,
        AggregationFunction::Min,
        AggregationFunction::Max,
    ];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// How a grouping level names its field: directly, or through an expression
/// that the field resolver maps to a field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRef {
    Field(String),
    Expression(String),
}

/// One declared grouping level, before cumulative resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub level: u32,
    pub field: FieldRef,
    #[serde(default)]
    pub aggregation_functions: Vec<AggregationFunction>,
    #[serde(default)]
    pub value_fields: Vec<String>,
    #[serde(default)]
    pub sort_direction: SortDirection,
}

impl AggregationSpec {
    /// A level grouping by `field`, computing every aggregation function.
    pub fn new(level: u32, field: impl Into<String>) -> Self {
        Self {
            level,
            field: FieldRef::Field(field.into()),
            aggregation_functions: AggregationFunction::ALL.to_vec(),
            value_fields: Vec::new(),
            sort_direction: SortDirection::Asc,
        }
    }

    pub fn expression(level: u32, expression: impl Into<String>) -> Self {
        Self {
            field: FieldRef::Expression(expression.into()),
            ..Self::new(level, String::new())
        }
    }

    pub fn with_value_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.value_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_functions(mut self, functions: &[AggregationFunction]) -> Self {
        self.aggregation_functions = functions.to_vec();
        self
    }

    pub fn sorted(mut self, direction: SortDirection) -> Self {
        self.sort_direction = direction;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GroupBy {
    Single(String),
    Composite(Vec<String>),
}

impl GroupBy {
    pub fn fields(&self) -> &[String] {
        match self {
            GroupBy::Single(field) => std::slice::from_ref(field),
            GroupBy::Composite(fields) => fields,
        }
    }
}

/// A grouping level after cumulative resolution: level `k` groups by the
/// fields of every resolved level up to and including `k`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolvedAggregation {
    pub level: u32,
    pub group_by: GroupBy,
    pub aggregation_functions: Vec<AggregationFunction>,
    pub value_fields: Vec<String>,
    pub sort_direction: SortDirection,
}

impl ResolvedAggregation {
    /// Missing fields contribute `KeyValue::Null` to the key.
    pub fn key_for(&self, record: &Record) -> GroupKey {
        match &self.group_by {
            GroupBy::Single(field) => GroupKey::Scalar(KeyValue::from_value(record.get_path(field))),
            GroupBy::Composite(fields) => GroupKey::Composite(
                fields
                    .iter()
                    .map(|field| KeyValue::from_value(record.get_path(field)))
                    .collect(),
            ),
        }
    }

    pub fn computes(&self, function: AggregationFunction) -> bool {
        self.aggregation_functions.contains(&function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(group_by: GroupBy) -> ResolvedAggregation {
        ResolvedAggregation {
            level: 1,
            group_by,
            aggregation_functions: vec![AggregationFunction::Sum],
            value_fields: vec!["amount".to_string()],
            sort_direction: SortDirection::Asc,
        }
    }

    #[test]
    fn single_field_produces_scalar_keys() {
        let record = Record::new().with("region", "West");
        let key = resolved(GroupBy::Single("region".to_string())).key_for(&record);
        assert_eq!(key, GroupKey::Scalar(KeyValue::from("West")));
    }

    #[test]
    fn composite_keys_keep_field_order_and_null_missing_fields() {
        let record = Record::new().with("customer", 2).with("region", "West");
        let key = resolved(GroupBy::Composite(vec![
            "region".to_string(),
            "customer".to_string(),
            "type".to_string(),
        ]))
        .key_for(&record);
        assert_eq!(
            key,
            GroupKey::Composite(vec![
                KeyValue::from("West"),
                KeyValue::Int(2),
                KeyValue::Null
            ])
        );
    }

    #[test]
    fn specs_deserialize_with_defaults() {
        let spec: AggregationSpec =
            serde_json::from_str(r#"{"level": 2, "field": {"expression": "upper(region)"}}"#)
                .expect("valid spec");
        assert_eq!(spec.field, FieldRef::Expression("upper(region)".to_string()));
        assert!(spec.aggregation_functions.is_empty());
        assert_eq!(spec.sort_direction, SortDirection::Asc);
    }
}
