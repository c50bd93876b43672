use std::collections::HashMap;
use std::fmt::Debug;

use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

use crate::types::{AggregationSpec, FieldRef, GroupBy, ResolvedAggregation};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum FieldResolutionError {
    #[error("Empty field name")]
    EmptyField,
    #[error("Invalid field path `{0}`")]
    InvalidPath(String),
    #[error("Unknown expression `{0}`")]
    UnknownExpression(String),
}

impl StrataError for FieldResolutionError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// Maps the field reference of a grouping level onto a record field path.
pub trait FieldResolver: Send + Sync + Debug {
    fn resolve_field(&self, spec: &AggregationSpec) -> Result<String, FieldResolutionError>;
}

/// Accepts plain field names and the expressions registered with
/// `with_expression`.
#[derive(Clone, Debug, Default)]
pub struct DeclaredFieldResolver {
    expressions: HashMap<String, String>,
}

impl DeclaredFieldResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expression(mut self, expression: impl Into<String>, field: impl Into<String>) -> Self {
        self.expressions.insert(expression.into(), field.into());
        self
    }

    fn check_path(path: &str) -> Result<String, FieldResolutionError> {
        if path.trim().is_empty() {
            return Err(FieldResolutionError::EmptyField);
        }
        if path.split('.').any(|segment| segment.trim().is_empty()) {
            return Err(FieldResolutionError::InvalidPath(path.to_string()));
        }
        Ok(path.to_string())
    }
}

impl FieldResolver for DeclaredFieldResolver {
    fn resolve_field(&self, spec: &AggregationSpec) -> Result<String, FieldResolutionError> {
        match &spec.field {
            FieldRef::Field(name) => Self::check_path(name),
            FieldRef::Expression(expression) => self
                .expressions
                .get(expression)
                .ok_or_else(|| FieldResolutionError::UnknownExpression(expression.clone()))
                .and_then(|field| Self::check_path(field)),
        }
    }
}

/// Resolves grouping levels cumulatively: each level groups by its own field
/// and the fields of every resolved level before it. A level whose field does
/// not resolve is dropped and contributes nothing to later levels.
pub fn resolve_cumulative(
    specs: &[AggregationSpec],
    resolver: &dyn FieldResolver,
) -> Vec<ResolvedAggregation> {
    let mut ordered: Vec<&AggregationSpec> = specs.iter().collect();
    ordered.sort_by_key(|spec| spec.level);

    let mut accumulated: Vec<String> = Vec::with_capacity(ordered.len());
    let mut resolved = Vec::with_capacity(ordered.len());
    for spec in ordered {
        let field = match resolver.resolve_field(spec) {
            Ok(field) => field,
            Err(e) => {
                tracing::warn!(level = spec.level, "Dropping aggregation level: {e}");
                continue;
            }
        };
        if accumulated.contains(&field) {
            tracing::warn!(
                level = spec.level,
                field = %field,
                "Field already grouped by an earlier level, key will repeat it"
            );
        }
        accumulated.push(field);

        let group_by = match accumulated.as_slice() {
            [single] => GroupBy::Single(single.clone()),
            fields => GroupBy::Composite(fields.to_vec()),
        };
        resolved.push(ResolvedAggregation {
            level: spec.level,
            group_by,
            aggregation_functions: spec.aggregation_functions.clone(),
            value_fields: spec.value_fields.clone(),
            sort_direction: spec.sort_direction,
        });
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fields(resolved: &[ResolvedAggregation]) -> Vec<Vec<String>> {
        resolved
            .iter()
            .map(|r| r.group_by.fields().to_vec())
            .collect()
    }

    #[test]
    fn levels_accumulate_their_fields() {
        let resolved = resolve_cumulative(
            &[
                AggregationSpec::new(3, "type"),
                AggregationSpec::new(1, "region"),
                AggregationSpec::new(2, "customer"),
            ],
            &DeclaredFieldResolver::new(),
        );
        assert_eq!(resolved[0].group_by, GroupBy::Single("region".to_string()));
        assert_eq!(
            fields(&resolved),
            vec![
                vec!["region".to_string()],
                vec!["region".to_string(), "customer".to_string()],
                vec![
                    "region".to_string(),
                    "customer".to_string(),
                    "type".to_string()
                ],
            ]
        );
    }

    #[test]
    fn sparse_levels_accumulate_by_order() {
        let resolved = resolve_cumulative(
            &[AggregationSpec::new(1, "region"), AggregationSpec::new(3, "type")],
            &DeclaredFieldResolver::new(),
        );
        assert_eq!(resolved[1].level, 3);
        assert_eq!(
            resolved[1].group_by,
            GroupBy::Composite(vec!["region".to_string(), "type".to_string()])
        );
    }

    #[test]
    fn unresolvable_levels_are_dropped_without_advancing() {
        let resolver = DeclaredFieldResolver::new().with_expression("upper(type)", "type");
        let resolved = resolve_cumulative(
            &[
                AggregationSpec::new(1, "region"),
                AggregationSpec::expression(2, "unknown(customer)"),
                AggregationSpec::expression(3, "upper(type)"),
            ],
            &resolver,
        );
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].level, 3);
        assert_eq!(
            resolved[1].group_by,
            GroupBy::Composite(vec!["region".to_string(), "type".to_string()])
        );
    }

    #[test]
    fn duplicate_fields_still_resolve() {
        let resolved = resolve_cumulative(
            &[AggregationSpec::new(1, "region"), AggregationSpec::new(2, "region")],
            &DeclaredFieldResolver::new(),
        );
        assert_eq!(
            resolved[1].group_by,
            GroupBy::Composite(vec!["region".to_string(), "region".to_string()])
        );
    }

    #[test]
    fn declared_resolver_rejects_malformed_paths() {
        let resolver = DeclaredFieldResolver::new();
        assert_eq!(
            resolver.resolve_field(&AggregationSpec::new(1, " ")),
            Err(FieldResolutionError::EmptyField)
        );
        assert_eq!(
            resolver.resolve_field(&AggregationSpec::new(1, "customer..region")),
            Err(FieldResolutionError::InvalidPath("customer..region".to_string()))
        );
        assert_eq!(
            resolver.resolve_field(&AggregationSpec::new(1, "customer.region")),
            Ok("customer.region".to_string())
        );
    }

    proptest! {
        #[test]
        fn resolved_levels_are_prefixes_of_the_resolvable_fields(
            levels in proptest::collection::vec((0_u32..20, any::<bool>()), 0..12)
        ) {
            // An empty field name never resolves.
            let specs: Vec<AggregationSpec> = levels
                .iter()
                .enumerate()
                .map(|(i, (level, ok))| {
                    AggregationSpec::new(*level, if *ok { format!("f{i}") } else { String::new() })
                })
                .collect();
            let resolved = resolve_cumulative(&specs, &DeclaredFieldResolver::new());

            let mut expected: Vec<&AggregationSpec> = specs.iter().collect();
            expected.sort_by_key(|spec| spec.level);
            let expected_fields: Vec<String> = expected
                .iter()
                .filter_map(|spec| match &spec.field {
                    FieldRef::Field(name) if !name.is_empty() => Some(name.clone()),
                    _ => None,
                })
                .collect();

            prop_assert_eq!(resolved.len(), expected_fields.len());
            for (i, level) in resolved.iter().enumerate() {
                prop_assert_eq!(level.group_by.fields(), &expected_fields[..=i]);
                prop_assert_eq!(matches!(level.group_by, GroupBy::Single(_)), i == 0);
                if i > 0 {
                    prop_assert!(resolved[i - 1].level <= level.level);
                }
            }
        }
    }
}
