//! Decides which relationships a query preloads, and how deep.
//!
//! Relationships are dotted paths, `customer.region` being two hops away from
//! the root record. The functions here are pure, so one loader configuration is
//! shared by every pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

use crate::source::Query;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum LoaderError {
    #[error("Relationship `{path}` is {depth} hops deep, the limit is {max_depth}")]
    DepthExceeded {
        path: String,
        depth: usize,
        max_depth: usize,
    },
    #[error("Invalid relationship path `{0}`")]
    InvalidPath(String),
}

impl StrataError for LoaderError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Preload every declared relationship.
    Eager,
    /// Preload nothing.
    Lazy,
    /// Preload required relationships; attach optional ones only when the
    /// source has them at hand.
    #[default]
    Selective,
}

fn default_max_depth() -> usize {
    2
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipLoadingConfig {
    #[serde(default)]
    pub strategy: LoadStrategy,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl Default for RelationshipLoadingConfig {
    fn default() -> Self {
        Self {
            strategy: LoadStrategy::default(),
            max_depth: default_max_depth(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }
}

/// Ordered so that `max` picks the stronger request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    IfAvailable,
    Preload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadNode {
    pub mode: LoadMode,
    #[serde(default, skip_serializing_if = "LoadSpec::is_empty")]
    pub children: LoadSpec,
}

/// Tree of relationships to load, keyed by relationship name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadSpec {
    nodes: BTreeMap<String, LoadNode>,
}

fn split_path(path: &str) -> Result<Vec<&str>, LoaderError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(LoaderError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

impl LoadSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds `path` with `mode`. Every ancestor on the path is loaded at least
    /// as strongly, since a relationship cannot be attached to a parent that
    /// was not loaded.
    pub fn insert_path(&mut self, path: &str, mode: LoadMode) -> Result<(), LoaderError> {
        let segments = split_path(path)?;
        let mut nodes = &mut self.nodes;
        for segment in segments {
            let node = nodes.entry(segment.to_string()).or_insert(LoadNode {
                mode,
                children: LoadSpec::default(),
            });
            node.mode = node.mode.max(mode);
            nodes = &mut node.children.nodes;
        }
        Ok(())
    }

    /// Merges another spec into this one, keeping the stronger mode per path.
    /// A deserialized spec may carry malformed names, which are rejected.
    pub fn merge(&mut self, other: &LoadSpec) -> Result<(), LoaderError> {
        for (path, mode) in other.paths() {
            self.insert_path(&path, mode)?;
        }
        Ok(())
    }

    pub fn mode_of(&self, path: &str) -> Option<LoadMode> {
        let mut nodes = &self.nodes;
        let mut mode = None;
        for segment in path.split('.') {
            let node = nodes.get(segment)?;
            mode = Some(node.mode);
            nodes = &node.children.nodes;
        }
        mode
    }

    /// Every path in the tree with its mode, parents before children.
    pub fn paths(&self) -> Vec<(String, LoadMode)> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<(String, LoadMode)>) {
        for (name, node) in &self.nodes {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            out.push((path.clone(), node.mode));
            node.children.collect_paths(&path, out);
        }
    }

    /// Number of hops of the deepest path.
    pub fn depth(&self) -> usize {
        self.nodes
            .values()
            .map(|node| 1 + node.children.depth())
            .max()
            .unwrap_or(0)
    }
}

/// Builds a load spec from `(path, mode)` pairs, rejecting paths deeper than
/// `max_depth` rather than truncating them.
pub fn build_load_spec<I, S>(relationships: I, max_depth: usize) -> Result<LoadSpec, LoaderError>
where
    I: IntoIterator<Item = (S, LoadMode)>,
    S: AsRef<str>,
{
    let mut spec = LoadSpec::new();
    for (path, mode) in relationships {
        let path = path.as_ref();
        let depth = split_path(path)?.len();
        if depth > max_depth {
            return Err(LoaderError::DepthExceeded {
                path: path.to_string(),
                depth,
                max_depth,
            });
        }
        spec.insert_path(path, mode)?;
    }
    Ok(spec)
}

pub fn validate_depth(spec: &LoadSpec, max_depth: usize) -> Result<(), LoaderError> {
    match spec
        .paths()
        .into_iter()
        .map(|(path, _)| {
            let depth = path.split('.').count();
            (path, depth)
        })
        .find(|(_, depth)| *depth > max_depth)
    {
        Some((path, depth)) => Err(LoaderError::DepthExceeded {
            path,
            depth,
            max_depth,
        }),
        None => Ok(()),
    }
}

/// Returns `query` with its preload tree extended according to `config`.
/// Declared paths are validated under every strategy, so a bad relationship
/// graph fails even when nothing would be loaded.
pub fn apply_load_strategy(
    query: &Query,
    config: &RelationshipLoadingConfig,
) -> Result<Query, LoaderError> {
    let declared = build_load_spec(
        config
            .required
            .iter()
            .map(|path| (path, LoadMode::Preload))
            .chain(config.optional.iter().map(|path| (path, LoadMode::IfAvailable))),
        config.max_depth,
    )?;

    let requested = match config.strategy {
        LoadStrategy::Lazy => LoadSpec::new(),
        LoadStrategy::Selective => declared,
        LoadStrategy::Eager => build_load_spec(
            declared.paths().into_iter().map(|(path, _)| (path, LoadMode::Preload)),
            config.max_depth,
        )?,
    };

    // Rebuilding the caller's tree validates names that arrived deserialized.
    let mut preload = LoadSpec::new();
    preload.merge(&query.preload)?;
    preload.merge(&requested)?;
    let mut augmented = query.clone();
    augmented.preload = preload;
    validate_depth(&augmented.preload, config.max_depth)?;
    Ok(augmented)
}
