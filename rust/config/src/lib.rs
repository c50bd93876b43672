pub mod helpers;
pub mod loader;
pub mod registry;

use async_trait::async_trait;
use strata_error::StrataError;

pub use loader::{load_from_path, ConfigError};

/// # Description
/// A trait for building a service out of its configuration section.
/// Services that need shared collaborators (for example the query cache that
/// every pipeline reuses) look them up in, or publish them to, the registry.
#[async_trait]
pub trait Configurable<T, E = Box<dyn StrataError>> {
    async fn try_from_config(config: &T, registry: &registry::Registry) -> Result<Self, E>
    where
        Self: Sized;
}
