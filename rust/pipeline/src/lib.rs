pub mod cache;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod execution;
pub mod loader;
pub mod orchestrator;
pub mod resolve;
pub mod source;
pub mod types;

use strata_config::registry::Registry;
use strata_config::Configurable;

pub use cache::{QueryCache, QueryFingerprint};
pub use config::{PipelineConfig, PipelineServiceConfig};
pub use consumer::{drive_consumer, ChunkConsumer};
pub use errors::{ConsumerError, PipelineError, SourceError};
pub use execution::{ChunkStream, ManualMemoryProbe, MemoryProbe};
pub use loader::{LoadStrategy, RelationshipLoadingConfig};
pub use orchestrator::{PipelineOptions, PipelineOrchestrator};
pub use resolve::{DeclaredFieldResolver, FieldResolver};
pub use source::{DataSource, InMemoryDataSource, Query};

/// Runs an orchestrator configured from `./strata_config.yaml` and the
/// environment until the process is interrupted. Embedders start pipelines
/// through the library API instead.
pub async fn pipeline_service_entrypoint() {
    let config = match PipelineServiceConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load pipeline service config: {err}");
            return;
        }
    };
    if let Err(err) = strata_tracing::init_stdout_tracing(&config.tracing) {
        eprintln!("Failed to initialize tracing: {err}");
    }

    let registry = Registry::new();
    let orchestrator = match PipelineOrchestrator::try_from_config(&config, &registry).await {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            tracing::error!("Failed to create pipeline orchestrator: {err}");
            return;
        }
    };
    tracing::info!(
        chunk_size = orchestrator.config().chunk_size,
        max_demand = orchestrator.config().max_demand,
        "Pipeline service ready"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
    }
    let counts = orchestrator.pipeline_counts();
    tracing::info!(active = counts.running + counts.paused, "Shutting down");
    orchestrator.shutdown().await;
}
