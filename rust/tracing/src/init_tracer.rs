use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::Registry;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFilterLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogFilterLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFilterLevel::Trace => f.write_str("trace"),
            LogFilterLevel::Debug => f.write_str("debug"),
            LogFilterLevel::Info => f.write_str("info"),
            LogFilterLevel::Warn => f.write_str("warn"),
            LogFilterLevel::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    pub crate_name: String,
    pub filter_level: LogFilterLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub filters: Vec<LogFilter>,
    #[serde(default)]
    pub format: LogFormat,
}

// Crate names use underscores; the compiler rewrites hyphens in targets.
const DEFAULT_CRATE_NAMES: &[&str] = &[
    "strata_cache",
    "strata_config",
    "strata_error",
    "strata_pipeline",
    "strata_system",
    "strata_tracing",
];

fn global_filter_directives(custom_filters: &[LogFilter]) -> String {
    let defaults = DEFAULT_CRATE_NAMES
        .iter()
        .map(|s| format!("{s}=debug"))
        .collect::<Vec<_>>();
    let custom = custom_filters
        .iter()
        .map(|f| format!("{}={}", f.crate_name, f.filter_level))
        .collect::<Vec<_>>();
    std::iter::once("error".to_string())
        .chain(defaults)
        .chain(custom)
        .collect::<Vec<_>>()
        .join(",")
}

/// Filter applied ahead of every other layer. `RUST_LOG` replaces the
/// computed directives when set.
pub fn init_global_filter_layer(
    custom_filters: &[LogFilter],
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let directives = global_filter_directives(custom_filters);
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or(directives)).boxed()
}

pub fn init_stdout_layer(format: &LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => fmt::layer().pretty().with_target(false).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    }
}

pub fn init_tracing(
    layers: Vec<Box<dyn Layer<Registry> + Send + Sync>>,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("Global tracing subscriber set");
    Ok(())
}

pub fn init_panic_tracing_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();

        let payload = if let Some(s) = payload.downcast_ref::<&str>() {
            Some(&**s)
        } else {
            payload.downcast_ref::<String>().map(|s| s.as_str())
        };

        tracing::error!(
            panic.payload = payload,
            panic.location = panic_info.location().map(|l| l.to_string()),
            panic.backtrace = tracing::field::display(std::backtrace::Backtrace::capture()),
            "A panic occurred"
        );

        prev_hook(panic_info);
    }));
}

/// Installs the filter and stdout layers plus the panic hook. Metrics go
/// through the `opentelemetry` global meter; hosts that want them exported
/// install their own meter provider.
pub fn init_stdout_tracing(
    config: &TracingConfig,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let layers = vec![
        init_global_filter_layer(&config.filters),
        init_stdout_layer(&config.format),
    ];
    init_tracing(layers)?;
    init_panic_tracing_hook();
    Ok(())
}
