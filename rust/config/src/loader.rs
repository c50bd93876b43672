use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::de::DeserializeOwned;
use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error loading config: {0}")]
    Extract(#[from] Box<figment::Error>),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl StrataError for ConfigError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// # Description
/// Load a config object from a YAML file merged with prefixed environment variables.
/// # Notes
/// - The YAML file is optional; when it does not exist only the environment is used.
/// - Environment variables win over values in the file.
/// - Nested keys are separated with a double underscore, so
///   `STRATA_PIPELINE__CHUNK_SIZE` sets `pipeline.chunk_size`.
pub fn load_from_path<T>(path: &str, env_prefix: &str) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    // figment splits nested keys on '.', so map our double underscores onto it.
    let mut f = Figment::from(Env::prefixed(env_prefix).map(|k| k.as_str().replace("__", ".").into()));
    if std::path::Path::new(path).exists() {
        f = Figment::from(Yaml::file(path)).merge(f);
    }
    f.extract().map_err(|e| ConfigError::Extract(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serde::Deserialize;
    use serial_test::serial;

    #[derive(Debug, Deserialize)]
    struct Outer {
        inner: Inner,
        name: String,
    }

    #[derive(Debug, Deserialize)]
    struct Inner {
        size: usize,
        #[serde(default)]
        enabled: bool,
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sample.yaml",
                r#"
                name: "from-file"
                inner:
                    size: 10
                "#,
            )?;
            jail.set_env("SAMPLE_INNER__SIZE", "42");
            let loaded: Outer = load_from_path("sample.yaml", "SAMPLE_").expect("config loads");
            assert_eq!(loaded.name, "from-file");
            assert_eq!(loaded.inner.size, 42);
            assert!(!loaded.inner.enabled);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn missing_file_uses_environment_only() {
        Jail::expect_with(|jail| {
            jail.set_env("SAMPLE_NAME", "env-only");
            jail.set_env("SAMPLE_INNER__SIZE", "3");
            jail.set_env("SAMPLE_INNER__ENABLED", "true");
            let loaded: Outer = load_from_path("does-not-exist.yaml", "SAMPLE_").expect("config loads");
            assert_eq!(loaded.name, "env-only");
            assert_eq!(loaded.inner.size, 3);
            assert!(loaded.inner.enabled);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn missing_required_field_is_an_error() {
        Jail::expect_with(|jail| {
            jail.create_file("sample.yaml", "name: \"no-inner\"")?;
            let loaded: Result<Outer, _> = load_from_path("sample.yaml", "SAMPLE_");
            let err = loaded.expect_err("inner is required");
            assert_eq!(err.code(), ErrorCodes::InvalidArgument);
            Ok(())
        });
    }
}
