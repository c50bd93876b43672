use std::time::Duration;

use figment::Jail;
use serial_test::serial;
use strata_cache::CacheConfig;
use strata_config::ConfigError;
use strata_pipeline::{LoadStrategy, PipelineServiceConfig};
use strata_tracing::LogFormat;

#[test]
#[serial]
fn file_values_are_overridden_by_the_environment() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "strata_config.yaml",
            r#"
            pipeline:
                chunk_size: 250
                min_chunk_size: 50
                retry_base_delay_ms: 20
                max_demand: 2
                cache:
                    lru:
                        max_entries: 10
                        ttl_secs: 5
                relationship_loading:
                    strategy: eager
                    required: ["customer"]
            tracing:
                format: compact
            "#,
        )?;
        jail.set_env("STRATA_PIPELINE__MAX_DEMAND", "8");

        let config = PipelineServiceConfig::load().expect("config loads");
        let pipeline = &config.pipeline;
        assert_eq!(pipeline.chunk_size, 250);
        assert_eq!(pipeline.min_chunk_size, 50);
        assert_eq!(pipeline.max_demand, 8);
        assert_eq!(pipeline.retry_base_delay, Duration::from_millis(20));
        assert_eq!(pipeline.max_retries, 3);
        match &pipeline.cache {
            CacheConfig::Lru(lru) => {
                assert_eq!(lru.max_entries, 10);
                assert_eq!(lru.ttl, Duration::from_secs(5));
            }
            other => panic!("expected an lru cache, got {other:?}"),
        }
        assert_eq!(pipeline.relationship_loading.strategy, LoadStrategy::Eager);
        assert_eq!(pipeline.relationship_loading.required, vec!["customer"]);
        assert_eq!(pipeline.relationship_loading.max_depth, 2);
        assert_eq!(config.tracing.format, LogFormat::Compact);
        Ok(())
    });
}

#[test]
#[serial]
fn environment_alone_is_enough() {
    Jail::expect_with(|jail| {
        jail.set_env("STRATA_PIPELINE__CHUNK_SIZE", "42");
        jail.set_env("STRATA_PIPELINE__MIN_CHUNK_SIZE", "7");
        jail.set_env("STRATA_PIPELINE__CONSUMER_TIMEOUT_MS", "1500");

        let config =
            PipelineServiceConfig::load_from_path("missing.yaml").expect("config loads");
        assert_eq!(config.pipeline.chunk_size, 42);
        assert_eq!(config.pipeline.min_chunk_size, 7);
        assert_eq!(
            config.pipeline.consumer_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.pipeline.cache, CacheConfig::default());
        Ok(())
    });
}

#[test]
#[serial]
fn caching_can_be_disabled() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "service.yaml",
            r#"
            pipeline:
                cache: nop
            "#,
        )?;
        let config = PipelineServiceConfig::load_from_path("service.yaml").expect("config loads");
        assert_eq!(config.pipeline.cache, CacheConfig::Nop);
        Ok(())
    });
}

#[test]
#[serial]
fn nonsensical_values_are_reported_not_panicked() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "service.yaml",
            r#"
            pipeline:
                chunk_size: 10
                min_chunk_size: 20
            "#,
        )?;
        let error = PipelineServiceConfig::load_from_path("service.yaml")
            .expect_err("min chunk size above chunk size");
        assert!(matches!(error, ConfigError::Invalid(_)));

        jail.create_file("broken.yaml", "pipeline:\n    chunk_size: many\n")?;
        let error = PipelineServiceConfig::load_from_path("broken.yaml")
            .expect_err("chunk size is not a number");
        assert!(matches!(error, ConfigError::Extract(_)));
        Ok(())
    });
}
