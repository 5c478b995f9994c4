//! cryptoetl runner: configuration and pipeline orchestration.
//!
//! This crate builds on `cryptoetl-core` to provide:
//! - TOML configuration resolved into immutable run settings
//! - Per-key extract → transform → stage → load
//! - Batch-all mode over every configured key, in parallel
//! - Result and snapshot tables for the CLI

pub mod config;
pub mod pipeline;
pub mod report;

pub use config::{
    ConfigError, PipelineConfig, Requirements, RunSettings, StoreKind, StoreSettings,
    DEFAULT_CONFIG_PATH, DRY_RUN_ENV,
};
pub use pipeline::{
    build_audit, build_store, ExportError, Pipeline, PipelineError, RunSummary, StageError,
};
pub use report::{results_table, snapshots_table, summary_table};

use anyhow::Context;
use std::path::Path;

/// Load `config_path`, build the production pipeline, and run every
/// configured key.
pub fn run_config_file(config_path: &Path, dry_run: bool) -> anyhow::Result<RunSummary> {
    let config = PipelineConfig::from_path(config_path)?;
    let settings = config
        .resolve(Requirements::ALL)
        .with_context(|| format!("resolving {}", config_path.display()))?
        .with_dry_run(dry_run);
    let pipeline = Pipeline::from_settings(settings, Requirements::ALL)?;
    Ok(pipeline.run_all(chrono::Utc::now()))
}

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn pipeline_is_send_sync() {
        assert_send::<Pipeline>();
        assert_sync::<Pipeline>();
    }

    #[test]
    fn settings_are_send_sync() {
        assert_send::<RunSettings>();
        assert_sync::<RunSettings>();
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
    }

    #[test]
    fn summary_is_send_sync() {
        assert_send::<RunSummary>();
        assert_sync::<RunSummary>();
    }
}
