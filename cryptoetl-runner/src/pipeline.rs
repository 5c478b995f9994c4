//! Per-key extract → transform → stage → load, and the batch-all mode.
//!
//! Every key is processed independently: an extraction, staging, or load
//! failure for one key is reported as that key's REJECTED or ROLLED_BACK
//! result and never stops the others. Batch-all mode fans keys out over a
//! rayon parallel iterator; the loader's key locks keep same-key work serial.

use crate::config::{ConfigError, Requirements, RunSettings, StoreSettings};
use chrono::{DateTime, Utc};
use cryptoetl_core::data::batch_file::list_batches;
use cryptoetl_core::data::{
    analysis_frame, read_batch, transform, write_analysis_parquet, write_batch, AnalysisError,
    BatchFileError, CircuitBreaker, CryptoCompareProvider, ExtractError, MarketDataProvider,
    StagedBatch,
};
use cryptoetl_core::domain::{InvalidWindow, LoadBatch, SeriesKey};
use cryptoetl_core::load::{
    AuditSink, BackupManager, FanoutAudit, JsonlAudit, KeyLocks, LoadResult, Loader, MemoryStore,
    PostgresStore, StoreError, TargetStore, TracingAudit,
};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors building a pipeline. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("target store: {0}")]
    Store(#[from] StoreError),

    #[error("market data provider: {0}")]
    Provider(#[from] ExtractError),
}

/// Errors producing a staged batch for one key.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("no market data provider configured")]
    NoProvider,

    #[error(transparent)]
    Window(#[from] InvalidWindow),

    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    BatchFile(#[from] BatchFileError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("could not read committed rows: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Per-key results of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub results: Vec<LoadResult>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(LoadResult::is_success)
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    pub fn rows_inserted(&self) -> usize {
        self.results.iter().map(|r| r.rows_inserted).sum()
    }

    /// 0 when every key committed (or previewed), 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() {
            0
        } else {
            1
        }
    }
}

pub struct Pipeline {
    settings: RunSettings,
    provider: Option<Arc<dyn MarketDataProvider>>,
    loader: Loader,
}

impl Pipeline {
    pub fn new(
        settings: RunSettings,
        provider: Option<Arc<dyn MarketDataProvider>>,
        store: Arc<dyn TargetStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let loader = Loader::new(
            store,
            BackupManager::new(&settings.backup_dir),
            audit,
            KeyLocks::new(),
        );
        Self {
            settings,
            provider,
            loader,
        }
    }

    /// Build the production collaborators the command needs.
    pub fn from_settings(settings: RunSettings, needs: Requirements) -> Result<Self, PipelineError> {
        let provider: Option<Arc<dyn MarketDataProvider>> = if needs.api {
            let breaker = Arc::new(CircuitBreaker::default_provider());
            Some(Arc::new(CryptoCompareProvider::new(
                settings.provider.clone(),
                breaker,
            )?))
        } else {
            None
        };

        let store: Arc<dyn TargetStore> = if needs.store {
            let store = build_store(&settings.store)?;
            store.ensure_schema()?;
            store
        } else {
            Arc::new(MemoryStore::new())
        };

        let audit = build_audit(&settings);
        Ok(Self::new(settings, provider, store, audit))
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Fetch, normalize, and stage one key's window.
    pub fn extract(&self, key: SeriesKey, now: DateTime<Utc>) -> Result<StagedBatch, StageError> {
        let provider = self.provider.as_ref().ok_or(StageError::NoProvider)?;
        let window = self.settings.window_for(key.interval, now)?;

        let span = tracing::info_span!("extract", key = %key, window = %window);
        let _enter = span.enter();

        if !provider.is_available() {
            tracing::error!(provider = provider.name(), "provider unavailable; not fetching");
            return Err(ExtractError::CircuitBreakerTripped.into());
        }
        let fetched = provider.fetch(key.asset, key.interval, window)?;
        tracing::info!(
            provider = provider.name(),
            records = fetched.records.len(),
            pages = fetched.pages,
            "fetched"
        );

        let output = transform(key, window, &fetched.records);
        if output.dropped.total() > 0 {
            tracing::info!(
                zero_price = output.dropped.zero_price,
                non_finite = output.dropped.non_finite,
                outside_window = output.dropped.outside_window,
                duplicate = output.dropped.duplicate,
                "dropped records during normalization"
            );
        }

        Ok(write_batch(
            &self.settings.staging_dir,
            key,
            window,
            &output.rows,
        )?)
    }

    /// Commit, or preview when the run is a dry run.
    pub fn load_batch(&self, batch: LoadBatch) -> LoadResult {
        if self.settings.dry_run {
            self.loader.preview(batch)
        } else {
            self.loader.load(batch)
        }
    }

    /// Load a staged file. Errors only when the file itself is unreadable.
    pub fn load_file(&self, path: &Path) -> Result<LoadResult, BatchFileError> {
        Ok(self.load_batch(read_batch(path)?))
    }

    /// Load a staged file that must belong to `key`.
    pub fn load_staged(&self, key: SeriesKey, path: &Path) -> LoadResult {
        let source = path.display().to_string();
        match read_batch(path) {
            Ok(batch) if batch.key() == key => self.load_batch(batch),
            Ok(batch) => LoadResult::rejected_before_load(
                key,
                source,
                format!("staged file holds {}, expected {key}", batch.key()),
            ),
            Err(e) => {
                tracing::error!(key = %key, error = %e, "staged batch unreadable");
                LoadResult::rejected_before_load(key, source, e)
            }
        }
    }

    /// Load the newest staged batch for `key`.
    pub fn load_latest(&self, key: SeriesKey) -> LoadResult {
        match list_batches(&self.settings.staging_dir, key) {
            Ok(paths) => match paths.first() {
                Some(path) => self.load_staged(key, path),
                None => LoadResult::rejected_before_load(
                    key,
                    self.settings.staging_dir.display().to_string(),
                    "no staged batch found",
                ),
            },
            Err(e) => LoadResult::rejected_before_load(
                key,
                self.settings.staging_dir.display().to_string(),
                e,
            ),
        }
    }

    /// Extract then load one key. Never fails; failures become the result.
    pub fn run_key(&self, key: SeriesKey, now: DateTime<Utc>) -> LoadResult {
        match self.extract(key, now) {
            Ok(staged) => self.load_staged(key, &staged.path),
            Err(e) => {
                tracing::error!(key = %key, error = %e, "extraction failed");
                let source = self
                    .provider
                    .as_ref()
                    .map(|p| p.name().to_string())
                    .unwrap_or_default();
                LoadResult::rejected_before_load(key, source, e)
            }
        }
    }

    /// Extract every configured key in parallel.
    pub fn extract_all(&self, now: DateTime<Utc>) -> Vec<(SeriesKey, Result<StagedBatch, StageError>)> {
        self.settings
            .keys
            .par_iter()
            .map(|&key| (key, self.extract(key, now)))
            .collect()
    }

    /// Load the newest staged batch of every configured key in parallel.
    pub fn load_all_latest(&self) -> RunSummary {
        self.summarize(
            self.settings
                .keys
                .par_iter()
                .map(|&key| self.load_latest(key))
                .collect(),
        )
    }

    /// Extract and load every configured key in parallel.
    pub fn run_all(&self, now: DateTime<Utc>) -> RunSummary {
        self.summarize(
            self.settings
                .keys
                .par_iter()
                .map(|&key| self.run_key(key, now))
                .collect(),
        )
    }

    fn summarize(&self, results: Vec<LoadResult>) -> RunSummary {
        let summary = RunSummary {
            dry_run: self.settings.dry_run,
            results,
        };
        if summary.all_succeeded() {
            tracing::info!(
                keys = summary.results.len(),
                inserted = summary.rows_inserted(),
                "run finished"
            );
        } else {
            tracing::error!(
                keys = summary.results.len(),
                failed = summary.failed(),
                "run finished with failures"
            );
        }
        summary
    }

    /// Write the committed rows of `key` with percentage-change columns to a
    /// Parquet file. Returns the number of rows written.
    pub fn export_analysis(&self, key: SeriesKey, path: &Path) -> Result<usize, ExportError> {
        let rows = self.loader.store().read_rows(key)?;
        let mut frame = analysis_frame(&rows)?;
        write_analysis_parquet(path, &mut frame)?;
        tracing::info!(key = %key, path = %path.display(), rows = rows.len(), "analysis exported");
        Ok(rows.len())
    }
}

pub fn build_store(settings: &StoreSettings) -> Result<Arc<dyn TargetStore>, StoreError> {
    match settings {
        StoreSettings::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreSettings::Postgres {
            url,
            pool_max_size,
            table,
        } => Ok(Arc::new(PostgresStore::with_table(
            url,
            *pool_max_size,
            table,
        )?)),
    }
}

/// Tracing always; the JSONL file too when `paths.audit_log` is set.
pub fn build_audit(settings: &RunSettings) -> Arc<dyn AuditSink> {
    let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAudit)];
    let mut fanout = FanoutAudit::new(sinks);
    if let Some(path) = &settings.audit_log {
        fanout.push(Arc::new(JsonlAudit::new(path)));
    }
    Arc::new(fanout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoetl_core::domain::{Asset, IntervalKind};
    use cryptoetl_core::load::LoadStatus;

    fn result(status: LoadStatus) -> LoadResult {
        let mut r = LoadResult::rejected_before_load(
            SeriesKey::new(Asset::Btc, IntervalKind::Daily),
            "x",
            "e",
        );
        r.status = status;
        r.rows_inserted = 2;
        r
    }

    #[test]
    fn exit_code_reflects_every_key() {
        let ok = RunSummary {
            dry_run: false,
            results: vec![result(LoadStatus::Committed), result(LoadStatus::Committed)],
        };
        assert_eq!(ok.exit_code(), 0);
        assert_eq!(ok.rows_inserted(), 4);

        let mixed = RunSummary {
            dry_run: false,
            results: vec![result(LoadStatus::Committed), result(LoadStatus::RolledBack)],
        };
        assert_eq!(mixed.exit_code(), 1);
        assert_eq!(mixed.failed(), 1);

        let preview = RunSummary {
            dry_run: true,
            results: vec![result(LoadStatus::Previewed)],
        };
        assert_eq!(preview.exit_code(), 0);
    }
}
