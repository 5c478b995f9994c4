//! Loader: drives one batch through the load state machine.
//!
//! `load` runs validate → snapshot → dry run → commit, restoring the snapshot
//! when a failed commit may have left the series changed. `preview` stops
//! after the dry run and never writes anything.
//!
//! Neither entry point returns an error: every outcome, including programming
//! errors in the state machine, is reported as a [`LoadResult`].

use super::audit::{AuditSink, LoadEvent};
use super::backup::{BackupError, BackupManager, BackupSnapshot};
use super::lock::KeyLocks;
use super::plan::{classify, LoadPlan};
use super::result::{LoadResult, LoadStatus};
use super::state::{InvalidTransition, LoadState, StateMachine};
use super::store::{StoreError, TargetStore};
use super::validate::{self, EligibleBatch, ValidationFinding};
use crate::domain::{CanonicalRow, LoadBatch, SeriesKey};
use std::sync::Arc;

#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn TargetStore>,
    backups: BackupManager,
    audit: Arc<dyn AuditSink>,
    locks: KeyLocks,
}

impl Loader {
    /// Loaders that may touch the same keys concurrently must share `locks`.
    pub fn new(
        store: Arc<dyn TargetStore>,
        backups: BackupManager,
        audit: Arc<dyn AuditSink>,
        locks: KeyLocks,
    ) -> Self {
        Self {
            store,
            backups,
            audit,
            locks,
        }
    }

    pub fn store(&self) -> &dyn TargetStore {
        self.store.as_ref()
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Validate, back up, dry-run and commit one batch.
    pub fn load(&self, batch: LoadBatch) -> LoadResult {
        let key = batch.key();
        let span = tracing::info_span!("load", key = %key, source = %batch.source);
        let _enter = span.enter();

        let mut run = Run::new(self.audit.as_ref(), key, batch.source.clone());
        let outcome = self
            .drive_commit(&mut run, batch)
            .unwrap_or_else(internal_error);
        run.finish(outcome)
    }

    /// Validate and dry-run one batch against live target state. No backup is
    /// taken and nothing is written.
    pub fn preview(&self, batch: LoadBatch) -> LoadResult {
        let key = batch.key();
        let span = tracing::info_span!("preview", key = %key, source = %batch.source);
        let _enter = span.enter();

        let mut run = Run::new(self.audit.as_ref(), key, batch.source.clone());
        let outcome = self
            .drive_preview(&mut run, batch)
            .unwrap_or_else(internal_error);
        run.finish(outcome)
    }

    /// Restore a snapshot while holding its key's lock.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> Result<usize, BackupError> {
        let _guard = self.locks.acquire(snapshot.key);
        self.backups.restore(self.store.as_ref(), snapshot)
    }

    fn drive_commit(&self, run: &mut Run<'_>, batch: LoadBatch) -> Result<Outcome, InvalidTransition> {
        let Some(eligible) = run.validate(batch)? else {
            return Ok(Outcome::failed(run.rejection.take()));
        };
        let key = eligible.key();

        let _guard = self.locks.acquire(key);

        let snapshot = match self.backups.snapshot(self.store.as_ref(), key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "backup failed; nothing was written");
                let detail = format!("backup failed: {e}");
                run.advance(LoadState::Rejected, detail.clone())?;
                return Ok(Outcome::failed(Some(detail)));
            }
        };
        run.record_backup(&snapshot);
        run.advance(LoadState::BackedUp, snapshot.path.display().to_string())?;

        let existing = match self.store.read_rows(key) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "could not read target state for dry run");
                let detail = format!("dry run failed: {e}");
                run.advance(LoadState::Rejected, detail.clone())?;
                return Ok(Outcome::failed(Some(detail)));
            }
        };
        let plan = classify(&eligible, &existing);
        run.dry_run_ok(&plan)?;

        run.advance(
            LoadState::Committing,
            format!("inserting {} row(s)", plan.insert_count()),
        )?;
        let attempt = if plan.inserts().is_empty() {
            Ok(0)
        } else {
            self.store.insert_new(key, plan.inserts())
        };

        match attempt {
            Ok(inserted) if inserted == plan.insert_count() => {
                run.advance(
                    LoadState::Committed,
                    format!(
                        "{} inserted, {} skipped",
                        inserted,
                        plan.skip_count()
                    ),
                )?;
                Ok(Outcome::planned(&plan))
            }
            Ok(inserted) => {
                let err = StoreError::Indeterminate(format!(
                    "store inserted {inserted} row(s), plan had {}",
                    plan.insert_count()
                ));
                self.roll_back(run, &snapshot, &existing, err)
            }
            Err(err) => self.roll_back(run, &snapshot, &existing, err),
        }
    }

    /// After a determinate failure the store's own transaction has rolled
    /// back; rows another writer committed meanwhile stay. Only an
    /// indeterminate outcome restores the snapshot.
    fn roll_back(
        &self,
        run: &mut Run<'_>,
        snapshot: &BackupSnapshot,
        before: &[CanonicalRow],
        err: StoreError,
    ) -> Result<Outcome, InvalidTransition> {
        tracing::error!(error = %err, "commit failed");
        let mut detail = format!("commit failed: {err}");

        if err.is_indeterminate() {
            match self.backups.restore(self.store.as_ref(), snapshot) {
                Ok(rows) => {
                    detail.push_str(&format!(
                        "; restored {rows} row(s) from {}",
                        snapshot.path.display()
                    ));
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        snapshot = %snapshot.path.display(),
                        "restore failed; target may need manual restore"
                    );
                    detail.push_str(&format!("; restore failed: {e}"));
                }
            }
        } else {
            match self.store.read_rows(snapshot.key) {
                Ok(after) if after != before => tracing::warn!(
                    before = before.len(),
                    after = after.len(),
                    "series changed concurrently; leaving it untouched"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "could not re-read target after failed commit"),
            }
        }

        run.advance(LoadState::RolledBack, detail.clone())?;
        Ok(Outcome::failed(Some(detail)))
    }

    fn drive_preview(&self, run: &mut Run<'_>, batch: LoadBatch) -> Result<Outcome, InvalidTransition> {
        let Some(eligible) = run.validate(batch)? else {
            return Ok(Outcome::failed(run.rejection.take()));
        };

        let existing = match self.store.read_rows(eligible.key()) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "could not read target state for dry run");
                let detail = format!("dry run failed: {e}");
                run.advance(LoadState::Rejected, detail.clone())?;
                return Ok(Outcome::failed(Some(detail)));
            }
        };
        let plan = classify(&eligible, &existing);
        run.dry_run_ok(&plan)?;
        run.advance(LoadState::Previewed, "no changes written")?;
        Ok(Outcome::planned(&plan))
    }
}

fn internal_error(e: InvalidTransition) -> Outcome {
    tracing::error!(error = %e, "load aborted");
    Outcome::failed(Some(e.to_string()))
}

/// Counts and error text carried into the final result.
#[derive(Debug, Default)]
struct Outcome {
    inserted: usize,
    skipped: usize,
    drifted: usize,
    error: Option<String>,
}

impl Outcome {
    fn planned(plan: &LoadPlan) -> Self {
        Self {
            inserted: plan.insert_count(),
            skipped: plan.skip_count(),
            drifted: plan.drift_count(),
            error: None,
        }
    }

    fn failed(error: Option<String>) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }
}

/// Per-call bookkeeping: the state machine plus everything the result reports.
struct Run<'a> {
    audit: &'a dyn AuditSink,
    key: SeriesKey,
    source: String,
    machine: StateMachine,
    findings: Vec<ValidationFinding>,
    backup: Option<BackupSnapshot>,
    rejection: Option<String>,
}

impl<'a> Run<'a> {
    fn new(audit: &'a dyn AuditSink, key: SeriesKey, source: String) -> Self {
        Self {
            audit,
            key,
            source,
            machine: StateMachine::new(),
            findings: Vec::new(),
            backup: None,
            rejection: None,
        }
    }

    fn advance(&mut self, to: LoadState, detail: impl Into<String>) -> Result<(), InvalidTransition> {
        let transition = self.machine.advance(to, detail)?.clone();
        tracing::debug!(from = %transition.from, to = %transition.to, "transition");
        self.audit.record(&LoadEvent::Transition {
            key: self.key,
            source: self.source.clone(),
            transition,
        });
        Ok(())
    }

    /// RECEIVED → VALIDATED, or → REJECTED with every finding kept.
    fn validate(&mut self, batch: LoadBatch) -> Result<Option<EligibleBatch>, InvalidTransition> {
        match validate::check(batch) {
            Ok(eligible) => {
                self.record_findings(eligible.warnings().to_vec());
                self.advance(
                    LoadState::Validated,
                    format!(
                        "{} row(s), {} warning(s)",
                        eligible.len(),
                        eligible.warnings().len()
                    ),
                )?;
                Ok(Some(eligible))
            }
            Err(e) => {
                tracing::warn!(fatal = e.fatal_count, "batch rejected by validation");
                self.record_findings(e.findings.clone());
                let detail = e.to_string();
                self.advance(LoadState::Rejected, detail.clone())?;
                self.rejection = Some(detail);
                Ok(None)
            }
        }
    }

    fn record_findings(&mut self, findings: Vec<ValidationFinding>) {
        for finding in &findings {
            self.audit.record(&LoadEvent::Finding {
                key: self.key,
                source: self.source.clone(),
                finding: finding.clone(),
            });
        }
        self.findings = findings;
    }

    fn record_backup(&mut self, snapshot: &BackupSnapshot) {
        self.audit.record(&LoadEvent::Backup {
            key: self.key,
            snapshot: snapshot.clone(),
        });
        self.backup = Some(snapshot.clone());
    }

    fn dry_run_ok(&mut self, plan: &LoadPlan) -> Result<(), InvalidTransition> {
        for drift in plan.drifts() {
            self.audit.record(&LoadEvent::Drift {
                key: self.key,
                drift: drift.clone(),
            });
        }
        if plan.drift_count() > 0 {
            tracing::warn!(
                drifted = plan.drift_count(),
                "stored rows differ from batch; keeping stored values"
            );
        }
        self.advance(
            LoadState::DryRunOk,
            format!(
                "{} to insert, {} to skip ({} drifted)",
                plan.insert_count(),
                plan.skip_count(),
                plan.drift_count()
            ),
        )
    }

    fn finish(self, outcome: Outcome) -> LoadResult {
        let state = self.machine.state();
        let status = LoadStatus::from_terminal(state).unwrap_or(LoadStatus::Rejected);
        let result = LoadResult {
            key: self.key,
            source: self.source,
            status,
            rows_inserted: outcome.inserted,
            rows_skipped_as_duplicate: outcome.skipped,
            rows_drifted: outcome.drifted,
            validation_findings: self.findings,
            backup_reference: None,
            error: outcome.error,
            transitions: self.machine.into_trail(),
        }
        .with_backup(self.backup.as_ref());

        match result.status {
            LoadStatus::Committed | LoadStatus::Previewed => tracing::info!(
                status = %result.status,
                inserted = result.rows_inserted,
                skipped = result.rows_skipped_as_duplicate,
                "load finished"
            ),
            _ => tracing::error!(
                status = %result.status,
                error = result.error.as_deref().unwrap_or(""),
                "load failed"
            ),
        }
        self.audit.record(&LoadEvent::Completed {
            result: result.clone(),
        });
        result
    }
}
