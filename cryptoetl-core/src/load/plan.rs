//! Dry-run classification.
//!
//! A pure function from (eligible batch, current target rows) to a LoadPlan.
//! Preview reports the plan; commit applies exactly `plan.inserts()`.

use super::validate::EligibleBatch;
use crate::domain::{CanonicalRow, NaturalKey, SeriesKey};
use serde::Serialize;
use std::collections::HashMap;

/// What the commit does with one batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Insert,
    /// Key already stored with identical values.
    Skip,
    /// Key already stored with different values. Still skipped.
    SkipDrifted,
}

/// A skipped row whose stored values differ from the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub key: NaturalKey,
    pub stored: CanonicalRow,
    pub incoming: CanonicalRow,
}

/// Insert/skip classification for one eligible batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    key: SeriesKey,
    actions: Vec<RowAction>,
    inserts: Vec<CanonicalRow>,
    drifts: Vec<Drift>,
}

impl LoadPlan {
    pub fn key(&self) -> SeriesKey {
        self.key
    }

    /// One action per batch row, in batch order.
    pub fn actions(&self) -> &[RowAction] {
        &self.actions
    }

    /// Rows the commit must insert, in batch order.
    pub fn inserts(&self) -> &[CanonicalRow] {
        &self.inserts
    }

    pub fn drifts(&self) -> &[Drift] {
        &self.drifts
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.len()
    }

    /// Skipped rows, drifted ones included.
    pub fn skip_count(&self) -> usize {
        self.actions.len() - self.inserts.len()
    }

    pub fn drift_count(&self) -> usize {
        self.drifts.len()
    }
}

/// Classify every row of `batch` against the rows currently stored for its key.
pub fn classify(batch: &EligibleBatch, existing: &[CanonicalRow]) -> LoadPlan {
    let stored: HashMap<NaturalKey, &CanonicalRow> =
        existing.iter().map(|r| (r.key(), r)).collect();

    let mut actions = Vec::with_capacity(batch.len());
    let mut inserts = Vec::new();
    let mut drifts = Vec::new();

    for row in batch.rows() {
        match stored.get(&row.key()) {
            None => {
                actions.push(RowAction::Insert);
                inserts.push(row.clone());
            }
            Some(current) if current.same_values(row) => actions.push(RowAction::Skip),
            Some(current) => {
                actions.push(RowAction::SkipDrifted);
                drifts.push(Drift {
                    key: row.key(),
                    stored: (*current).clone(),
                    incoming: row.clone(),
                });
            }
        }
    }

    LoadPlan {
        key: batch.key(),
        actions,
        inserts,
        drifts,
    }
}
