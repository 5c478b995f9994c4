//! Per-batch load state machine.
//!
//! ```text
//! RECEIVED → VALIDATED → BACKED_UP → DRY_RUN_OK → COMMITTING → COMMITTED
//!     ↓          ↓  ↘         ↓           ↓             ↓
//! REJECTED   REJECTED  DRY_RUN_OK    REJECTED   PREVIEWED   ROLLED_BACK
//!                      (preview)
//! ```
//!
//! Every transition is checked and recorded in the trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadState {
    Received,
    Validated,
    BackedUp,
    DryRunOk,
    Committing,
    Committed,
    Rejected,
    RolledBack,
    Previewed,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::Received => "RECEIVED",
            LoadState::Validated => "VALIDATED",
            LoadState::BackedUp => "BACKED_UP",
            LoadState::DryRunOk => "DRY_RUN_OK",
            LoadState::Committing => "COMMITTING",
            LoadState::Committed => "COMMITTED",
            LoadState::Rejected => "REJECTED",
            LoadState::RolledBack => "ROLLED_BACK",
            LoadState::Previewed => "PREVIEWED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadState::Committed | LoadState::Rejected | LoadState::RolledBack | LoadState::Previewed
        )
    }

    /// The legal edges of the machine.
    pub fn can_transition_to(self, next: LoadState) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, BackedUp)
                | (Validated, DryRunOk)
                | (Validated, Rejected)
                | (BackedUp, DryRunOk)
                | (BackedUp, Rejected)
                | (DryRunOk, Committing)
                | (DryRunOk, Previewed)
                | (Committing, Committed)
                | (Committing, RolledBack)
        )
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid load transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: LoadState,
    pub to: LoadState,
}

/// One recorded edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: LoadState,
    pub to: LoadState,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// Current state plus the trail that led to it.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: LoadState,
    trail: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: LoadState::Received,
            trail: Vec::new(),
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn trail(&self) -> &[Transition] {
        &self.trail
    }

    pub fn into_trail(self) -> Vec<Transition> {
        self.trail
    }

    /// Move to `to`, recording the edge. Illegal edges leave the state unchanged.
    pub fn advance(
        &mut self,
        to: LoadState,
        detail: impl Into<String>,
    ) -> Result<&Transition, InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.trail.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
            detail: detail.into(),
        });
        self.state = to;
        Ok(&self.trail[self.trail.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let mut sm = StateMachine::new();
        for next in [
            LoadState::Validated,
            LoadState::BackedUp,
            LoadState::DryRunOk,
            LoadState::Committing,
            LoadState::Committed,
        ] {
            sm.advance(next, "").unwrap();
        }
        assert_eq!(sm.state(), LoadState::Committed);
        assert!(sm.state().is_terminal());
        assert_eq!(sm.trail().len(), 5);
        assert_eq!(sm.trail()[0].from, LoadState::Received);
    }

    #[test]
    fn skipping_a_step_is_rejected() {
        let mut sm = StateMachine::new();
        sm.advance(LoadState::Validated, "").unwrap();
        let err = sm.advance(LoadState::Committing, "").unwrap_err();
        assert_eq!(err.from, LoadState::Validated);
        assert_eq!(err.to, LoadState::Committing);
        assert_eq!(sm.state(), LoadState::Validated);
        assert_eq!(sm.trail().len(), 1);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use LoadState::*;
        let all = [
            Received, Validated, BackedUp, DryRunOk, Committing, Committed, Rejected, RolledBack,
            Previewed,
        ];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn rollback_only_from_committing() {
        use LoadState::*;
        assert!(Committing.can_transition_to(RolledBack));
        assert!(!DryRunOk.can_transition_to(RolledBack));
        assert!(!BackedUp.can_transition_to(RolledBack));
    }

    #[test]
    fn serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&LoadState::DryRunOk).unwrap(),
            "\"DRY_RUN_OK\""
        );
    }
}
