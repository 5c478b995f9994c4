//! The load stage: validation, backup, dry run, atomic commit, rollback.

pub mod audit;
pub mod backup;
pub mod loader;
pub mod lock;
pub mod plan;
pub mod result;
pub mod state;
pub mod store;
pub mod validate;

pub use audit::{AuditSink, FanoutAudit, JsonlAudit, LoadEvent, RecordingAudit, TracingAudit};
pub use backup::{BackupError, BackupManager, BackupSnapshot};
pub use loader::Loader;
pub use lock::{KeyGuard, KeyLocks};
pub use plan::{classify, Drift, LoadPlan, RowAction};
pub use result::{LoadResult, LoadStatus};
pub use state::{InvalidTransition, LoadState, StateMachine, Transition};
pub use store::{MemoryStore, PostgresStore, StoreError, TargetStore};
pub use validate::{
    check, validate, EligibleBatch, FindingKind, Severity, ValidationError, ValidationFinding,
};
