//! Gangway orchestration engine: staged rollout, verification, automatic
//! rollback.
//!
//! Given units already pointed at a target version, the engine triggers
//! the update, confirms the new version actually serves traffic, waits for
//! the old revision to drain, and drives every affected unit back to its
//! previous version when a stage fails.
//!
//! # Components
//!
//! - **`executor`**: Concurrent fan-out/fan-in with a shared stage deadline
//! - **`stages`**: Deploy, revert, verify-deployed, verify-drained
//! - **`rollback`**: Swap version pointers and re-drive the stages
//! - **`controller`**: `Orchestrator`: stage sequencing and rollback decisions
//! - **`outcome`**: Per-unit, per-stage and per-run results
//! - **`error`**: `UnitError` taxonomy

pub mod controller;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod rollback;
pub mod stages;

pub use controller::Orchestrator;
pub use error::{Operation, Stage, UnitError};
pub use executor::{CheckError, StageConfig, StageExecutor};
pub use outcome::{
    Outcome, RollbackOutcome, RollbackStatus, RunOutcome, RunStatus, StageReport, StageResult,
};
pub use stages::{MIN_VERSION_TOKEN_LEN, matches_version};
