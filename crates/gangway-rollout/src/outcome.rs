//! Stage and run outcomes.
//!
//! A run records exactly one `StageResult` per unit for every stage the
//! unit entered, aggregated into `StageReport`s, and one `RunOutcome`
//! at the top.

use std::collections::HashSet;

use serde::Serialize;

use gangway_core::Unit;

use crate::error::{Stage, UnitError};

/// How a single unit fared in a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// The unit declares no check endpoint and skipped version checks.
    /// Never a failure.
    NoCheckConfigured,
    Failed(UnitError),
}

/// Per-unit result of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageResult {
    pub unit: String,
    pub outcome: Outcome,
}

impl StageResult {
    pub fn succeeded(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            outcome: Outcome::Succeeded,
        }
    }

    pub fn no_check_configured(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            outcome: Outcome::NoCheckConfigured,
        }
    }

    pub fn failed(error: UnitError) -> Self {
        Self {
            unit: error.unit().to_string(),
            outcome: Outcome::Failed(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }

    pub fn error(&self) -> Option<&UnitError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// All unit results of one stage, in completion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub results: Vec<StageResult>,
    /// Whether any unit failed (or timed out) this stage.
    pub failed: bool,
}

impl StageReport {
    pub fn new(stage: Stage, results: Vec<StageResult>) -> Self {
        let failed = results.iter().any(StageResult::is_failure);
        Self {
            stage,
            results,
            failed,
        }
    }

    /// Names of units that did not fail this stage.
    pub fn succeeded_units(&self) -> HashSet<String> {
        self.results
            .iter()
            .filter(|r| !r.is_failure())
            .map(|r| r.unit.clone())
            .collect()
    }

    /// Names of units that failed this stage.
    pub fn failed_units(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| r.unit.as_str())
            .collect()
    }

    /// Whether any unit ran out of time in this stage.
    pub fn timed_out(&self) -> bool {
        self.results
            .iter()
            .filter_map(StageResult::error)
            .any(UnitError::is_timeout)
    }

    pub fn result_for(&self, unit: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.unit == unit)
    }
}

/// How far a rollback got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Previous version confirmed live and new revision drained.
    Confirmed,
    /// Previous version confirmed live; new revision still draining.
    Draining,
    /// Revert was applied but the previous version was never observed.
    Unconfirmed,
    /// Revert itself failed.
    Failed,
}

impl RollbackStatus {
    /// Whether the previous version is known to be serving again.
    pub fn is_recovered(&self) -> bool {
        matches!(self, RollbackStatus::Confirmed | RollbackStatus::Draining)
    }
}

/// Everything a rollback did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    /// Stage whose failure triggered the rollback.
    pub trigger: Stage,
    /// Units that were rolled back.
    pub units: Vec<String>,
    pub revert: StageReport,
    pub verify_deployed: Option<StageReport>,
    pub verify_drained: Option<StageReport>,
    pub status: RollbackStatus,
}

/// Final verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage passed for every unit.
    Succeeded,
    /// New version confirmed live but old resources did not drain.
    Degraded,
    /// Deploy failed for every unit; nothing changed, nothing to roll back.
    Failed,
    /// Run failed and the rollback restored the previous version.
    RolledBack,
    /// Run failed and the rollback could not be confirmed. Needs an operator.
    RollbackFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Degraded => "degraded",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled back",
            RunStatus::RollbackFailed => "rollback failed",
        }
    }

    /// Whether the target version ended up live.
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Degraded)
    }
}

/// Aggregate of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub deploy: StageReport,
    pub verify_deployed: Option<StageReport>,
    pub verify_drained: Option<StageReport>,
    pub rollback: Option<RollbackOutcome>,
    /// Units as they stand at the end of the run.
    pub units: Vec<Unit>,
}

impl RunOutcome {
    /// The stage report that decided a non-success status.
    pub fn deciding_stage(&self) -> Option<&StageReport> {
        match self.status {
            RunStatus::Succeeded => None,
            RunStatus::Degraded => self.verify_drained.as_ref(),
            RunStatus::Failed => Some(&self.deploy),
            RunStatus::RolledBack | RunStatus::RollbackFailed => {
                match self.rollback.as_ref().map(|r| r.trigger) {
                    Some(Stage::VerifyDeployed) => self.verify_deployed.as_ref(),
                    _ => Some(&self.deploy),
                }
            }
        }
    }

    /// Whether the deciding stage failed because its deadline elapsed.
    pub fn timed_out(&self) -> bool {
        self.deciding_stage().is_some_and(StageReport::timed_out)
    }

    /// Iterate over every stage report, rollback included, in run order.
    pub fn reports(&self) -> impl Iterator<Item = &StageReport> {
        let rollback = self.rollback.iter().flat_map(|r| {
            std::iter::once(&r.revert)
                .chain(r.verify_deployed.iter())
                .chain(r.verify_drained.iter())
        });
        std::iter::once(&self.deploy)
            .chain(self.verify_deployed.iter())
            .chain(self.verify_drained.iter())
            .chain(rollback)
    }
}
